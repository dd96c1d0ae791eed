/// Knobs for a [`WritableFileWriter`](crate::WritableFileWriter) and the
/// file opened beneath it.
#[derive(Clone)]
pub struct WriterOptions {
    /// Upper bound for the internal write buffer. The buffer starts small
    /// and doubles on demand up to this limit.
    pub max_buffer_size: usize,
    /// If nonzero, issue a background range-sync for every this many bytes
    /// of new data once the file has grown past the holdback window.
    /// Buffered mode only; 0 disables.
    pub bytes_per_sync: u64,
    /// Open the file with direct I/O, bypassing the OS page cache. Writes
    /// become positioned and alignment-constrained.
    pub use_direct_io: bool,
    /// Compute handoff checksums when delivering data to the file.
    pub perform_data_verification: bool,
    /// Track a running CRC32C over the buffered data so whole-buffer
    /// writes can hand off a single precomputed checksum.
    pub buffered_data_with_checksum: bool,
    /// Schedule the file's I/O on the high-priority lane where the
    /// backing file system distinguishes.
    pub high_priority: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            max_buffer_size: 1 << 20,
            bytes_per_sync: 0,
            use_direct_io: false,
            perform_data_verification: false,
            buffered_data_with_checksum: false,
            high_priority: false,
        }
    }
}
