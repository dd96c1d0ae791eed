use std::sync::Arc;
use std::time::Instant;

use crc32c::{crc32c, crc32c_append, crc32c_combine};

use super::aligned_buffer::{truncate_to_page_boundary, AlignedBuffer, DEFAULT_PAGE_SIZE};
use super::{DataVerificationInfo, WritableFile};
use crate::common::checksum::{
    FileChecksumGenerator, UNKNOWN_FILE_CHECKSUM, UNKNOWN_FILE_CHECKSUM_FUNC_NAME,
};
use crate::common::listener::{EventListener, FileOperationInfo, SyncKind};
use crate::common::rate_limiter::{IoPriority, OpType, RateLimiter};
use crate::common::stats::{IoMetric, IoStats, IoTimer, NoopIoStats};
use crate::common::{Error, Result};
use crate::options::WriterOptions;

const BYTES_NOT_SYNC_RANGE: u64 = 1024 * 1024;
const BYTES_ALIGN_WHEN_SYNC: u64 = 4 * 1024;

/// Buffers arbitrary-sized appends, flushes them to the underlying file
/// on demand or when full, and issues the durability calls. Supports
/// buffered and direct I/O; in direct mode all file writes are positional
/// and alignment-sized, with the unaligned tail carried over between
/// flushes.
///
/// A writer is a single-writer object: callers serialize everything
/// except `sync_without_flush`, which may run from another context when
/// the underlying file declares its sync thread-safe.
pub struct WritableFileWriter {
    file_name: String,
    writable_file: Option<Box<dyn WritableFile>>,
    buf: AlignedBuffer,
    max_buffer_size: usize,
    // Bytes the caller has handed over, whether still buffered or not.
    filesize: u64,
    // Offset of the next direct positioned write. Lags filesize by the
    // unaligned tail still sitting in the buffer.
    next_write_offset: u64,
    last_sync_size: u64,
    bytes_per_sync: u64,
    pending_sync: bool,
    use_direct_io: bool,
    perform_data_verification: bool,
    buffered_data_with_checksum: bool,
    // CRC32C of exactly the bytes currently resident in the buffer.
    buffered_data_crc32c: u32,
    checksum_generator: Option<Box<dyn FileChecksumGenerator>>,
    checksum_finalized: bool,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    listeners: Vec<Arc<dyn EventListener>>,
    stats: Arc<dyn IoStats>,
}

impl WritableFileWriter {
    pub fn new(
        writable_file: Box<dyn WritableFile>,
        file_name: String,
        opts: &WriterOptions,
    ) -> Self {
        let use_direct_io = writable_file.use_direct_io();
        let alignment = writable_file.get_required_buffer_alignment();
        let mut buf = AlignedBuffer::with_alignment(alignment);
        buf.allocate_new_buffer(std::cmp::min(65536, opts.max_buffer_size), false);
        WritableFileWriter {
            file_name,
            writable_file: Some(writable_file),
            buf,
            max_buffer_size: opts.max_buffer_size,
            filesize: 0,
            next_write_offset: 0,
            last_sync_size: 0,
            bytes_per_sync: opts.bytes_per_sync,
            pending_sync: false,
            use_direct_io,
            perform_data_verification: opts.perform_data_verification,
            buffered_data_with_checksum: opts.buffered_data_with_checksum,
            buffered_data_crc32c: 0,
            checksum_generator: None,
            checksum_finalized: false,
            rate_limiter: None,
            listeners: vec![],
            stats: Arc::new(NoopIoStats),
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn with_listeners(mut self, listeners: Vec<Arc<dyn EventListener>>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn IoStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_checksum_generator(mut self, gen: Box<dyn FileChecksumGenerator>) -> Self {
        self.checksum_generator = Some(gen);
        self
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_size(&self) -> u64 {
        self.filesize
    }

    pub fn use_direct_io(&self) -> bool {
        self.use_direct_io
    }

    pub fn buffer_is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn get_file_checksum(&self) -> String {
        match &self.checksum_generator {
            Some(gen) if self.checksum_finalized => gen.get_checksum(),
            _ => UNKNOWN_FILE_CHECKSUM.to_string(),
        }
    }

    pub fn get_file_checksum_func_name(&self) -> &'static str {
        match &self.checksum_generator {
            Some(gen) => gen.name(),
            None => UNKNOWN_FILE_CHECKSUM_FUNC_NAME,
        }
    }

    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.append_with_checksum(data, 0).await
    }

    /// Appends `data`, optionally reusing a CRC32C the caller already
    /// computed over it (`0` means none). On success `filesize` grows by
    /// `data.len()`.
    pub async fn append_with_checksum(&mut self, data: &[u8], crc32c_checksum: u32) -> Result<()> {
        if self.writable_file.is_none() {
            return Err(Error::Closed(self.file_name.clone()));
        }
        let left = data.len();
        self.pending_sync = true;

        if let Some(gen) = self.checksum_generator.as_mut() {
            gen.update(data);
        }

        {
            let _timer = IoTimer::new(self.stats.clone(), IoMetric::PrepareWriteNanos);
            let filesize = self.filesize;
            if let Some(file) = self.writable_file.as_mut() {
                file.prepare_write(filesize, left);
            }
        }

        // See whether we can grow the buffer instead of flushing.
        if self.buf.capacity() - self.buf.current_size() < left {
            let mut cap = self.buf.capacity();
            while cap < self.max_buffer_size {
                // The buffer never grows past max_buffer_size; in direct
                // mode reaching the cap is enough to stop, the data will
                // cycle through the buffer.
                let desired_capacity = std::cmp::min(cap * 2, self.max_buffer_size);
                if desired_capacity - self.buf.current_size() >= left
                    || (self.use_direct_io && desired_capacity == self.max_buffer_size)
                {
                    self.buf.allocate_new_buffer(desired_capacity, true);
                    break;
                }
                cap *= 2;
            }
        }

        // Flush only when buffered I/O.
        if !self.use_direct_io
            && self.buf.capacity() - self.buf.current_size() < left
            && self.buf.current_size() > 0
        {
            self.flush().await?;
        }

        let r = self.append_inner(data, crc32c_checksum).await;
        if r.is_ok() {
            self.filesize += data.len() as u64;
        }
        r
    }

    async fn append_inner(&mut self, data: &[u8], crc32c_checksum: u32) -> Result<()> {
        let mut left = data.len();
        let mut src = 0usize;
        if self.perform_data_verification && self.buffered_data_with_checksum && crc32c_checksum != 0
        {
            // The caller's checksum covers the whole payload, so it can
            // only be reused when the payload lands somewhere in one
            // piece.
            if self.use_direct_io || self.buf.capacity() - self.buf.current_size() >= left {
                if self.buf.capacity() - self.buf.current_size() >= left {
                    let appended = self.buf.append(data);
                    if appended != left {
                        return Err(Error::Corruption("write buffer append failure".to_string()));
                    }
                    self.buffered_data_crc32c =
                        crc32c_combine(self.buffered_data_crc32c, crc32c_checksum, appended);
                } else {
                    while left > 0 {
                        let appended = self.buf.append(&data[src..]);
                        self.buffered_data_crc32c = crc32c_append(
                            self.buffered_data_crc32c,
                            &data[src..src + appended],
                        );
                        left -= appended;
                        src += appended;
                        if left > 0 {
                            self.flush().await?;
                        }
                    }
                }
            } else {
                debug_assert!(self.buf.is_empty());
                self.buffered_data_crc32c = crc32c_checksum;
                let r = self.write_buffered_with_checksum(data).await;
                if r.is_ok() {
                    self.buffered_data_crc32c = 0;
                }
                r?;
            }
        } else if self.use_direct_io || self.buf.capacity() >= left {
            // Accumulate small writes; cycle the buffer through flushes
            // when the payload is larger than it.
            while left > 0 {
                let appended = self.buf.append(&data[src..]);
                if self.perform_data_verification && self.buffered_data_with_checksum {
                    self.buffered_data_crc32c =
                        crc32c_append(self.buffered_data_crc32c, &data[src..src + appended]);
                }
                left -= appended;
                src += appended;
                if left > 0 {
                    self.flush().await?;
                }
            }
        } else {
            // Large write in buffered mode bypasses the buffer entirely.
            debug_assert!(self.buf.is_empty());
            if self.perform_data_verification && self.buffered_data_with_checksum {
                self.buffered_data_crc32c = crc32c(data);
                let r = self.write_buffered_with_checksum(data).await;
                if r.is_ok() {
                    self.buffered_data_crc32c = 0;
                }
                r?;
            } else {
                self.write_buffered(data).await?;
            }
        }
        Ok(())
    }

    /// Appends `pad_bytes` zero bytes through the buffer only.
    pub async fn pad(&mut self, pad_bytes: usize) -> Result<()> {
        debug_assert!(pad_bytes < DEFAULT_PAGE_SIZE);
        if self.writable_file.is_none() {
            return Err(Error::Closed(self.file_name.clone()));
        }
        let mut left = pad_bytes;
        while left > 0 {
            let cap = self.buf.capacity() - self.buf.current_size();
            let append_bytes = std::cmp::min(cap, left);
            let pad_start = self.buf.current_size();
            self.buf.pad_with(append_bytes, 0);
            if self.perform_data_verification {
                self.buffered_data_crc32c = crc32c_append(
                    self.buffered_data_crc32c,
                    &self.buf.as_slice()[pad_start..pad_start + append_bytes],
                );
            }
            left -= append_bytes;
            if left > 0 {
                self.flush().await?;
            }
        }
        self.pending_sync = true;
        self.filesize += pad_bytes as u64;
        Ok(())
    }

    /// Empties the buffer to the underlying file, flushes it, and applies
    /// the background range-sync policy in buffered mode.
    pub async fn flush(&mut self) -> Result<()> {
        if self.writable_file.is_none() {
            return Err(Error::Closed(self.file_name.clone()));
        }
        if self.buf.current_size() > 0 {
            if self.use_direct_io {
                if self.pending_sync {
                    if self.perform_data_verification && self.buffered_data_with_checksum {
                        self.write_direct_with_checksum().await?;
                    } else {
                        self.write_direct().await?;
                    }
                }
            } else {
                let owned = std::mem::take(&mut self.buf);
                let r = if self.perform_data_verification && self.buffered_data_with_checksum {
                    self.write_buffered_with_checksum(owned.as_slice()).await
                } else {
                    self.write_buffered(owned.as_slice()).await
                };
                self.buf = owned;
                if r.is_ok() {
                    self.buf.set_size(0);
                    self.buffered_data_crc32c = 0;
                }
                r?;
            }
        }

        let start_ts = self.notify_start();
        let s = {
            let file = self.file_mut()?;
            file.flush().await
        };
        if let Some(ts) = start_ts {
            self.notify_on_flush_finish(ts, &s);
        }
        s?;

        // Ask the OS to write out the bulk of what is durably ours, but
        // keep clear of the last 1MB: those pages may be rewritten
        // shortly, and some kernels flush neighbor pages beyond the
        // requested range.
        if !self.use_direct_io && self.bytes_per_sync > 0 && self.filesize > BYTES_NOT_SYNC_RANGE {
            let mut offset_sync_to = self.filesize - BYTES_NOT_SYNC_RANGE;
            offset_sync_to -= offset_sync_to % BYTES_ALIGN_WHEN_SYNC;
            debug_assert!(offset_sync_to >= self.last_sync_size);
            if offset_sync_to > 0 && offset_sync_to - self.last_sync_size >= self.bytes_per_sync {
                let r = self
                    .range_sync(self.last_sync_size, offset_sync_to - self.last_sync_size)
                    .await;
                self.last_sync_size = offset_sync_to;
                r?;
            }
        }
        Ok(())
    }

    /// Flushes, then makes everything delivered so far durable. With
    /// `use_fsync` metadata is synced too.
    pub async fn sync(&mut self, use_fsync: bool) -> Result<()> {
        self.flush().await?;
        if !self.use_direct_io && self.pending_sync {
            self.sync_internal(use_fsync).await?;
        }
        self.pending_sync = false;
        Ok(())
    }

    /// Syncs whatever already reached the file, without flushing the
    /// buffer. The one operation callers may run concurrently with
    /// appends, provided the underlying file's sync is thread-safe.
    pub async fn sync_without_flush(&self, use_fsync: bool) -> Result<()> {
        let file = self.file_ref()?;
        if !file.is_sync_thread_safe() {
            return Err(Error::NotSupported(
                "sync_without_flush requires a thread-safe file sync".to_string(),
            ));
        }
        self.sync_internal(use_fsync).await
    }

    async fn sync_internal(&self, use_fsync: bool) -> Result<()> {
        let _timer = IoTimer::new(self.stats.clone(), IoMetric::FsyncNanos);
        let start_ts = self.notify_start();
        let s = {
            let file = self.file_ref()?;
            if use_fsync {
                file.fsync().await
            } else {
                file.sync().await
            }
        };
        if let Some(ts) = start_ts {
            let kind = if use_fsync {
                SyncKind::Fsync
            } else {
                SyncKind::Sync
            };
            self.notify_on_sync_finish(ts, &s, kind);
        }
        s
    }

    async fn range_sync(&mut self, offset: u64, nbytes: u64) -> Result<()> {
        let _timer = IoTimer::new(self.stats.clone(), IoMetric::RangeSyncNanos);
        let start_ts = self.notify_start();
        let s = {
            let file = self.file_ref()?;
            file.range_sync(offset, nbytes).await
        };
        if let Some(ts) = start_ts {
            self.notify_on_range_sync_finish(offset, nbytes, ts, &s);
        }
        s
    }

    /// Flushes, trims direct-mode padding back to the logical size, and
    /// closes the underlying file. Every substep runs even after an
    /// earlier one failed; the first error is returned and the file
    /// handle is released regardless. Re-closing is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.writable_file.is_none() {
            return Ok(());
        }
        let mut s = self.flush().await;

        // In direct mode whole pages were written, so tell the file where
        // the data really ends.
        if self.use_direct_io {
            let start_ts = self.notify_start();
            let filesize = self.filesize;
            let mut interim = match self.writable_file.as_mut() {
                Some(file) => file.truncate(filesize).await,
                None => Ok(()),
            };
            if let Some(ts) = start_ts {
                self.notify_on_truncate_finish(ts, &interim);
            }
            if interim.is_ok() {
                let start_ts = self.notify_start();
                interim = match self.writable_file.as_ref() {
                    Some(file) => file.fsync().await,
                    None => Ok(()),
                };
                if let Some(ts) = start_ts {
                    self.notify_on_sync_finish(ts, &interim, SyncKind::Fsync);
                }
            }
            if s.is_ok() && interim.is_err() {
                s = interim;
            }
        }

        let start_ts = self.notify_start();
        let interim = match self.writable_file.as_mut() {
            Some(file) => file.close().await,
            None => Ok(()),
        };
        if let Some(ts) = start_ts {
            self.notify_on_close_finish(ts, &interim);
        }
        if s.is_ok() && interim.is_err() {
            s = interim;
        }
        self.writable_file = None;

        if s.is_ok() {
            if let Some(gen) = self.checksum_generator.as_mut() {
                if !self.checksum_finalized {
                    gen.finalize();
                    self.checksum_finalized = true;
                }
            }
        }
        s
    }

    // Hands `data` to the file in rate-limiter-sized chunks, computing a
    // per-chunk handoff checksum when data verification is on. The buffer
    // state is only reset by the caller on full success.
    async fn write_buffered(&mut self, data: &[u8]) -> Result<()> {
        debug_assert!(!self.use_direct_io);
        let priority = self.io_priority();
        let mut left = data.len();
        let mut src = 0usize;

        while left > 0 {
            let allowed = match self.rate_limiter.as_ref() {
                Some(limiter) => {
                    limiter.request_token(left, 0, priority, self.stats.as_ref(), OpType::Write)
                }
                None => left,
            };
            let start_ts = self.notify_start();
            let old_size = self.next_write_offset;
            let s = {
                let _timer = IoTimer::new(self.stats.clone(), IoMetric::WriteNanos);
                let verification = if self.perform_data_verification {
                    Some(DataVerificationInfo {
                        checksum: crc32c(&data[src..src + allowed]),
                    })
                } else {
                    None
                };
                let chunk = &data[src..src + allowed];
                let file = self.writable_file.as_mut().ok_or_else(|| {
                    Error::Closed("file released during buffered write".to_string())
                })?;
                match verification {
                    Some(v) => file.append_verified(chunk, v).await,
                    None => file.append(chunk).await,
                }
            };
            if let Some(ts) = start_ts {
                self.notify_on_write_finish(old_size, allowed, ts, &s);
            }
            s?;
            self.stats.add(IoMetric::BytesWritten, allowed as u64);
            left -= allowed;
            src += allowed;
        }
        Ok(())
    }

    // Single-shot variant reusing the running buffer CRC as the handoff
    // checksum. The limiter is drained up front because the one write
    // must carry a CRC covering exactly the bytes submitted; this sits
    // awkwardly with rate limiting and is a known tension.
    async fn write_buffered_with_checksum(&mut self, data: &[u8]) -> Result<()> {
        debug_assert!(!self.use_direct_io);
        debug_assert!(self.perform_data_verification && self.buffered_data_with_checksum);
        let priority = self.io_priority();
        let left = data.len();

        if let Some(limiter) = self.rate_limiter.clone() {
            let mut data_size = left;
            while data_size > 0 {
                let tmp_size = limiter.request_token(
                    data_size,
                    self.buf.alignment(),
                    priority,
                    self.stats.as_ref(),
                    OpType::Write,
                );
                data_size -= tmp_size;
            }
        }

        let start_ts = self.notify_start();
        let old_size = self.next_write_offset;
        let s = {
            let _timer = IoTimer::new(self.stats.clone(), IoMetric::WriteNanos);
            let verification = DataVerificationInfo {
                checksum: self.buffered_data_crc32c,
            };
            let file = self.writable_file.as_mut().ok_or_else(|| {
                Error::Closed("file released during buffered write".to_string())
            })?;
            file.append_verified(data, verification).await
        };
        if let Some(ts) = start_ts {
            self.notify_on_write_finish(old_size, left, ts, &s);
        }
        s?;
        self.stats.add(IoMetric::BytesWritten, left as u64);
        Ok(())
    }

    // Flushes the buffer with positioned, alignment-sized writes. The
    // unaligned tail is written now, zero-padded, and written again once
    // its page fills out or the file closes; `next_write_offset` advances
    // by whole pages only.
    async fn write_direct(&mut self) -> Result<()> {
        debug_assert!(self.use_direct_io);
        let alignment = self.buf.alignment();
        debug_assert_eq!(self.next_write_offset % alignment as u64, 0);

        let file_advance = truncate_to_page_boundary(alignment, self.buf.current_size());
        let leftover_tail = self.buf.current_size() - file_advance;
        self.buf.pad_to_alignment_with(0);

        let priority = self.io_priority();
        let mut left = self.buf.current_size();
        let mut src = 0usize;
        let mut write_offset = self.next_write_offset;

        while left > 0 {
            let size = match self.rate_limiter.as_ref() {
                Some(limiter) => limiter.request_token(
                    left,
                    alignment,
                    priority,
                    self.stats.as_ref(),
                    OpType::Write,
                ),
                None => left,
            };
            let start_ts = self.notify_start();
            let s = {
                let _timer = IoTimer::new(self.stats.clone(), IoMetric::WriteNanos);
                let verification = if self.perform_data_verification {
                    Some(DataVerificationInfo {
                        checksum: crc32c(&self.buf.as_slice()[src..src + size]),
                    })
                } else {
                    None
                };
                let chunk = &self.buf.as_slice()[src..src + size];
                let file = self.writable_file.as_mut().ok_or_else(|| {
                    Error::Closed("file released during direct write".to_string())
                })?;
                match verification {
                    Some(v) => file.positioned_append_verified(chunk, write_offset, v).await,
                    None => file.positioned_append(chunk, write_offset).await,
                }
            };
            if let Some(ts) = start_ts {
                self.notify_on_write_finish(write_offset, size, ts, &s);
            }
            if s.is_err() {
                // Drop the pad bytes; data and tail stay buffered for a
                // retry.
                self.buf.set_size(file_advance + leftover_tail);
                return s;
            }
            self.stats.add(IoMetric::BytesWritten, size as u64);
            left -= size;
            src += size;
            write_offset += size as u64;
        }

        self.buf.refit_tail(file_advance, leftover_tail);
        self.next_write_offset += file_advance as u64;
        Ok(())
    }

    // Direct flush reusing the running buffer CRC: the pad bytes' CRC is
    // combined in, the whole padded buffer goes out in one positioned
    // write, and the CRC is re-derived over whatever stays resident.
    async fn write_direct_with_checksum(&mut self) -> Result<()> {
        debug_assert!(self.use_direct_io);
        debug_assert!(self.perform_data_verification && self.buffered_data_with_checksum);
        let alignment = self.buf.alignment();
        debug_assert_eq!(self.next_write_offset % alignment as u64, 0);

        let file_advance = truncate_to_page_boundary(alignment, self.buf.current_size());
        let leftover_tail = self.buf.current_size() - file_advance;

        let last_cur_size = self.buf.current_size();
        self.buf.pad_to_alignment_with(0);
        let padded_size = self.buf.current_size() - last_cur_size;
        let padded_checksum = crc32c(&self.buf.as_slice()[last_cur_size..]);
        self.buffered_data_crc32c =
            crc32c_combine(self.buffered_data_crc32c, padded_checksum, padded_size);

        let priority = self.io_priority();
        let left = self.buf.current_size();
        let write_offset = self.next_write_offset;

        if let Some(limiter) = self.rate_limiter.clone() {
            let mut data_size = left;
            while data_size > 0 {
                let size = limiter.request_token(
                    data_size,
                    alignment,
                    priority,
                    self.stats.as_ref(),
                    OpType::Write,
                );
                data_size -= size;
            }
        }

        let start_ts = self.notify_start();
        let s = {
            let _timer = IoTimer::new(self.stats.clone(), IoMetric::WriteNanos);
            let verification = DataVerificationInfo {
                checksum: self.buffered_data_crc32c,
            };
            let chunk = &self.buf.as_slice()[..left];
            let file = self.writable_file.as_mut().ok_or_else(|| {
                Error::Closed("file released during direct write".to_string())
            })?;
            file.positioned_append_verified(chunk, write_offset, verification)
                .await
        };
        if let Some(ts) = start_ts {
            self.notify_on_write_finish(write_offset, left, ts, &s);
        }
        if s.is_err() {
            self.buf.set_size(file_advance + leftover_tail);
            self.buffered_data_crc32c = crc32c(self.buf.as_slice());
            return s;
        }
        self.stats.add(IoMetric::BytesWritten, left as u64);

        self.buf.refit_tail(file_advance, leftover_tail);
        self.buffered_data_crc32c = crc32c(self.buf.as_slice());
        self.next_write_offset += file_advance as u64;
        Ok(())
    }

    fn file_ref(&self) -> Result<&dyn WritableFile> {
        match self.writable_file.as_ref() {
            Some(f) => Ok(f.as_ref()),
            None => Err(Error::Closed(self.file_name.clone())),
        }
    }

    fn file_mut(&mut self) -> Result<&mut Box<dyn WritableFile>> {
        match self.writable_file.as_mut() {
            Some(f) => Ok(f),
            None => Err(Error::Closed("file has been released".to_string())),
        }
    }

    fn io_priority(&self) -> IoPriority {
        self.writable_file
            .as_ref()
            .map(|f| f.get_io_priority())
            .unwrap_or_default()
    }

    fn should_notify_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    // Listener absence is decided once per operation; no timestamps are
    // sampled when nobody is watching.
    fn notify_start(&self) -> Option<Instant> {
        if self.should_notify_listeners() {
            Some(Instant::now())
        } else {
            None
        }
    }

    fn operation_info(
        &self,
        offset: u64,
        length: usize,
        start: Instant,
        status: &Result<()>,
    ) -> FileOperationInfo {
        FileOperationInfo {
            file_name: self.file_name.clone(),
            offset,
            length,
            start_time: start,
            duration: start.elapsed(),
            status: status.clone(),
        }
    }

    fn notify_on_write_finish(
        &self,
        offset: u64,
        length: usize,
        start: Instant,
        status: &Result<()>,
    ) {
        let info = self.operation_info(offset, length, start, status);
        for listener in &self.listeners {
            listener.on_file_write_finish(&info);
        }
    }

    fn notify_on_flush_finish(&self, start: Instant, status: &Result<()>) {
        let info = self.operation_info(self.filesize, 0, start, status);
        for listener in &self.listeners {
            listener.on_file_flush_finish(&info);
        }
    }

    fn notify_on_sync_finish(&self, start: Instant, status: &Result<()>, kind: SyncKind) {
        let info = self.operation_info(0, self.filesize as usize, start, status);
        for listener in &self.listeners {
            listener.on_file_sync_finish(&info, kind);
        }
    }

    fn notify_on_range_sync_finish(
        &self,
        offset: u64,
        nbytes: u64,
        start: Instant,
        status: &Result<()>,
    ) {
        let info = self.operation_info(offset, nbytes as usize, start, status);
        for listener in &self.listeners {
            listener.on_file_range_sync_finish(&info);
        }
    }

    fn notify_on_truncate_finish(&self, start: Instant, status: &Result<()>) {
        let info = self.operation_info(self.filesize, 0, start, status);
        for listener in &self.listeners {
            listener.on_file_truncate_finish(&info);
        }
    }

    fn notify_on_close_finish(&self, start: Instant, status: &Result<()>) {
        let info = self.operation_info(self.filesize, 0, start, status);
        for listener in &self.listeners {
            listener.on_file_close_finish(&info);
        }
    }

    #[cfg(test)]
    pub(crate) fn test_buffered_data_crc32c(&self) -> u32 {
        self.buffered_data_crc32c
    }

    #[cfg(test)]
    pub(crate) fn test_buffer_current_size(&self) -> usize {
        self.buf.current_size()
    }

    #[cfg(test)]
    pub(crate) fn test_buffer_capacity(&self) -> usize {
        self.buf.capacity()
    }

    #[cfg(test)]
    pub(crate) fn test_next_write_offset(&self) -> u64 {
        self.next_write_offset
    }

    #[cfg(test)]
    pub(crate) fn test_last_sync_size(&self) -> u64 {
        self.last_sync_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::checksum::Crc32cFileChecksumGenerator;
    use crate::common::file_system::{InMemFileSystem, WritableFile};
    use crate::common::listener::EventListener;
    use async_trait::async_trait;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Mutex;
    use tokio::runtime::Runtime;

    fn new_writer(fs: &InMemFileSystem, name: &str, opts: &WriterOptions) -> WritableFileWriter {
        let f = fs.open_file(name, opts);
        WritableFileWriter::new(Box::new(f), name.to_string(), opts)
    }

    #[test]
    fn test_append_accumulates_until_flush() {
        let fs = InMemFileSystem::default();
        let opts = WriterOptions::default();
        let mut writer = new_writer(&fs, "wal", &opts);
        let r = Runtime::new().unwrap();
        r.block_on(writer.append(b"tiny ")).unwrap();
        r.block_on(writer.append(b"writes")).unwrap();
        assert_eq!(writer.file_size(), 11);
        assert!(fs.file_content("wal").is_none());
        r.block_on(writer.flush()).unwrap();
        assert_eq!(fs.file_content("wal").unwrap(), b"tiny writes");
        assert!(writer.buffer_is_empty());
    }

    #[test]
    fn test_buffer_growth_and_bypass() {
        let fs = InMemFileSystem::default();
        let mut opts = WriterOptions::default();
        opts.max_buffer_size = 1 << 20;
        let mut writer = new_writer(&fs, "sst", &opts);
        let r = Runtime::new().unwrap();
        assert_eq!(writer.test_buffer_capacity(), 65536);
        let big = vec![3u8; 100_000];
        r.block_on(writer.append(&big)).unwrap();
        // Doubling once is enough to hold the payload without a flush.
        assert_eq!(writer.test_buffer_capacity(), 131072);
        assert!(fs.file_content("sst").is_none());

        // A payload the buffer can never hold gets written directly once
        // the buffered bytes are flushed out.
        let mut opts = WriterOptions::default();
        opts.max_buffer_size = 8192;
        let mut writer = new_writer(&fs, "sst2", &opts);
        r.block_on(writer.append(&[1u8; 3000])).unwrap();
        r.block_on(writer.append(&[2u8; 20000])).unwrap();
        assert_eq!(fs.append_sizes("sst2"), vec![3000, 20000]);
        assert!(writer.test_buffer_capacity() <= 8192);
        let mut expected = vec![1u8; 3000];
        expected.extend_from_slice(&[2u8; 20000]);
        assert_eq!(fs.file_content("sst2").unwrap(), expected);
        assert_eq!(writer.file_size(), 23000);
    }

    #[test]
    fn test_direct_io_flush_refits_tail() {
        let fs = InMemFileSystem::default();
        let mut opts = WriterOptions::default();
        opts.use_direct_io = true;
        let mut writer = new_writer(&fs, "direct", &opts);
        let r = Runtime::new().unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        r.block_on(writer.append(&data)).unwrap();
        r.block_on(writer.flush()).unwrap();

        // The whole padded page pair went out in one positioned write;
        // only the aligned prefix counts as file advance.
        assert_eq!(fs.positioned_writes("direct"), vec![(0, 8192)]);
        assert_eq!(writer.test_next_write_offset(), 4096);
        assert_eq!(writer.test_buffer_current_size(), 904);
        let content = fs.file_content("direct").unwrap();
        assert_eq!(content.len(), 8192);
        assert_eq!(&content[..5000], &data[..]);
        assert!(content[5000..].iter().all(|b| *b == 0));

        r.block_on(writer.close()).unwrap();
        assert_eq!(fs.file_content("direct").unwrap(), data);
        // Idempotent re-close.
        r.block_on(writer.close()).unwrap();
    }

    #[test]
    fn test_range_sync_policy() {
        let fs = InMemFileSystem::default();
        let mut opts = WriterOptions::default();
        opts.max_buffer_size = 65536;
        opts.bytes_per_sync = 65536;
        let mut writer = new_writer(&fs, "bulk", &opts);
        let r = Runtime::new().unwrap();
        let chunk = vec![9u8; 65536];
        for _ in 0..17 {
            r.block_on(writer.append(&chunk)).unwrap();
        }
        assert_eq!(writer.file_size(), (1 << 20) + 65536);
        r.block_on(writer.flush()).unwrap();
        assert_eq!(fs.range_syncs("bulk"), vec![(0, 65536)]);
        assert_eq!(writer.test_last_sync_size(), 65536);
    }

    #[test]
    fn test_precomputed_checksum_is_combined() {
        let fs = InMemFileSystem::default();
        let mut opts = WriterOptions::default();
        opts.perform_data_verification = true;
        opts.buffered_data_with_checksum = true;
        let mut writer = new_writer(&fs, "wal", &opts);
        let r = Runtime::new().unwrap();
        let first = b"hello ".to_vec();
        let second = b"durable world".to_vec();
        r.block_on(writer.append_with_checksum(&first, crc32c(&first)))
            .unwrap();
        assert_eq!(writer.test_buffered_data_crc32c(), crc32c(&first));
        r.block_on(writer.append_with_checksum(&second, crc32c(&second)))
            .unwrap();
        let mut whole = first.clone();
        whole.extend_from_slice(&second);
        assert_eq!(writer.test_buffered_data_crc32c(), crc32c(&whole));
        // The in-memory file re-derives the handoff checksum, so a flush
        // doubles as an end-to-end verification.
        r.block_on(writer.flush()).unwrap();
        assert_eq!(writer.test_buffered_data_crc32c(), 0);
        assert_eq!(fs.file_content("wal").unwrap(), whole);
    }

    #[test]
    fn test_running_checksum_extends_without_precomputed() {
        let fs = InMemFileSystem::default();
        let mut opts = WriterOptions::default();
        opts.perform_data_verification = true;
        opts.buffered_data_with_checksum = true;
        let mut writer = new_writer(&fs, "wal", &opts);
        let r = Runtime::new().unwrap();
        r.block_on(writer.append(b"no precomputed ")).unwrap();
        r.block_on(writer.append(b"checksum here")).unwrap();
        assert_eq!(
            writer.test_buffered_data_crc32c(),
            crc32c(b"no precomputed checksum here")
        );
    }

    #[test]
    fn test_pad_appends_zeros_and_extends_checksum() {
        let fs = InMemFileSystem::default();
        let mut opts = WriterOptions::default();
        opts.perform_data_verification = true;
        opts.buffered_data_with_checksum = true;
        let mut writer = new_writer(&fs, "sst", &opts);
        let r = Runtime::new().unwrap();
        r.block_on(writer.append(b"block")).unwrap();
        r.block_on(writer.pad(100)).unwrap();
        assert_eq!(writer.file_size(), 105);
        let mut expected = b"block".to_vec();
        expected.extend_from_slice(&[0u8; 100]);
        assert_eq!(writer.test_buffered_data_crc32c(), crc32c(&expected));
        r.block_on(writer.flush()).unwrap();
        assert_eq!(fs.file_content("sst").unwrap(), expected);
    }

    #[test]
    fn test_sync_clears_pending() {
        let fs = InMemFileSystem::default();
        let opts = WriterOptions::default();
        let mut writer = new_writer(&fs, "wal", &opts);
        let r = Runtime::new().unwrap();
        r.block_on(writer.append(b"payload")).unwrap();
        r.block_on(writer.sync(false)).unwrap();
        assert_eq!(fs.sync_ops("wal"), vec!["sync"]);
        // Nothing new was delivered, so a second sync is flush-only.
        r.block_on(writer.sync(true)).unwrap();
        assert_eq!(fs.sync_ops("wal"), vec!["sync"]);
        r.block_on(writer.append(b" more")).unwrap();
        r.block_on(writer.sync(true)).unwrap();
        assert_eq!(fs.sync_ops("wal"), vec!["sync", "fsync"]);
    }

    #[test]
    fn test_sync_without_flush_requires_thread_safe_sync() {
        let fs = InMemFileSystem::default();
        let opts = WriterOptions::default();
        let r = Runtime::new().unwrap();

        let f = fs.open_file("unsafe", &opts).with_sync_thread_safe(false);
        let writer = WritableFileWriter::new(Box::new(f), "unsafe".to_string(), &opts);
        let err = r.block_on(writer.sync_without_flush(false)).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));

        let mut writer = new_writer(&fs, "safe", &opts);
        let data = vec![5u8; 200_000];
        r.block_on(writer.append(&data)).unwrap();
        r.block_on(writer.sync_without_flush(true)).unwrap();
        assert_eq!(fs.sync_ops("safe"), vec!["fsync"]);
        // The buffer was deliberately left alone.
        assert!(!writer.buffer_is_empty());
    }

    #[test]
    fn test_writes_fail_after_close() {
        let fs = InMemFileSystem::default();
        let opts = WriterOptions::default();
        let mut writer = new_writer(&fs, "wal", &opts);
        let r = Runtime::new().unwrap();
        r.block_on(writer.append(b"last words")).unwrap();
        r.block_on(writer.close()).unwrap();
        assert_eq!(fs.file_content("wal").unwrap(), b"last words");
        let err = r.block_on(writer.append(b"too late")).unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
        let err = r.block_on(writer.flush()).unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
        r.block_on(writer.close()).unwrap();
    }

    #[test]
    fn test_file_checksum_generator_finalized_on_close() {
        let fs = InMemFileSystem::default();
        let opts = WriterOptions::default();
        let mut writer = new_writer(&fs, "sst", &opts)
            .with_checksum_generator(Box::new(Crc32cFileChecksumGenerator::default()));
        let r = Runtime::new().unwrap();
        r.block_on(writer.append(b"hello ")).unwrap();
        r.block_on(writer.append(b"world")).unwrap();
        assert_eq!(writer.get_file_checksum(), UNKNOWN_FILE_CHECKSUM);
        r.block_on(writer.close()).unwrap();
        assert_eq!(
            writer.get_file_checksum(),
            format!("{:08x}", crc32c(b"hello world"))
        );
        assert_eq!(writer.get_file_checksum_func_name(), "Crc32c");

        let writer = new_writer(&fs, "plain", &WriterOptions::default());
        assert_eq!(writer.get_file_checksum(), UNKNOWN_FILE_CHECKSUM);
        assert_eq!(
            writer.get_file_checksum_func_name(),
            UNKNOWN_FILE_CHECKSUM_FUNC_NAME
        );
    }

    struct FixedGrantLimiter {
        grant: usize,
    }

    impl RateLimiter for FixedGrantLimiter {
        fn request_token(
            &self,
            bytes: usize,
            _alignment: usize,
            _priority: IoPriority,
            _stats: &dyn IoStats,
            _op: OpType,
        ) -> usize {
            std::cmp::min(bytes, self.grant)
        }
    }

    #[test]
    fn test_rate_limiter_chunks_buffered_writes() {
        let fs = InMemFileSystem::default();
        let mut opts = WriterOptions::default();
        opts.max_buffer_size = 4096;
        let mut writer = new_writer(&fs, "limited", &opts)
            .with_rate_limiter(Arc::new(FixedGrantLimiter { grant: 1000 }));
        let r = Runtime::new().unwrap();
        let data = vec![7u8; 10000];
        r.block_on(writer.append(&data)).unwrap();
        assert_eq!(fs.append_sizes("limited"), vec![1000; 10]);
        assert_eq!(fs.file_content("limited").unwrap(), data);
    }

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
    }

    impl EventListener for RecordingListener {
        fn on_file_write_finish(&self, _info: &FileOperationInfo) {
            self.events.lock().unwrap().push("write".to_string());
        }
        fn on_file_flush_finish(&self, _info: &FileOperationInfo) {
            self.events.lock().unwrap().push("flush".to_string());
        }
        fn on_file_sync_finish(&self, _info: &FileOperationInfo, kind: SyncKind) {
            self.events.lock().unwrap().push(format!("sync:{:?}", kind));
        }
        fn on_file_range_sync_finish(&self, _info: &FileOperationInfo) {
            self.events.lock().unwrap().push("range_sync".to_string());
        }
        fn on_file_truncate_finish(&self, _info: &FileOperationInfo) {
            self.events.lock().unwrap().push("truncate".to_string());
        }
        fn on_file_close_finish(&self, _info: &FileOperationInfo) {
            self.events.lock().unwrap().push("close".to_string());
        }
    }

    #[test]
    fn test_listener_event_sequence() {
        let fs = InMemFileSystem::default();
        let mut opts = WriterOptions::default();
        opts.use_direct_io = true;
        let listener = Arc::new(RecordingListener::default());
        let listeners: Vec<Arc<dyn EventListener>> = vec![listener.clone()];
        let mut writer = new_writer(&fs, "watched", &opts).with_listeners(listeners);
        let r = Runtime::new().unwrap();
        r.block_on(writer.append(&[1u8; 100])).unwrap();
        r.block_on(writer.close()).unwrap();
        let events = listener.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["write", "flush", "truncate", "sync:Fsync", "close"]
        );
    }

    struct FlakyDirectFile {
        content: Arc<Mutex<Vec<u8>>>,
        fail_remaining: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl WritableFile for FlakyDirectFile {
        async fn append(&mut self, _data: &[u8]) -> Result<()> {
            Err(Error::NotSupported("append on direct file".to_string()))
        }

        async fn positioned_append(&mut self, data: &[u8], offset: u64) -> Result<()> {
            let mut fails = self.fail_remaining.lock().unwrap();
            if *fails > 0 {
                *fails -= 1;
                return Err(Error::Io(Box::new(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected write failure",
                ))));
            }
            let mut content = self.content.lock().unwrap();
            let end = offset as usize + data.len();
            if content.len() < end {
                content.resize(end, 0);
            }
            content[offset as usize..end].copy_from_slice(data);
            Ok(())
        }

        async fn positioned_append_verified(
            &mut self,
            data: &[u8],
            offset: u64,
            verification: DataVerificationInfo,
        ) -> Result<()> {
            assert_eq!(crc32c(data), verification.checksum);
            self.positioned_append(data, offset).await
        }

        async fn sync(&self) -> Result<()> {
            Ok(())
        }

        async fn fsync(&self) -> Result<()> {
            Ok(())
        }

        async fn truncate(&mut self, size: u64) -> Result<()> {
            self.content.lock().unwrap().resize(size as usize, 0);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn use_direct_io(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_failed_direct_write_restores_buffer_and_checksum() {
        let mut opts = WriterOptions::default();
        opts.use_direct_io = true;
        opts.perform_data_verification = true;
        opts.buffered_data_with_checksum = true;
        let content = Arc::new(Mutex::new(vec![]));
        let fails = Arc::new(Mutex::new(1usize));
        let file = FlakyDirectFile {
            content: content.clone(),
            fail_remaining: fails.clone(),
        };
        let mut writer = WritableFileWriter::new(Box::new(file), "flaky".to_string(), &opts);
        let r = Runtime::new().unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        r.block_on(writer.append(&data)).unwrap();

        let err = r.block_on(writer.flush()).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        // Pad bytes dropped, payload retained, checksum re-derived over
        // the retained window.
        assert_eq!(writer.test_buffer_current_size(), 5000);
        assert_eq!(writer.test_buffered_data_crc32c(), crc32c(&data));
        assert_eq!(writer.test_next_write_offset(), 0);

        r.block_on(writer.flush()).unwrap();
        assert_eq!(writer.test_buffer_current_size(), 904);
        assert_eq!(writer.test_buffered_data_crc32c(), crc32c(&data[4096..]));
        assert_eq!(writer.test_next_write_offset(), 4096);

        r.block_on(writer.close()).unwrap();
        assert_eq!(&*content.lock().unwrap(), &data);
    }

    #[test]
    fn test_random_trace_invariants_buffered() {
        let fs = InMemFileSystem::default();
        let mut opts = WriterOptions::default();
        opts.max_buffer_size = 32768;
        opts.bytes_per_sync = 8192;
        opts.perform_data_verification = true;
        opts.buffered_data_with_checksum = true;
        let mut writer = new_writer(&fs, "trace", &opts);
        let r = Runtime::new().unwrap();
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut expected: Vec<u8> = vec![];
        let mut last_filesize = 0u64;
        let mut last_sync_size = 0u64;

        for _ in 0..400 {
            match rng.gen_range(0..10) {
                0..=5 => {
                    let len = rng.gen_range(0..10000);
                    let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    if rng.gen_bool(0.5) {
                        let crc = crc32c(&data);
                        r.block_on(writer.append_with_checksum(&data, crc)).unwrap();
                    } else {
                        r.block_on(writer.append(&data)).unwrap();
                    }
                    expected.extend_from_slice(&data);
                }
                6 => {
                    let n = rng.gen_range(1..512);
                    r.block_on(writer.pad(n)).unwrap();
                    expected.extend_from_slice(&vec![0u8; n]);
                }
                7 | 8 => {
                    r.block_on(writer.flush()).unwrap();
                    assert_eq!(writer.test_buffered_data_crc32c(), 0);
                    assert!(writer.buffer_is_empty());
                }
                _ => {
                    r.block_on(writer.sync(rng.gen_bool(0.5))).unwrap();
                }
            }
            assert!(writer.file_size() >= last_filesize);
            last_filesize = writer.file_size();
            assert!(writer.test_buffer_capacity() <= opts.max_buffer_size);
            assert!(writer.test_last_sync_size() >= last_sync_size);
            last_sync_size = writer.test_last_sync_size();
            if last_sync_size > 0 {
                assert!(last_sync_size <= writer.file_size().saturating_sub(BYTES_NOT_SYNC_RANGE));
                assert_eq!(last_sync_size % BYTES_ALIGN_WHEN_SYNC, 0);
            }
        }
        r.block_on(writer.flush()).unwrap();
        assert_eq!(writer.file_size(), expected.len() as u64);
        assert_eq!(fs.file_content("trace").unwrap(), expected);
    }

    #[test]
    fn test_random_trace_invariants_direct() {
        let fs = InMemFileSystem::default();
        let mut opts = WriterOptions::default();
        opts.max_buffer_size = 65536;
        opts.use_direct_io = true;
        let mut writer = new_writer(&fs, "trace_direct", &opts);
        let r = Runtime::new().unwrap();
        let mut rng = SmallRng::seed_from_u64(0xd1bec7);
        let mut expected: Vec<u8> = vec![];

        for _ in 0..200 {
            match rng.gen_range(0..4) {
                0..=2 => {
                    let len = rng.gen_range(1..20000);
                    let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    r.block_on(writer.append(&data)).unwrap();
                    expected.extend_from_slice(&data);
                }
                _ => {
                    r.block_on(writer.flush()).unwrap();
                }
            }
            assert_eq!(writer.test_next_write_offset() % 4096, 0);
        }
        r.block_on(writer.close()).unwrap();
        for (offset, len) in fs.positioned_writes("trace_direct") {
            assert_eq!(offset % 4096, 0);
            assert_eq!(len % 4096, 0);
        }
        assert_eq!(fs.file_content("trace_direct").unwrap(), expected);
    }
}
