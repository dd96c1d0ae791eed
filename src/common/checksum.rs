use crc32c::crc32c_append;

pub const UNKNOWN_FILE_CHECKSUM: &str = "";
pub const UNKNOWN_FILE_CHECKSUM_FUNC_NAME: &str = "Unknown";

/// Incremental whole-file checksum, independent of the per-record CRCs
/// embedded in the data itself. Updated with every appended byte and
/// finalized exactly once when the file is closed.
pub trait FileChecksumGenerator: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize(&mut self);
    fn get_checksum(&self) -> String;
    fn name(&self) -> &'static str;
}

#[derive(Default)]
pub struct Crc32cFileChecksumGenerator {
    state: u32,
    checksum: String,
}

impl FileChecksumGenerator for Crc32cFileChecksumGenerator {
    fn update(&mut self, data: &[u8]) {
        self.state = crc32c_append(self.state, data);
    }

    fn finalize(&mut self) {
        self.checksum = format!("{:08x}", self.state);
    }

    fn get_checksum(&self) -> String {
        self.checksum.clone()
    }

    fn name(&self) -> &'static str {
        "Crc32c"
    }
}
