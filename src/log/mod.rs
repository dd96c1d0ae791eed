mod writer;

pub const HEADER_SIZE: usize = 4 + 2 + 1;
pub const RECYCLABLE_HEADER_SIZE: usize = 4 + 2 + 1 + 4;

pub const BLOCK_SIZE: usize = 32768;
pub const LOG_PADDING: &[u8] = b"\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00";

#[repr(u8)]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum RecordType {
    // Zero is reserved for preallocated files
    ZeroType = 0,
    FullType = 1,

    // For fragments
    FirstType = 2,
    MiddleType = 3,
    LastType = 4,

    // For recycled log files; the header additionally carries the low 32
    // bits of the log number.
    RecyclableFullType = 5,
    RecyclableFirstType = 6,
    RecyclableMiddleType = 7,
    RecyclableLastType = 8,
}

pub const MAX_RECORD_TYPE: u8 = RecordType::RecyclableLastType as u8;

impl RecordType {
    pub fn is_recyclable(self) -> bool {
        self as u8 >= RecordType::RecyclableFullType as u8
    }
}

pub use writer::LogWriter;
