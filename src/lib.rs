mod common;
mod log;
mod options;
mod util;

pub use common::{
    AlignedBuffer, AsyncFileSystem, Crc32cFileChecksumGenerator, DataVerificationInfo, Error,
    EventListener, FileChecksumGenerator, FileOperationInfo, FileSystem, InMemFile,
    InMemFileSystem, IoMetric, IoPriority, IoStats, IoTimer, NoopIoStats, OpType,
    PosixWritableFile, RateLimiter, RawFile, Result, SyncKind, SyncPosixFileSystem, WritableFile,
    WritableFileWriter, DEFAULT_PAGE_SIZE, UNKNOWN_FILE_CHECKSUM, UNKNOWN_FILE_CHECKSUM_FUNC_NAME,
};
pub use log::{
    LogWriter, RecordType, BLOCK_SIZE, HEADER_SIZE, LOG_PADDING, MAX_RECORD_TYPE,
    RECYCLABLE_HEADER_SIZE,
};
pub use options::WriterOptions;
pub use util::{crc_mask, crc_unmask, decode_fixed_uint16, decode_fixed_uint32};
