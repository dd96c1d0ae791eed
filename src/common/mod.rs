mod checksum;
mod error;
mod listener;
mod rate_limiter;
mod stats;

pub mod file_system;

pub use checksum::{
    Crc32cFileChecksumGenerator, FileChecksumGenerator, UNKNOWN_FILE_CHECKSUM,
    UNKNOWN_FILE_CHECKSUM_FUNC_NAME,
};
pub use error::{Error, Result};
pub use file_system::{
    AlignedBuffer, AsyncFileSystem, DataVerificationInfo, FileSystem, InMemFile, InMemFileSystem,
    PosixWritableFile, RawFile, SyncPosixFileSystem, WritableFile, WritableFileWriter,
    DEFAULT_PAGE_SIZE,
};
pub use listener::{EventListener, FileOperationInfo, SyncKind};
pub use rate_limiter::{IoPriority, OpType, RateLimiter};
pub use stats::{IoMetric, IoStats, IoTimer, NoopIoStats};
