use std::time::{Duration, Instant};

use crate::common::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncKind {
    Sync,
    Fsync,
}

/// Details of one finished operation against the underlying file.
#[derive(Clone)]
pub struct FileOperationInfo {
    pub file_name: String,
    pub offset: u64,
    pub length: usize,
    pub start_time: Instant,
    pub duration: Duration,
    pub status: Result<(), Error>,
}

/// Lifecycle notifications emitted by the writer after each underlying
/// file operation. All handlers default to no-ops so listeners implement
/// only what they watch.
pub trait EventListener: Send + Sync {
    fn on_file_write_finish(&self, _info: &FileOperationInfo) {}
    fn on_file_flush_finish(&self, _info: &FileOperationInfo) {}
    fn on_file_sync_finish(&self, _info: &FileOperationInfo, _kind: SyncKind) {}
    fn on_file_range_sync_finish(&self, _info: &FileOperationInfo) {}
    fn on_file_truncate_finish(&self, _info: &FileOperationInfo) {}
    fn on_file_close_finish(&self, _info: &FileOperationInfo) {}
}
