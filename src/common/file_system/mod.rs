mod aligned_buffer;
mod async_file_system;
mod posix_file;
mod writer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Error, Result};
use crate::common::IoPriority;
use crate::options::WriterOptions;

pub use aligned_buffer::{
    round_up, truncate_to_page_boundary, AlignedBuffer, DEFAULT_PAGE_SIZE,
};
pub use async_file_system::AsyncFileSystem;
pub use posix_file::{PosixWritableFile, RawFile, SyncPosixFileSystem};
pub use writer::WritableFileWriter;

/// Producer-computed CRC32C handed to the file layer alongside a write so
/// the storage stack can verify the payload end to end.
#[derive(Clone, Copy, Debug)]
pub struct DataVerificationInfo {
    pub checksum: u32,
}

/// Capability set of a raw writable file. Every I/O method is an await
/// point; `sync`, `fsync` and `range_sync` take `&self` so a thread-safe
/// implementation can be synced from another context while the owner
/// keeps appending.
#[async_trait]
pub trait WritableFile: Send + Sync {
    async fn append(&mut self, data: &[u8]) -> Result<()>;

    async fn append_verified(
        &mut self,
        data: &[u8],
        _verification: DataVerificationInfo,
    ) -> Result<()> {
        self.append(data).await
    }

    async fn positioned_append(&mut self, data: &[u8], offset: u64) -> Result<()>;

    async fn positioned_append_verified(
        &mut self,
        data: &[u8],
        offset: u64,
        _verification: DataVerificationInfo,
    ) -> Result<()> {
        self.positioned_append(data, offset).await
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn sync(&self) -> Result<()>;

    async fn fsync(&self) -> Result<()>;

    async fn range_sync(&self, _offset: u64, _nbytes: u64) -> Result<()> {
        Ok(())
    }

    async fn truncate(&mut self, size: u64) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Advisory pre-allocation hint for an upcoming write of `len` bytes
    /// at `offset`.
    fn prepare_write(&mut self, _offset: u64, _len: usize) {}

    fn get_file_size(&self) -> u64 {
        0
    }

    fn get_io_priority(&self) -> IoPriority {
        IoPriority::Low
    }

    fn is_sync_thread_safe(&self) -> bool {
        false
    }

    fn use_direct_io(&self) -> bool {
        false
    }

    fn get_required_buffer_alignment(&self) -> usize {
        DEFAULT_PAGE_SIZE
    }
}

pub trait FileSystem: Send + Sync {
    fn open_writable_file_writer(&self, path: PathBuf) -> Result<Box<WritableFileWriter>> {
        self.open_writable_file_writer_opt(path, &WriterOptions::default())
    }

    fn open_writable_file_writer_opt(
        &self,
        path: PathBuf,
        opts: &WriterOptions,
    ) -> Result<Box<WritableFileWriter>>;

    fn file_exist(&self, path: &Path) -> Result<bool>;
}

#[derive(Default)]
pub struct InMemFileSystemRep {
    files: HashMap<String, Vec<u8>>,
    appends: Vec<(String, usize)>,
    positioned: Vec<(String, u64, usize)>,
    syncs: Vec<(String, &'static str)>,
    range_syncs: Vec<(String, u64, u64)>,
}

/// In-memory file system recording every operation it sees, so tests can
/// assert on write chunking, positioned offsets and sync traffic without
/// touching disk.
#[derive(Clone, Default)]
pub struct InMemFileSystem {
    inner: Arc<Mutex<InMemFileSystemRep>>,
}

impl InMemFileSystem {
    pub fn open_file(&self, filename: &str, opts: &WriterOptions) -> InMemFile {
        InMemFile {
            fs: self.inner.clone(),
            filename: filename.to_string(),
            direct: opts.use_direct_io,
            alignment: DEFAULT_PAGE_SIZE,
            sync_thread_safe: true,
        }
    }

    pub fn file_content(&self, filename: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().files.get(filename).cloned()
    }

    pub fn append_sizes(&self, filename: &str) -> Vec<usize> {
        let fs = self.inner.lock().unwrap();
        fs.appends
            .iter()
            .filter(|(f, _)| f == filename)
            .map(|(_, n)| *n)
            .collect()
    }

    pub fn positioned_writes(&self, filename: &str) -> Vec<(u64, usize)> {
        let fs = self.inner.lock().unwrap();
        fs.positioned
            .iter()
            .filter(|(f, _, _)| f == filename)
            .map(|(_, off, n)| (*off, *n))
            .collect()
    }

    pub fn sync_ops(&self, filename: &str) -> Vec<&'static str> {
        let fs = self.inner.lock().unwrap();
        fs.syncs
            .iter()
            .filter(|(f, _)| f == filename)
            .map(|(_, op)| *op)
            .collect()
    }

    pub fn range_syncs(&self, filename: &str) -> Vec<(u64, u64)> {
        let fs = self.inner.lock().unwrap();
        fs.range_syncs
            .iter()
            .filter(|(f, _, _)| f == filename)
            .map(|(_, off, n)| (*off, *n))
            .collect()
    }
}

impl FileSystem for InMemFileSystem {
    fn open_writable_file_writer_opt(
        &self,
        path: PathBuf,
        opts: &WriterOptions,
    ) -> Result<Box<WritableFileWriter>> {
        let filename = path
            .to_str()
            .ok_or_else(|| Error::InvalidFile("filename is not utf-8".to_string()))?
            .to_string();
        let f = self.open_file(&filename, opts);
        Ok(Box::new(WritableFileWriter::new(
            Box::new(f),
            filename,
            opts,
        )))
    }

    fn file_exist(&self, path: &Path) -> Result<bool> {
        let fs = self.inner.lock().unwrap();
        match path.to_str() {
            Some(name) => Ok(fs.files.contains_key(name)),
            None => Ok(false),
        }
    }
}

pub struct InMemFile {
    fs: Arc<Mutex<InMemFileSystemRep>>,
    filename: String,
    direct: bool,
    alignment: usize,
    sync_thread_safe: bool,
}

impl InMemFile {
    pub fn with_sync_thread_safe(mut self, v: bool) -> Self {
        self.sync_thread_safe = v;
        self
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }
}

#[async_trait]
impl WritableFile for InMemFile {
    async fn append(&mut self, data: &[u8]) -> Result<()> {
        let mut fs = self.fs.lock().unwrap();
        fs.appends.push((self.filename.clone(), data.len()));
        fs.files
            .entry(self.filename.clone())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    async fn append_verified(
        &mut self,
        data: &[u8],
        verification: DataVerificationInfo,
    ) -> Result<()> {
        if crc32c::crc32c(data) != verification.checksum {
            return Err(Error::Corruption(format!(
                "handoff checksum mismatch on {}",
                self.filename
            )));
        }
        self.append(data).await
    }

    async fn positioned_append(&mut self, data: &[u8], offset: u64) -> Result<()> {
        let mut fs = self.fs.lock().unwrap();
        fs.positioned
            .push((self.filename.clone(), offset, data.len()));
        let f = fs.files.entry(self.filename.clone()).or_default();
        let end = offset as usize + data.len();
        if f.len() < end {
            f.resize(end, 0);
        }
        f[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    async fn positioned_append_verified(
        &mut self,
        data: &[u8],
        offset: u64,
        verification: DataVerificationInfo,
    ) -> Result<()> {
        if crc32c::crc32c(data) != verification.checksum {
            return Err(Error::Corruption(format!(
                "handoff checksum mismatch on {}",
                self.filename
            )));
        }
        self.positioned_append(data, offset).await
    }

    async fn sync(&self) -> Result<()> {
        let mut fs = self.fs.lock().unwrap();
        fs.syncs.push((self.filename.clone(), "sync"));
        Ok(())
    }

    async fn fsync(&self) -> Result<()> {
        let mut fs = self.fs.lock().unwrap();
        fs.syncs.push((self.filename.clone(), "fsync"));
        Ok(())
    }

    async fn range_sync(&self, offset: u64, nbytes: u64) -> Result<()> {
        let mut fs = self.fs.lock().unwrap();
        fs.range_syncs.push((self.filename.clone(), offset, nbytes));
        Ok(())
    }

    async fn truncate(&mut self, size: u64) -> Result<()> {
        let mut fs = self.fs.lock().unwrap();
        fs.files
            .entry(self.filename.clone())
            .or_default()
            .resize(size as usize, 0);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn get_file_size(&self) -> u64 {
        let fs = self.fs.lock().unwrap();
        fs.files.get(&self.filename).map_or(0, |f| f.len() as u64)
    }

    fn is_sync_thread_safe(&self) -> bool {
        self.sync_thread_safe
    }

    fn use_direct_io(&self) -> bool {
        self.direct
    }

    fn get_required_buffer_alignment(&self) -> usize {
        self.alignment
    }
}
