// Copyright (c) 2017-present, PingCAP, Inc. Licensed under Apache-2.0.

use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::uio::pwrite;
use nix::unistd::{close, fsync, ftruncate, lseek, Whence};
use nix::NixPath;

use crate::common::file_system::{WritableFile, DEFAULT_PAGE_SIZE};
use crate::common::{Error, FileSystem, Result, WritableFileWriter};
use crate::options::WriterOptions;

const MIN_ALLOCATE_SIZE: usize = 4 * 1024;

pub fn from_nix_error(e: nix::Error, custom: &'static str) -> IoError {
    let kind = IoError::from(e).kind();
    IoError::new(kind, custom)
}

/// A `RawFile` is a RAII fd wrapper providing the positional write,
/// durability and space-management calls the writer stack needs. The fd
/// is released exactly once, by `close` or by `Drop`, whichever comes
/// first.
pub struct RawFile {
    fd: RawFd,
    closed: AtomicBool,
}

impl RawFile {
    pub fn create<P: ?Sized + NixPath>(path: &P, direct: bool) -> IoResult<Self> {
        let mut flags = OFlag::O_RDWR | OFlag::O_CREAT;
        #[cfg(target_os = "linux")]
        if direct {
            flags |= OFlag::O_DIRECT;
        }
        #[cfg(not(target_os = "linux"))]
        let _ = direct;
        // Permission 644
        let mode = Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH;
        let fd = fcntl::open(path, flags, mode).map_err(|e| from_nix_error(e, "open"))?;
        Ok(RawFile {
            fd,
            closed: AtomicBool::new(false),
        })
    }

    pub fn close(&self) -> IoResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        close(self.fd).map_err(|e| from_nix_error(e, "close"))
    }

    pub fn datasync(&self) -> IoResult<()> {
        #[cfg(target_os = "linux")]
        {
            nix::unistd::fdatasync(self.fd).map_err(|e| from_nix_error(e, "fdatasync"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.fsync()
        }
    }

    pub fn fsync(&self) -> IoResult<()> {
        fsync(self.fd).map_err(|e| from_nix_error(e, "fsync"))
    }

    pub fn range_sync(&self, offset: u64, nbytes: u64) -> IoResult<()> {
        #[cfg(target_os = "linux")]
        {
            let ret = unsafe {
                libc::sync_file_range(
                    self.fd,
                    offset as libc::off64_t,
                    nbytes as libc::off64_t,
                    libc::SYNC_FILE_RANGE_WRITE,
                )
            };
            if ret < 0 {
                return Err(IoError::last_os_error());
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (offset, nbytes);
            self.datasync()
        }
    }

    pub fn write(&self, mut offset: usize, content: &[u8]) -> IoResult<usize> {
        let mut written = 0;
        while written < content.len() {
            let bytes = match pwrite(self.fd, &content[written..], offset as i64) {
                Ok(bytes) => bytes,
                Err(e) if e == Errno::EAGAIN => continue,
                Err(e) => return Err(from_nix_error(e, "pwrite")),
            };
            if bytes == 0 {
                break;
            }
            written += bytes;
            offset += bytes;
        }
        Ok(written)
    }

    pub fn file_size(&self) -> IoResult<usize> {
        lseek(self.fd, 0, Whence::SeekEnd)
            .map(|n| n as usize)
            .map_err(|e| from_nix_error(e, "lseek"))
    }

    pub fn truncate(&self, offset: usize) -> IoResult<()> {
        ftruncate(self.fd, offset as i64).map_err(|e| from_nix_error(e, "ftruncate"))
    }

    #[allow(unused_variables)]
    pub fn allocate(&self, offset: usize, size: usize) -> IoResult<()> {
        #[cfg(target_os = "linux")]
        {
            fcntl::fallocate(
                self.fd,
                fcntl::FallocateFlags::FALLOC_FL_KEEP_SIZE,
                offset as i64,
                size as i64,
            )
            .map_err(|e| from_nix_error(e, "fallocate"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            Ok(())
        }
    }
}

impl Drop for RawFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error while closing file: {}", e);
        }
    }
}

/// A `PosixWritableFile` adapts a `RawFile` to the writable-file
/// capability set. Appends track the end offset so they can be issued as
/// positional writes against the shared fd.
pub struct PosixWritableFile {
    inner: Arc<RawFile>,
    offset: usize,
    capacity: usize,
    direct: bool,
}

impl PosixWritableFile {
    pub fn create<P: ?Sized + NixPath>(path: &P) -> IoResult<Self> {
        Self::create_opt(path, false)
    }

    pub fn create_opt<P: ?Sized + NixPath>(path: &P, direct: bool) -> IoResult<Self> {
        let fd = RawFile::create(path, direct)?;
        let file_size = fd.file_size()?;
        Ok(PosixWritableFile {
            inner: Arc::new(fd),
            offset: file_size,
            capacity: file_size,
            direct,
        })
    }

    fn write_all(&mut self, offset: usize, data: &[u8]) -> IoResult<usize> {
        let written = self.inner.write(offset, data)?;
        if written != data.len() {
            return Err(IoError::new(ErrorKind::WriteZero, "short pwrite"));
        }
        Ok(written)
    }
}

#[async_trait]
impl WritableFile for PosixWritableFile {
    async fn append(&mut self, data: &[u8]) -> Result<()> {
        let written = self.write_all(self.offset, data)?;
        self.offset += written;
        Ok(())
    }

    async fn positioned_append(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.write_all(offset as usize, data)?;
        self.offset = std::cmp::max(self.offset, offset as usize + data.len());
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        self.inner.datasync().map_err(Error::from)
    }

    async fn fsync(&self) -> Result<()> {
        self.inner.fsync().map_err(Error::from)
    }

    async fn range_sync(&self, offset: u64, nbytes: u64) -> Result<()> {
        self.inner.range_sync(offset, nbytes).map_err(Error::from)
    }

    async fn truncate(&mut self, size: u64) -> Result<()> {
        self.inner.truncate(size as usize)?;
        self.offset = std::cmp::min(self.offset, size as usize);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().map_err(Error::from)
    }

    fn prepare_write(&mut self, offset: u64, len: usize) {
        let new_written = offset as usize + len;
        if new_written > self.capacity {
            let mut real_alloc = MIN_ALLOCATE_SIZE;
            let alloc = new_written - self.capacity;
            while real_alloc < alloc {
                real_alloc *= 2;
            }
            if self.inner.allocate(self.capacity, real_alloc).is_ok() {
                self.capacity += real_alloc;
            }
        }
    }

    fn get_file_size(&self) -> u64 {
        self.offset as u64
    }

    fn is_sync_thread_safe(&self) -> bool {
        true
    }

    fn use_direct_io(&self) -> bool {
        self.direct
    }

    fn get_required_buffer_alignment(&self) -> usize {
        DEFAULT_PAGE_SIZE
    }
}

/// File system doing its I/O inline on the calling context.
pub struct SyncPosixFileSystem {}

impl FileSystem for SyncPosixFileSystem {
    fn open_writable_file_writer_opt(
        &self,
        path: PathBuf,
        opts: &WriterOptions,
    ) -> Result<Box<WritableFileWriter>> {
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| Error::InvalidFile("path has no file name".to_string()))?
            .to_string();
        let f = PosixWritableFile::create_opt(&path, opts.use_direct_io)
            .map_err(|e| Error::Io(Box::new(e)))?;
        let writer = WritableFileWriter::new(Box::new(f), file_name, opts);
        Ok(Box::new(writer))
    }

    fn file_exist(&self, path: &Path) -> Result<bool> {
        Ok(path.exists())
    }
}
