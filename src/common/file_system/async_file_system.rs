use std::path::{Path, PathBuf};
use std::ptr::null;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam::queue::ArrayQueue;
use futures::channel::oneshot::{channel as once_channel, Sender as OnceSender};

use crate::common::file_system::posix_file::RawFile;
use crate::common::file_system::{WritableFile, DEFAULT_PAGE_SIZE};
use crate::common::{Error, FileSystem, IoPriority, Result, WritableFileWriter};
use crate::options::WriterOptions;

const STOP_ERROR: &str = "IO failed because worker pool has stopped";
const CANCEL_ERROR: &str = "IO failed because task was canceled";

#[derive(Clone, Copy, PartialEq, Eq)]
enum IoOperation {
    Write,
    PositionedWrite,
    Sync,
    Fsync,
    RangeSync,
    Truncate,
    Close,
}

#[derive(Clone, Copy)]
struct SendPtr(*const u8);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

struct WriteTask {
    fd: Arc<RawFile>,
    ptr: SendPtr,
    data_size: usize,
    offset: usize,
    op: IoOperation,
    cb: OnceSender<Result<usize>>,
}

unsafe impl Send for WriteTask {}
unsafe impl Sync for WriteTask {}

impl WriteTask {
    // Consumes the task; the completion sender fires exactly once.
    fn run(self) {
        let ret = match self.op {
            IoOperation::Write | IoOperation::PositionedWrite => {
                let buf = unsafe { slice::from_raw_parts(self.ptr.0, self.data_size) };
                self.fd.write(self.offset, buf).map_err(Error::from)
            }
            IoOperation::Sync => self.fd.datasync().map(|_| 0).map_err(Error::from),
            IoOperation::Fsync => self.fd.fsync().map(|_| 0).map_err(Error::from),
            IoOperation::RangeSync => self
                .fd
                .range_sync(self.offset as u64, self.data_size as u64)
                .map(|_| 0)
                .map_err(Error::from),
            IoOperation::Truncate => {
                self.fd.truncate(self.offset).map(|_| 0).map_err(Error::from)
            }
            IoOperation::Close => self.fd.close().map(|_| 0).map_err(Error::from),
        };
        let _ = self.cb.send(ret);
    }
}

pub struct AsyncContext {
    write_queue: ArrayQueue<WriteTask>,
    high_write_queue: ArrayQueue<WriteTask>,
    worker_thread_count: AtomicUsize,
    total_thread_count: usize,
    thread_state: Mutex<Vec<bool>>,
    thread_conv: Condvar,
    closed: AtomicBool,
}

impl AsyncContext {
    fn new(total_thread_count: usize) -> Self {
        AsyncContext {
            write_queue: ArrayQueue::new(1024),
            high_write_queue: ArrayQueue::new(16),
            worker_thread_count: AtomicUsize::new(total_thread_count),
            total_thread_count,
            thread_state: Mutex::new(vec![false; total_thread_count]),
            thread_conv: Condvar::default(),
            closed: AtomicBool::new(false),
        }
    }

    fn wait(&self, id: usize) {
        let mut state = self.thread_state.lock().unwrap();
        if !self.high_write_queue.is_empty() || !self.write_queue.is_empty() {
            return;
        }
        (*state)[id] = true;
        self.worker_thread_count.fetch_sub(1, Ordering::SeqCst);
        while (*state)[id] && !self.is_closed() {
            state = self.thread_conv.wait(state).unwrap();
        }
        self.worker_thread_count.fetch_add(1, Ordering::SeqCst);
    }

    fn wake_up_one(&self) {
        if self.worker_thread_count.load(Ordering::Acquire) >= self.total_thread_count {
            return;
        }
        let mut state = self.thread_state.lock().unwrap();
        for t in state.iter_mut() {
            if *t {
                *t = false;
                break;
            }
        }
        self.thread_conv.notify_all();
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            while let Some(t) = self.high_write_queue.pop() {
                let _ = t.cb.send(Err(Error::Cancel(STOP_ERROR)));
            }
            while let Some(t) = self.write_queue.pop() {
                let _ = t.cb.send(Err(Error::Cancel(STOP_ERROR)));
            }
            let _state = self.thread_state.lock().unwrap();
            self.thread_conv.notify_all();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn busy_worker_count(&self) -> usize {
        self.worker_thread_count.load(Ordering::Acquire)
    }
}

/// A writable file whose every operation is shipped to the worker pool
/// and awaited on a oneshot completion, so each I/O is a real suspension
/// point for the calling task.
pub struct AsyncWritableFile {
    inner: Arc<RawFile>,
    ctx: Arc<AsyncContext>,
    offset: usize,
    high_priority: bool,
    direct: bool,
}

impl AsyncWritableFile {
    fn create(path: &Path, ctx: Arc<AsyncContext>, opts: &WriterOptions) -> Result<Self> {
        let fd = RawFile::create(path, opts.use_direct_io).map_err(|e| Error::Io(Box::new(e)))?;
        let file_size = fd.file_size().map_err(|e| Error::Io(Box::new(e)))?;
        Ok(AsyncWritableFile {
            inner: Arc::new(fd),
            ctx,
            offset: file_size,
            high_priority: opts.high_priority,
            direct: opts.use_direct_io,
        })
    }

    fn run_async_task(&self, mut task: WriteTask) -> Result<()> {
        if self.ctx.is_closed() {
            return Err(Error::Cancel(STOP_ERROR));
        }
        if self.high_priority {
            let mut ret = self.ctx.high_write_queue.push(task);
            self.ctx.wake_up_one();
            while let Err(t) = ret {
                if self.ctx.is_closed() {
                    return Err(Error::Cancel(STOP_ERROR));
                }
                ret = self.ctx.high_write_queue.push(t);
                self.ctx.wake_up_one();
            }
        } else {
            while let Err(t) = self.ctx.write_queue.push(task) {
                if self.ctx.is_closed() {
                    return Err(Error::Cancel(STOP_ERROR));
                }
                if self.ctx.busy_worker_count() <= 1 {
                    self.ctx.wake_up_one();
                }
                thread::sleep(Duration::from_millis(1));
                task = t;
            }
            if self.ctx.busy_worker_count() <= 1 {
                self.ctx.wake_up_one();
            }
        }
        Ok(())
    }

    async fn submit(
        &self,
        op: IoOperation,
        ptr: SendPtr,
        data_size: usize,
        offset: usize,
    ) -> Result<usize> {
        let (cb, rc) = once_channel();
        let task = WriteTask {
            fd: self.inner.clone(),
            ptr,
            data_size,
            offset,
            op,
            cb,
        };
        self.run_async_task(task)?;
        rc.await.map_err(|_| Error::Cancel(CANCEL_ERROR))?
    }
}

#[async_trait]
impl WritableFile for AsyncWritableFile {
    async fn append(&mut self, data: &[u8]) -> Result<()> {
        let written = self
            .submit(IoOperation::Write, SendPtr(data.as_ptr()), data.len(), self.offset)
            .await?;
        self.offset += written;
        Ok(())
    }

    async fn positioned_append(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.submit(
            IoOperation::PositionedWrite,
            SendPtr(data.as_ptr()),
            data.len(),
            offset as usize,
        )
        .await?;
        self.offset = std::cmp::max(self.offset, offset as usize + data.len());
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        self.submit(IoOperation::Sync, SendPtr(null()), 0, 0).await?;
        Ok(())
    }

    async fn fsync(&self) -> Result<()> {
        self.submit(IoOperation::Fsync, SendPtr(null()), 0, 0).await?;
        Ok(())
    }

    async fn range_sync(&self, offset: u64, nbytes: u64) -> Result<()> {
        self.submit(
            IoOperation::RangeSync,
            SendPtr(null()),
            nbytes as usize,
            offset as usize,
        )
        .await?;
        Ok(())
    }

    async fn truncate(&mut self, size: u64) -> Result<()> {
        self.submit(IoOperation::Truncate, SendPtr(null()), 0, size as usize)
            .await?;
        self.offset = std::cmp::min(self.offset, size as usize);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.submit(IoOperation::Close, SendPtr(null()), 0, 0).await?;
        Ok(())
    }

    fn get_file_size(&self) -> u64 {
        self.offset as u64
    }

    fn get_io_priority(&self) -> IoPriority {
        if self.high_priority {
            IoPriority::High
        } else {
            IoPriority::Low
        }
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

/// File system backed by a small worker pool. One worker favors the
/// high-priority queue so latency-sensitive files are not stuck behind
/// bulk writes.
pub struct AsyncFileSystem {
    ctx: Arc<AsyncContext>,
    pool_handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl AsyncFileSystem {
    pub fn new(pool_size: usize) -> Self {
        let ctx = Arc::new(AsyncContext::new(pool_size));
        let mut pool_handles = vec![];
        for i in 0..pool_size {
            let wctx = ctx.clone();
            let h = thread::spawn(move || {
                if i == 0 {
                    run_high_io_task(wctx);
                } else {
                    run_io_task(wctx, i);
                }
            });
            pool_handles.push(h);
        }
        AsyncFileSystem {
            ctx,
            pool_handles: Mutex::new(pool_handles),
        }
    }

    pub fn stop(&self) {
        self.ctx.close();
        let mut handles = self.pool_handles.lock().unwrap();
        for h in handles.drain(..) {
            h.join().unwrap();
        }
    }
}

impl FileSystem for AsyncFileSystem {
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
        let f = AsyncWritableFile::create(&path, self.ctx.clone(), opts)?;
        Ok(Box::new(WritableFileWriter::new(
            Box::new(f),
            file_name,
            opts,
        )))
    }

    fn file_exist(&self, path: &Path) -> Result<bool> {
        Ok(path.exists())
    }
}

fn run_high_io_task(ctx: Arc<AsyncContext>) {
    while !ctx.is_closed() {
        while let Some(t) = ctx.high_write_queue.pop() {
            t.run();
        }
        if let Some(t) = ctx.write_queue.pop() {
            t.run();
        }
        if let Some(t) = spin_for_task(&ctx.high_write_queue) {
            t.run();
            continue;
        }
        ctx.wait(0);
    }
}

fn run_io_task(ctx: Arc<AsyncContext>, idx: usize) {
    while !ctx.is_closed() {
        let mut processed_task_count = 0;
        while let Some(t) = ctx.write_queue.pop() {
            processed_task_count += 1;
            t.run();
            if processed_task_count > 10 {
                ctx.wake_up_one();
                break;
            }
        }
        if let Some(t) = ctx.write_queue.pop() {
            t.run();
            continue;
        }
        ctx.wait(idx);
    }
}

fn spin_for_task<T>(que: &ArrayQueue<T>) -> Option<T> {
    for _ in 0..100 {
        if let Some(t) = que.pop() {
            return Some(t);
        }
        thread::yield_now();
    }
    None
}
