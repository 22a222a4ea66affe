//! Chunked file I/O.
//!
//! A [`FileBackend`] opens files and returns [`FileHandle`]s. Handles support
//! positional reads and writes that may be partial; the pulls in this module
//! turn them into streams of byte chunks and consume streams of byte chunks,
//! closing the handle when the enclosing scope ends.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use spout::{Chunk, Data, Error, Pull, Result, Stream};
use tracing::debug;

use crate::config::{FileBackendConfig, FileConfig};
use crate::metrics::{
    describe_io_metrics, FILES_CLOSED, FILES_OPENED, FILE_BYTES_READ, FILE_BYTES_WRITTEN,
    FILE_PARTIAL_WRITES, FILE_WRITE_LATENCY,
};

pub mod memory_impl;
pub mod posix_impl;


pub use memory_impl::MemoryBackend;
pub use posix_impl::PosixBackend;

/// How a file is opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    /// Create the file if it does not exist.
    pub create: bool,
    /// Discard existing contents.
    pub truncate: bool,
    /// Ignore write offsets and write at the end of the file.
    pub append: bool,
}

impl OpenFlags {
    pub const READ: Self = Self {
        read: true,
        write: false,
        create: false,
        truncate: false,
        append: false,
    };

    /// Write access, creating the file or discarding its contents.
    pub const WRITE: Self = Self {
        read: false,
        write: true,
        create: true,
        truncate: true,
        append: false,
    };

    pub const APPEND: Self = Self {
        read: false,
        write: true,
        create: true,
        truncate: false,
        append: true,
    };

    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        create: true,
        truncate: false,
        append: false,
    };
}

/// A file opened by a backend.
#[async_trait]
pub trait NativeFile: Send + Sync {
    /// Reads up to `max_bytes` at `offset`. Returns `None` at end of file.
    async fn read(&self, max_bytes: usize, offset: u64) -> Result<Option<Chunk<u8>>>;

    /// Writes `bytes` at `offset` and returns how many bytes were accepted,
    /// which may be fewer than offered.
    async fn write(&self, bytes: &Chunk<u8>, offset: u64) -> Result<usize>;

    async fn size(&self) -> Result<u64>;

    async fn truncate(&self, size: u64) -> Result<()>;

    /// Flushes written data to stable storage.
    async fn sync(&self) -> Result<()>;

    /// Releases the underlying resource. Later operations fail.
    async fn close(&self) -> Result<()>;
}

/// A shareable handle to an open file.
///
/// Clones refer to the same file. [`FileHandle::close`] closes it at most
/// once; further calls do nothing.
#[derive(Clone)]
pub struct FileHandle {
    native: Arc<dyn NativeFile>,
    path: Arc<Path>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl FileHandle {
    pub fn new(native: Arc<dyn NativeFile>, path: &Path) -> Self {
        describe_io_metrics();
        counter!(FILES_OPENED).increment(1);
        Self {
            native,
            path: Arc::from(path),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed("file"));
        }
        Ok(())
    }

    pub async fn read(&self, max_bytes: usize, offset: u64) -> Result<Option<Chunk<u8>>> {
        self.check_open()?;
        let chunk = self.native.read(max_bytes, offset).await?;
        if let Some(chunk) = &chunk {
            counter!(FILE_BYTES_READ).increment(chunk.len() as u64);
        }
        Ok(chunk)
    }

    pub async fn write(&self, bytes: &Chunk<u8>, offset: u64) -> Result<usize> {
        self.check_open()?;
        let start = Instant::now();
        let written = self.native.write(bytes, offset).await?;
        histogram!(FILE_WRITE_LATENCY).record(start.elapsed().as_secs_f64());
        counter!(FILE_BYTES_WRITTEN).increment(written as u64);
        if written < bytes.len() {
            counter!(FILE_PARTIAL_WRITES).increment(1);
        }
        Ok(written)
    }

    pub async fn size(&self) -> Result<u64> {
        self.check_open()?;
        self.native.size().await
    }

    pub async fn truncate(&self, size: u64) -> Result<()> {
        self.check_open()?;
        self.native.truncate(size).await
    }

    pub async fn sync(&self) -> Result<()> {
        self.check_open()?;
        self.native.sync().await
    }

    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        counter!(FILES_CLOSED).increment(1);
        debug!("closing {}", self.path.display());
        self.native.close().await
    }
}

/// Opens files.
#[async_trait]
pub trait FileBackend: Send + Sync {
    /// Name under which the backend is registered.
    fn name(&self) -> &'static str;

    async fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle>;
}

/// Creates a [`FileBackend`] from its configuration.
///
/// Factories are registered with [`inventory::submit!`] and selected by
/// [`FileBackendConfig`]'s name.
pub trait FileBackendFactory: Sync {
    fn backend(&self) -> &'static str;

    fn create(&self, config: &FileBackendConfig) -> Result<Arc<dyn FileBackend>>;
}

inventory::collect!(&'static dyn FileBackendFactory);

impl dyn FileBackend {
    /// Creates the backend named by `config`.
    pub fn new(config: &FileBackendConfig) -> Result<Arc<Self>> {
        let name = config.to_string();
        for factory in inventory::iter::<&dyn FileBackendFactory> {
            if factory.backend() == name {
                return factory.create(config);
            }
        }
        Err(Error::BackendNotSupported(name))
    }
}

fn check_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(Error::InvalidConfig(
            "chunk size must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

/// Opens `path` and returns its handle. The handle is closed when the
/// enclosing scope ends.
pub fn open<O: Data>(
    backend: Arc<dyn FileBackend>,
    path: impl Into<PathBuf>,
    flags: OpenFlags,
) -> Pull<O, FileHandle> {
    let path = path.into();
    Pull::acquire(
        async move { backend.open(&path, flags).await },
        |handle: FileHandle| async move { handle.close().await },
    )
}

/// Emits the contents of `handle` from the start, in chunks of at most
/// `chunk_size` bytes, until the end of the file.
pub fn read_all(handle: FileHandle, chunk_size: usize) -> Pull<u8, ()> {
    read_range(handle, chunk_size, 0, u64::MAX)
}

/// Emits the bytes of `handle` in `start..end`, in chunks of at most
/// `chunk_size` bytes. Stops early at the end of the file.
pub fn read_range(handle: FileHandle, chunk_size: usize, start: u64, end: u64) -> Pull<u8, ()> {
    Pull::from_fn(move |ctx| async move {
        check_chunk_size(chunk_size)?;
        let mut offset = start;
        while offset < end {
            let want = chunk_size.min(usize::try_from(end - offset).unwrap_or(usize::MAX));
            match handle.read(want, offset).await? {
                Some(chunk) if !chunk.is_empty() => {
                    offset += chunk.len() as u64;
                    ctx.output(chunk).await;
                }
                _ => break,
            }
        }
        Ok(())
    })
}

/// Writes every chunk of `input` to `handle` starting at offset 0 and
/// returns the number of bytes written.
pub fn write_all<O: Data>(handle: FileHandle, input: Stream<u8>) -> Pull<O, u64> {
    write_all_at(handle, input, 0)
}

/// Writes every chunk of `input` to `handle` starting at `start` and returns
/// the number of bytes written.
///
/// A chunk is retried from where a partial write stopped until all of it is
/// written; the next chunk is written only after that.
pub fn write_all_at<O: Data>(handle: FileHandle, input: Stream<u8>, start: u64) -> Pull<O, u64> {
    Pull::from_fn(move |ctx| async move {
        let input = ctx.consume(input);
        let mut offset = start;
        while let Some(chunk) = input.pull().await? {
            let len = chunk.len() as u64;
            write_chunk(&handle, chunk, offset).await?;
            offset += len;
        }
        Ok(offset - start)
    })
}

async fn write_chunk(handle: &FileHandle, mut chunk: Chunk<u8>, mut offset: u64) -> Result<()> {
    while !chunk.is_empty() {
        let written = handle.write(&chunk, offset).await?;
        if written == 0 {
            return Err(Error::Io {
                kind: std::io::ErrorKind::WriteZero,
                message: format!("{} accepted no bytes", handle.path().display()),
            });
        }
        chunk = chunk.skip(written);
        offset += written as u64;
    }
    Ok(())
}

/// Streams the contents of `path`.
pub fn read_file(
    backend: Arc<dyn FileBackend>,
    path: impl Into<PathBuf>,
    chunk_size: usize,
) -> Stream<u8> {
    open(backend, path, OpenFlags::READ)
        .flat_map(move |handle| read_all(handle, chunk_size))
        .stream()
}

/// Writes `input` to `path` and emits the number of bytes written once the
/// file is closed.
pub fn write_file(
    backend: Arc<dyn FileBackend>,
    path: impl Into<PathBuf>,
    flags: OpenFlags,
    input: Stream<u8>,
) -> Stream<u64> {
    let written = open(backend, path, flags)
        .flat_map(move |handle| {
            write_all(handle.clone(), input).flat_map(move |written| {
                Pull::eval(async move { handle.sync().await.map(|()| written) })
            })
        })
        .scope();
    written.flat_map(Pull::output1).stream()
}

/// Streams `path` with the backend and chunk size of `config`.
pub fn read_all_from_config(config: &FileConfig, path: impl Into<PathBuf>) -> Result<Stream<u8>> {
    check_chunk_size(config.chunk_size_bytes)?;
    let backend = <dyn FileBackend>::new(&config.backend)?;
    Ok(read_file(backend, path, config.chunk_size_bytes))
}
