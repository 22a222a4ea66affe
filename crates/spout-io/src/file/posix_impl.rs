//! [`FileBackend`] implementation using POSIX positional I/O.
//!
//! Every operation runs the blocking system call on tokio's blocking pool.

use std::fs::{File, OpenOptions};
use std::io::Error as IoError;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use spout::{Chunk, Error, Result};
use tracing::debug;

use super::{FileBackend, FileBackendFactory, FileHandle, NativeFile, OpenFlags};
use crate::config::FileBackendConfig;

/// Runs `f` on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, IoError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => Ok(result?),
        Err(error) => Err(Error::Panicked(error.to_string())),
    }
}

struct PosixFile {
    /// `None` once closed.
    file: RwLock<Option<Arc<File>>>,
    append: bool,
}

impl PosixFile {
    fn file(&self) -> Result<Arc<File>> {
        self.file
            .read()
            .unwrap()
            .clone()
            .ok_or(Error::Closed("file"))
    }
}

#[async_trait]
impl NativeFile for PosixFile {
    async fn read(&self, max_bytes: usize, offset: u64) -> Result<Option<Chunk<u8>>> {
        let file = self.file()?;
        blocking(move || {
            let mut buffer = vec![0; max_bytes];
            let n = file.read_at(&mut buffer, offset)?;
            if n == 0 {
                return Ok(None);
            }
            buffer.truncate(n);
            Ok(Some(Chunk::from(buffer)))
        })
        .await
    }

    async fn write(&self, bytes: &Chunk<u8>, offset: u64) -> Result<usize> {
        let file = self.file()?;
        let bytes = bytes.clone();
        let append = self.append;
        blocking(move || {
            // Files opened for appending ignore the offset.
            let offset = if append { file.metadata()?.len() } else { offset };
            file.write_at(bytes.as_slice(), offset)
        })
        .await
    }

    async fn size(&self) -> Result<u64> {
        let file = self.file()?;
        blocking(move || Ok(file.metadata()?.len())).await
    }

    async fn truncate(&self, size: u64) -> Result<()> {
        let file = self.file()?;
        blocking(move || file.set_len(size)).await
    }

    async fn sync(&self) -> Result<()> {
        let file = self.file()?;
        blocking(move || file.sync_data()).await
    }

    async fn close(&self) -> Result<()> {
        // Dropping the last reference closes the descriptor.
        self.file.write().unwrap().take();
        Ok(())
    }
}

/// Opens files in the local file system.
#[derive(Clone, Copy, Debug, Default)]
pub struct PosixBackend;

impl PosixBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileBackend for PosixBackend {
    fn name(&self) -> &'static str {
        "posix"
    }

    async fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle> {
        let owned = path.to_path_buf();
        let file = blocking(move || {
            OpenOptions::new()
                .read(flags.read)
                .write(flags.write || flags.append)
                .create(flags.create)
                .truncate(flags.truncate)
                .open(&owned)
        })
        .await?;
        debug!("opened {} with {flags:?}", path.display());
        let native = PosixFile {
            file: RwLock::new(Some(Arc::new(file))),
            append: flags.append,
        };
        Ok(FileHandle::new(Arc::new(native), path))
    }
}

struct PosixBackendFactory;

impl FileBackendFactory for PosixBackendFactory {
    fn backend(&self) -> &'static str {
        "posix"
    }

    fn create(&self, _config: &FileBackendConfig) -> Result<Arc<dyn FileBackend>> {
        Ok(Arc::new(PosixBackend))
    }
}

inventory::submit! {
    &PosixBackendFactory as &dyn FileBackendFactory
}
