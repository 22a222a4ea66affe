//! [`FileBackend`] implementation using memory.
//!
//! This is useful for testing, not as part of a production system. A write
//! cap makes every write partial once it exceeds the cap, which exercises
//! the retry logic of [`write_all`](super::write_all).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use spout::{Chunk, Error, Result};
use std::io::ErrorKind;

use super::{FileBackend, FileBackendFactory, FileHandle, NativeFile, OpenFlags};
use crate::config::FileBackendConfig;

type FileData = Arc<RwLock<Vec<u8>>>;

type Files = Arc<RwLock<HashMap<PathBuf, FileData>>>;

/// Files shared by every backend created from configuration.
static SHARED_FILES: Lazy<Files> = Lazy::new(Files::default);

#[derive(Default)]
struct Stats {
    write_calls: AtomicUsize,
    open_handles: AtomicUsize,
}

/// Keeps files in memory.
///
/// Clones share their files and statistics.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    files: Files,
    max_write_bytes: Option<usize>,
    stats: Arc<Stats>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose writes accept at most `max_write_bytes` bytes each.
    pub fn with_max_write_bytes(max_write_bytes: usize) -> Self {
        Self {
            max_write_bytes: Some(max_write_bytes),
            ..Self::default()
        }
    }

    /// Replaces the contents of `path`.
    pub fn insert(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.files
            .write()
            .unwrap()
            .insert(path.into(), Arc::new(RwLock::new(contents.into())));
    }

    /// Returns a copy of the contents of `path`.
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let files = self.files.read().unwrap();
        files
            .get(path.as_ref())
            .map(|data| data.read().unwrap().clone())
    }

    /// Number of write calls issued through this backend.
    pub fn write_calls(&self) -> usize {
        self.stats.write_calls.load(Ordering::Acquire)
    }

    /// Number of handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.stats.open_handles.load(Ordering::Acquire)
    }
}

struct MemoryFile {
    data: FileData,
    flags: OpenFlags,
    max_write_bytes: Option<usize>,
    stats: Arc<Stats>,
    closed: AtomicBool,
}

impl MemoryFile {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("file"));
        }
        Ok(())
    }

    fn denied(operation: &str) -> Error {
        Error::Io {
            kind: ErrorKind::PermissionDenied,
            message: format!("file is not open for {operation}"),
        }
    }
}

#[async_trait]
impl NativeFile for MemoryFile {
    async fn read(&self, max_bytes: usize, offset: u64) -> Result<Option<Chunk<u8>>> {
        self.check_open()?;
        if !self.flags.read {
            return Err(Self::denied("reading"));
        }
        let data = self.data.read().unwrap();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        if start >= data.len() || max_bytes == 0 {
            return Ok(None);
        }
        let end = start.saturating_add(max_bytes).min(data.len());
        Ok(Some(Chunk::from(&data[start..end])))
    }

    async fn write(&self, bytes: &Chunk<u8>, offset: u64) -> Result<usize> {
        self.check_open()?;
        if !self.flags.write && !self.flags.append {
            return Err(Self::denied("writing"));
        }
        self.stats.write_calls.fetch_add(1, Ordering::AcqRel);
        let n = bytes.len().min(self.max_write_bytes.unwrap_or(usize::MAX));
        let mut data = self.data.write().unwrap();
        let start = if self.flags.append {
            data.len()
        } else {
            usize::try_from(offset).map_err(|_| Error::Io {
                kind: ErrorKind::InvalidInput,
                message: format!("offset {offset} out of range"),
            })?
        };
        let end = start.checked_add(n).ok_or_else(|| Error::Io {
            kind: ErrorKind::InvalidInput,
            message: format!("write of {n} bytes at offset {offset} out of range"),
        })?;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    async fn size(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.data.read().unwrap().len() as u64)
    }

    async fn truncate(&self, size: u64) -> Result<()> {
        self.check_open()?;
        let size = usize::try_from(size).unwrap_or(usize::MAX);
        self.data.write().unwrap().resize(size, 0);
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        self.check_open()
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.stats.open_handles.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

#[async_trait]
impl FileBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle> {
        let data = {
            let mut files = self.files.write().unwrap();
            match files.get(path) {
                Some(data) => {
                    if flags.truncate {
                        data.write().unwrap().clear();
                    }
                    data.clone()
                }
                None if flags.create => {
                    let data = FileData::default();
                    files.insert(path.to_path_buf(), data.clone());
                    data
                }
                None => {
                    return Err(Error::Io {
                        kind: ErrorKind::NotFound,
                        message: format!("{} does not exist", path.display()),
                    })
                }
            }
        };
        self.stats.open_handles.fetch_add(1, Ordering::AcqRel);
        let native = MemoryFile {
            data,
            flags,
            max_write_bytes: self.max_write_bytes,
            stats: self.stats.clone(),
            closed: AtomicBool::new(false),
        };
        Ok(FileHandle::new(Arc::new(native), path))
    }
}

struct MemoryBackendFactory;

impl FileBackendFactory for MemoryBackendFactory {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn create(&self, config: &FileBackendConfig) -> Result<Arc<dyn FileBackend>> {
        let FileBackendConfig::Memory(config) = config else {
            return Err(Error::InvalidConfig(format!(
                "memory backend cannot use {config} configuration"
            )));
        };
        Ok(Arc::new(MemoryBackend {
            files: SHARED_FILES.clone(),
            max_write_bytes: config.max_write_bytes,
            stats: Arc::default(),
        }))
    }
}

inventory::submit! {
    &MemoryBackendFactory as &dyn FileBackendFactory
}

/// Returns a backend over the files shared with every backend created from
/// a [`FileBackendConfig::Memory`] configuration.
pub fn shared() -> MemoryBackend {
    MemoryBackend {
        files: SHARED_FILES.clone(),
        ..MemoryBackend::default()
    }
}
