//! File-like I/O abstraction.
//!
//! Frames never touch `std::fs` directly: they go through an [`IoBackend`]
//! resolved from the urlpath's scheme. The default backend is the local
//! filesystem; a `mem:` backend ships for in-memory storage and tests.
//! Alternative backends register under their own scheme.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use crate::error::{Error, Result};
use crate::util;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate.
    Write,
    /// Open existing for update.
    ReadWrite,
}

/// An open file-like object. Offsets are absolute.
pub trait IoHandle: Send {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize>;
    fn truncate(&mut self, len: u64) -> Result<()>;
    fn size(&mut self) -> Result<u64>;
}

/// A storage scheme: opens handles and manages paths.
pub trait IoBackend: Send + Sync {
    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn IoHandle>>;
    fn destroy(&self, path: &str) -> Result<()>;
    fn exists(&self, path: &str) -> bool;
    fn create_dir(&self, path: &str) -> Result<()>;
    fn is_dir(&self, path: &str) -> bool;
}

// Local filesystem backend.

struct FileIo;

struct FileHandle {
    file: File,
}

impl IoHandle for FileHandle {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(data.len())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl IoBackend for FileIo {
    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn IoHandle>> {
        let file = match mode {
            OpenMode::Read => OpenOptions::new().read(true).open(path)?,
            OpenMode::Write => OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?,
            OpenMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path)?,
        };
        Ok(Box::new(FileHandle { file }))
    }

    fn destroy(&self, path: &str) -> Result<()> {
        if Path::new(path).is_dir() {
            std::fs::remove_dir_all(path)?;
        } else if Path::new(path).exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn create_dir(&self, path: &str) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn is_dir(&self, path: &str) -> bool {
        Path::new(path).is_dir()
    }
}

// In-memory backend, addressed as `mem:name`.

type MemStore = Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>;

fn mem_store() -> &'static MemStore {
    static STORE: OnceLock<MemStore> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(HashMap::new()))
}

struct MemIo;

struct MemHandle {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl IoHandle for MemHandle {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        let start = offset as usize;
        buf.get(start..start + len).map(<[u8]>::to_vec).ok_or(Error::ReadBuffer)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        let end = offset as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset as usize..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        buf.resize(len as usize, 0);
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.buf.lock().unwrap_or_else(|e| e.into_inner()).len() as u64)
    }
}

impl IoBackend for MemIo {
    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn IoHandle>> {
        let mut store = mem_store().lock().unwrap_or_else(|e| e.into_inner());
        let entry = match mode {
            OpenMode::Read | OpenMode::ReadWrite => store
                .get(path)
                .cloned()
                .ok_or_else(|| Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))?,
            OpenMode::Write => {
                let buf = Arc::new(Mutex::new(Vec::new()));
                store.insert(path.to_string(), buf.clone());
                buf
            }
        };
        Ok(Box::new(MemHandle { buf: entry }))
    }

    fn destroy(&self, path: &str) -> Result<()> {
        let mut store = mem_store().lock().unwrap_or_else(|e| e.into_inner());
        // Directory semantics: drop the path and everything under it.
        let prefix = format!("{path}/");
        store.retain(|k, _| k != path && !k.starts_with(&prefix));
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        let store = mem_store().lock().unwrap_or_else(|e| e.into_inner());
        let prefix = format!("{path}/");
        store.contains_key(path) || store.keys().any(|k| k.starts_with(&prefix))
    }

    fn create_dir(&self, _path: &str) -> Result<()> {
        // Directories are implicit in the key space.
        Ok(())
    }

    fn is_dir(&self, path: &str) -> bool {
        let store = mem_store().lock().unwrap_or_else(|e| e.into_inner());
        let prefix = format!("{path}/");
        !store.contains_key(path) && store.keys().any(|k| k.starts_with(&prefix))
    }
}

// Scheme registry.

type BackendMap = RwLock<HashMap<String, Arc<dyn IoBackend>>>;

fn backends() -> &'static BackendMap {
    static BACKENDS: OnceLock<BackendMap> = OnceLock::new();
    BACKENDS.get_or_init(|| {
        let mut map: HashMap<String, Arc<dyn IoBackend>> = HashMap::new();
        map.insert("file".to_string(), Arc::new(FileIo));
        map.insert("mem".to_string(), Arc::new(MemIo));
        RwLock::new(map)
    })
}

/// Register an I/O backend for a URI scheme.
pub fn register_io_backend(scheme: &str, backend: Arc<dyn IoBackend>) -> Result<()> {
    let mut map = backends().write().unwrap_or_else(|e| e.into_inner());
    if map.contains_key(scheme) {
        return Err(Error::InvalidParam("io scheme already registered"));
    }
    map.insert(scheme.to_string(), backend);
    Ok(())
}

/// Split a urlpath into its backend and local path. Paths without a scheme
/// (or with the `file://` prefix) go to the filesystem backend.
pub fn resolve(urlpath: &str) -> Result<(Arc<dyn IoBackend>, String)> {
    let (scheme, rest) = match urlpath.split_once(':') {
        // Windows drive letters are not schemes.
        Some((s, rest)) if s.len() > 1 => (s, rest),
        _ => ("file", urlpath),
    };
    let path = rest.strip_prefix("//").unwrap_or(rest);
    let map = backends().read().unwrap_or_else(|e| e.into_inner());
    let backend = map
        .get(scheme)
        .cloned()
        .ok_or(Error::InvalidParam("no io backend registered for this scheme"))?;
    Ok((backend, path.to_string()))
}

/// Advisory lock held while writing a frame file. A no-op under
/// `BLOSC_NOLOCK` and for non-file backends.
pub struct FrameLock {
    lockfile: Option<String>,
}

impl FrameLock {
    pub fn acquire(urlpath: &str) -> Result<FrameLock> {
        if util::env_flag("BLOSC_NOLOCK") || urlpath.split_once(':').is_some_and(|(s, _)| s.len() > 1 && s != "file") {
            return Ok(FrameLock { lockfile: None });
        }
        let path = format!("{}.lock", urlpath.strip_prefix("file://").unwrap_or(urlpath));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(FrameLock { lockfile: Some(path) }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::NotSupported("frame is locked by another writer"))
            }
            // A non-writable location: proceed unlocked.
            Err(_) => Ok(FrameLock { lockfile: None }),
        }
    }
}

impl Drop for FrameLock {
    fn drop(&mut self) {
        if let Some(path) = &self.lockfile {
            let _ = std::fs::remove_file(path);
        }
    }
}
