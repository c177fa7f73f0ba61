//! I/O managers used as tile sinks and sources

use crate::error::{CivdError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
    /// Process-local in-memory store
    Memory,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                "mem" => Ok(StorageBackend::Memory),
                _ => Err(CivdError::InvalidUrl(format!("Unknown scheme: {}", scheme))),
            }
        } else {
            // Assume file system if no scheme
            Ok(StorageBackend::FileSystem)
        }
    }
}

/// Named-slot storage that tile packs are written to and read from
#[async_trait]
pub trait IOManager: Send + Sync {
    /// Read data from a path
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write data to a path
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Delete data at a path
    async fn delete(&self, path: &str) -> Result<()>;

    /// Names of the items directly under `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get the size of data at a path
    async fn size(&self, path: &str) -> Result<usize>;

    /// Get the backend type
    fn backend(&self) -> StorageBackend;
}

/// File system I/O manager
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    /// Create a new file system I/O manager
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

#[async_trait]
impl IOManager for FileSystemIOManager {
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.full_path(path);
        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CivdError::NotFound(full_path.display().to_string()))
            }
            Err(e) => Err(CivdError::Io(e)),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        // Create parent directories if they don't exist
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&full_path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(path)).await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.full_path(path)).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(prefix);
        let mut entries = Vec::new();

        if full_path.is_dir() {
            let mut read_dir = fs::read_dir(&full_path).await?;

            while let Some(entry) = read_dir.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    entries.push(name.to_string());
                }
            }
        }

        entries.sort();
        Ok(entries)
    }

    async fn size(&self, path: &str) -> Result<usize> {
        let metadata = fs::metadata(self.full_path(path)).await?;
        Ok(metadata.len() as usize)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }
}

/// In-memory I/O manager; clones share the same store
#[derive(Clone, Default)]
pub struct MemoryIOManager {
    slots: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryIOManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored slots
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

#[async_trait]
impl IOManager for MemoryIOManager {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.slots
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| CivdError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.slots
            .write()
            .insert(path.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.slots.read().contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.slots
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| CivdError::NotFound(path.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = match prefix.trim_end_matches('/') {
            "" => String::new(),
            trimmed => format!("{}/", trimmed),
        };
        let mut entries: Vec<String> = self
            .slots
            .read()
            .keys()
            .filter_map(|key| key.strip_prefix(dir.as_str()))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    async fn size(&self, path: &str) -> Result<usize> {
        self.slots
            .read()
            .get(path)
            .map(Bytes::len)
            .ok_or_else(|| CivdError::NotFound(path.to_string()))
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

/// Parse URL and create appropriate I/O manager
///
/// `file://` URLs and bare paths map to [`FileSystemIOManager`]; `mem://`
/// creates a fresh [`MemoryIOManager`]. Any other store plugs in by
/// implementing [`IOManager`] directly.
pub async fn create_io_manager(url: &str) -> Result<Box<dyn IOManager>> {
    let backend = StorageBackend::from_url(url)?;

    match backend {
        StorageBackend::FileSystem => {
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Box::new(FileSystemIOManager::new(path)))
        }
        StorageBackend::Memory => Ok(Box::new(MemoryIOManager::new())),
    }
}
