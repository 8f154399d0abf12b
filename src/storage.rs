// Storage collaborator: key-addressed blobs
//
// Flash file storage on the board; a directory of files (or memory) here.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait Storage {
    /// Read a blob; missing keys yield `StorageError::NotFound`
    fn read(&mut self, key: &str) -> Result<Vec<u8>, StorageError>;
    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StorageError>;
}

pub fn read_json<T: DeserializeOwned>(
    storage: &mut dyn Storage,
    key: &str,
) -> Result<T, StorageError> {
    let data = storage.read(key)?;
    Ok(serde_json::from_slice(&data)?)
}

pub fn write_json<T: Serialize>(
    storage: &mut dyn Storage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let data = serde_json::to_vec_pretty(value)?;
    storage.write(key, &data)
}

/// One file per key under a root directory
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }
}

impl Storage for FileStorage {
    fn read(&mut self, key: &str) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.root.join(key)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        debug!("Writing {} bytes to {}", data.len(), key);
        fs::write(self.root.join(key), data)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: HashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn read(&mut self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.blobs.insert(key.to_string(), data.to_vec());
        Ok(())
    }
}
