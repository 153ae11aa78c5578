//! Durable key-value storage
//!
//! The queue and the cache persist through [`DurableStore`]. Two
//! implementations are provided:
//! - [`MemoryStore`] for tests and ephemeral sessions
//! - [`FileStore`], one file per key with atomic temp-file + rename writes
//!
//! Every mutation is serialized behind a single internal lock.

use crate::error::StoreError;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Extension used for records named after their key
const RECORD_EXTENSION: &str = "rec";

/// Extension used for records named after a digest of their key
const DIGEST_EXTENSION: &str = "hrec";

/// Longest key stored under its own hex name; hex doubles the length and
/// file names are limited to 255 bytes
const MAX_INLINE_KEY_LEN: usize = 120;

/// Key-value persistence that survives process restart
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Insert or overwrite; durable once this returns
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove a key; removing a missing key is not an error
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`, sorted by key
    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

/// Read and decode a JSON record
pub fn get_json<T: DeserializeOwned>(
    store: &dyn DurableStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::codec(key, e)),
        None => Ok(None),
    }
}

/// Encode and write a JSON record
pub fn put_json<T: Serialize>(
    store: &dyn DurableStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::codec(key, e))?;
    store.put(key, &bytes)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn range_prefix(entries: &BTreeMap<String, Vec<u8>>, prefix: &str) -> Vec<(String, Vec<u8>)> {
    entries
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(range_prefix(&lock(&self.entries), prefix))
    }
}

/// File-backed store, one file per key
///
/// File names are the hex encoding of the key, so arbitrary keys
/// (including `/`) map onto a flat directory. Keys too long for a file name
/// are stored under the SHA-256 of the key instead, with the key itself
/// written ahead of the value. The directory is indexed into memory at open;
/// reads are served from the index and writes go to disk first, then to the
/// index.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    index: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FileStore {
    /// Open (or create) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        let dir_key = dir.display().to_string();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir_key, e))?;

        let mut index = BTreeMap::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| StoreError::io(&dir_key, e))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let digest_named = match path.extension().and_then(|s| s.to_str()) {
                Some(RECORD_EXTENSION) => false,
                Some(DIGEST_EXTENSION) => true,
                _ => continue,
            };
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read stored record");
                    continue;
                }
            };
            let record = if digest_named {
                split_keyed_record(bytes)
            } else {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|stem| hex::decode(stem).ok())
                    .and_then(|raw| String::from_utf8(raw).ok())
                    .map(|key| (key, bytes))
            };
            match record {
                Some((key, value)) => {
                    index.insert(key, value);
                }
                None => {
                    warn!(path = %path.display(), "Skipping unrecognised file in store directory");
                }
            }
        }

        info!(path = %dir.display(), entries = index.len(), "Opened durable store");
        Ok(Self {
            dir,
            index: Mutex::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        if key.len() > MAX_INLINE_KEY_LEN {
            let digest = Sha256::digest(key.as_bytes());
            return self
                .dir
                .join(format!("{}.{}", hex::encode(digest), DIGEST_EXTENSION));
        }
        self.dir
            .join(format!("{}.{}", hex::encode(key.as_bytes()), RECORD_EXTENSION))
    }

    fn write_atomic(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let temp_path = path.with_extension("tmp");

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| StoreError::io(key, e))?;
        if key.len() > MAX_INLINE_KEY_LEN {
            // Digest-named records carry their key: u32 length, then the key.
            file.write_all(&(key.len() as u32).to_le_bytes())
                .and_then(|_| file.write_all(key.as_bytes()))
                .map_err(|e| StoreError::io(key, e))?;
        }
        file.write_all(value).map_err(|e| StoreError::io(key, e))?;
        file.sync_all().map_err(|e| StoreError::io(key, e))?;

        std::fs::rename(&temp_path, &path).map_err(|e| StoreError::io(key, e))?;
        self.sync_dir().map_err(|e| StoreError::io(key, e))?;
        Ok(())
    }

    /// Flush directory entries so renames and removals survive a crash
    #[cfg(unix)]
    fn sync_dir(&self) -> std::io::Result<()> {
        std::fs::File::open(&self.dir)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Split a digest-named record into its key and value
fn split_keyed_record(mut bytes: Vec<u8>) -> Option<(String, Vec<u8>)> {
    let len_bytes: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    let key_end = 4usize.checked_add(u32::from_le_bytes(len_bytes) as usize)?;
    let key = String::from_utf8(bytes.get(4..key_end)?.to_vec()).ok()?;
    let value = bytes.split_off(key_end);
    Some((key, value))
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(lock(&self.index).get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut index = lock(&self.index);
        self.write_atomic(key, value)?;
        index.insert(key.to_string(), value.to_vec());
        debug!(key = %key, bytes = value.len(), "Record persisted");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut index = lock(&self.index);
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(key, e)),
        }
        self.sync_dir().map_err(|e| StoreError::io(key, e))?;
        index.remove(key);
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(range_prefix(&lock(&self.index), prefix))
    }
}
