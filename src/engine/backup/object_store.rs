// Object-store seam for backups. Blobs are opaque and addressed by
// `(owner_id, key)`; implementations never look inside them.

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::atoms::error::{EngineError, EngineResult};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &str;

    async fn put(&self, owner_id: &str, key: &str, bytes: Vec<u8>) -> EngineResult<()>;

    /// `None` when the object does not exist.
    async fn get(&self, owner_id: &str, key: &str) -> EngineResult<Option<Vec<u8>>>;

    /// Returns whether the object existed.
    async fn delete(&self, owner_id: &str, key: &str) -> EngineResult<bool>;

    /// Keys under `owner_id`, sorted.
    async fn list(&self, owner_id: &str) -> EngineResult<Vec<String>>;
}

/// Owner ids and keys become path segments and URL path components.
pub(crate) fn check_segment(what: &str, value: &str) -> EngineResult<()> {
    let ok = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if ok {
        Ok(())
    } else {
        Err(EngineError::InvalidInput(format!("invalid {what} '{value}'")))
    }
}

// ── In-memory ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored objects across owners.
    pub fn object_count(&self) -> usize {
        self.objects.lock().values().map(|m| m.len()).sum()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, owner_id: &str, key: &str, bytes: Vec<u8>) -> EngineResult<()> {
        check_segment("owner id", owner_id)?;
        check_segment("object key", key)?;
        self.objects
            .lock()
            .entry(owner_id.to_string())
            .or_default()
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, owner_id: &str, key: &str) -> EngineResult<Option<Vec<u8>>> {
        Ok(self
            .objects
            .lock()
            .get(owner_id)
            .and_then(|m| m.get(key).cloned()))
    }

    async fn delete(&self, owner_id: &str, key: &str) -> EngineResult<bool> {
        Ok(self
            .objects
            .lock()
            .get_mut(owner_id)
            .map(|m| m.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, owner_id: &str) -> EngineResult<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .get(owner_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }
}

// ── Local directory ────────────────────────────────────────────────────────

/// `<root>/<owner_id>/<key>`. Writes go to a temp file first and are renamed
/// into place.
pub struct LocalDirObjectStore {
    root: PathBuf,
}

impl LocalDirObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, owner_id: &str, key: &str) -> EngineResult<PathBuf> {
        check_segment("owner id", owner_id)?;
        check_segment("object key", key)?;
        Ok(self.root.join(owner_id).join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalDirObjectStore {
    fn name(&self) -> &str {
        "local-dir"
    }

    async fn put(&self, owner_id: &str, key: &str, bytes: Vec<u8>) -> EngineResult<()> {
        let path = self.path(owner_id, key)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("[kmem-backup] Wrote {} bytes to {:?}", bytes.len(), path);
        Ok(())
    }

    async fn get(&self, owner_id: &str, key: &str) -> EngineResult<Option<Vec<u8>>> {
        let path = self.path(owner_id, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, owner_id: &str, key: &str) -> EngineResult<bool> {
        let path = self.path(owner_id, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, owner_id: &str) -> EngineResult<Vec<String>> {
        check_segment("owner id", owner_id)?;
        let dir = self.root.join(owner_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".part") {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
