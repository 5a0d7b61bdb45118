//! Local store for received files.
//!
//! Every completed inbound transfer becomes a [`StoredFile`] record plus its
//! bytes. [`DiskStore`] keeps the records in `<store_dir>/index.json`
//! (rewritten atomically) and each blob in `<store_dir>/<id>.bin`.
//! [`MemoryStore`] is the in-process equivalent.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::config::STORED_FILE_TTL;
use crate::utils::atomic_write::atomic_write;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    /// Same as the transfer id.
    pub id: Uuid,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub sender_name: String,
    pub sender_id: String,
    /// Unix milliseconds at completion.
    pub timestamp: u64,
    /// Unix milliseconds after which `prune_expired` removes the file.
    pub expires_at: u64,
}

impl StoredFile {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        file_name: impl Into<String>,
        file_size: u64,
        file_type: impl Into<String>,
        sender_name: impl Into<String>,
        sender_id: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            id,
            file_name: file_name.into(),
            file_size,
            file_type: file_type.into(),
            sender_name: sender_name.into(),
            sender_id: sender_id.into(),
            timestamp,
            expires_at: timestamp + STORED_FILE_TTL.as_millis() as u64,
        }
    }

    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at <= now_millis
    }
}

pub trait FileStore: Send + Sync {
    fn save(&self, file: &StoredFile, data: &[u8]) -> Result<()>;

    /// All records, newest first.
    fn list(&self) -> Result<Vec<StoredFile>>;

    fn load(&self, id: &Uuid) -> Result<Option<(StoredFile, Bytes)>>;

    /// Returns whether the record existed.
    fn delete(&self, id: &Uuid) -> Result<bool>;

    /// Remove records past their expiry. Returns how many were removed.
    fn prune_expired(&self, now_millis: u64) -> Result<usize>;

    /// Remove everything. Returns how many records were removed.
    fn clear(&self) -> Result<usize>;
}

fn newest_first(mut files: Vec<StoredFile>) -> Vec<StoredFile> {
    files.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    files
}

/// Write a stored file's bytes into `dest_dir`, never overwriting an existing
/// file: `report.pdf` becomes `report (1).pdf` when taken.
pub fn export_file(dest_dir: &Path, file: &StoredFile, data: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dest_dir).with_context(|| format!("creating {}", dest_dir.display()))?;
    let name = sanitize_file_name(&file.file_name);
    let original = Path::new(&name);
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    let ext = original.extension().map(|e| e.to_string_lossy().into_owned());

    let mut target = dest_dir.join(&name);
    let mut n = 1;
    while target.exists() {
        let candidate = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        target = dest_dir.join(candidate);
        n += 1;
    }
    std::fs::write(&target, data).with_context(|| format!("writing {}", target.display()))?;
    info!(event = "file_exported", id = %file.id, path = %target.display(), "Exported file");
    Ok(target)
}

/// Keep only the final path component of a peer-supplied name.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." {
        "file".to_string()
    } else {
        base.to_string()
    }
}

// ── Disk ─────────────────────────────────────────────────────────────────────

pub struct DiskStore {
    dir: PathBuf,
    // Serializes index read-modify-write cycles.
    index_lock: Mutex<()>,
}

impl DiskStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self {
            dir,
            index_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    fn blob_path(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{id}.bin"))
    }

    fn read_index(&self) -> HashMap<Uuid, StoredFile> {
        let path = self.index_path();
        if !path.exists() {
            return HashMap::new();
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(event = "store_index_read_failure", path = %path.display(), error = %e, "Failed to read store index");
                return HashMap::new();
            }
        };
        match serde_json::from_str::<Vec<StoredFile>>(&content) {
            Ok(files) => files.into_iter().map(|f| (f.id, f)).collect(),
            Err(e) => {
                error!(event = "store_index_parse_failure", error = %e, "Store index unreadable, starting fresh");
                HashMap::new()
            }
        }
    }

    fn write_index(&self, index: &HashMap<Uuid, StoredFile>) -> Result<()> {
        let files = newest_first(index.values().cloned().collect());
        let content = serde_json::to_string_pretty(&files)?;
        atomic_write(&self.index_path(), content.as_bytes())
    }

    fn with_index<R>(&self, f: impl FnOnce(&mut HashMap<Uuid, StoredFile>) -> Result<R>) -> Result<R> {
        let _guard = self.index_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut index = self.read_index();
        f(&mut index)
    }

    fn remove_blob(&self, id: &Uuid) {
        let path = self.blob_path(id);
        if let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(event = "store_blob_remove_failure", path = %path.display(), error = %e, "Failed to remove blob");
        }
    }
}

impl FileStore for DiskStore {
    fn save(&self, file: &StoredFile, data: &[u8]) -> Result<()> {
        atomic_write(&self.blob_path(&file.id), data)?;
        self.with_index(|index| {
            index.insert(file.id, file.clone());
            self.write_index(index)
        })?;
        info!(event = "file_stored", id = %file.id, name = %file.file_name, bytes = data.len(), "Stored received file");
        Ok(())
    }

    fn list(&self) -> Result<Vec<StoredFile>> {
        self.with_index(|index| Ok(newest_first(index.values().cloned().collect())))
    }

    fn load(&self, id: &Uuid) -> Result<Option<(StoredFile, Bytes)>> {
        let Some(file) = self.with_index(|index| Ok(index.get(id).cloned()))? else {
            return Ok(None);
        };
        let path = self.blob_path(id);
        let data = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        Ok(Some((file, Bytes::from(data))))
    }

    fn delete(&self, id: &Uuid) -> Result<bool> {
        let existed = self.with_index(|index| {
            let existed = index.remove(id).is_some();
            if existed {
                self.write_index(index)?;
            }
            Ok(existed)
        })?;
        if existed {
            self.remove_blob(id);
            debug!(event = "file_deleted", id = %id, "Deleted stored file");
        }
        Ok(existed)
    }

    fn prune_expired(&self, now_millis: u64) -> Result<usize> {
        let expired: Vec<Uuid> = self.with_index(|index| {
            let expired: Vec<Uuid> = index
                .values()
                .filter(|f| f.is_expired(now_millis))
                .map(|f| f.id)
                .collect();
            if !expired.is_empty() {
                for id in &expired {
                    index.remove(id);
                }
                self.write_index(index)?;
            }
            Ok(expired)
        })?;
        for id in &expired {
            self.remove_blob(id);
        }
        if !expired.is_empty() {
            info!(event = "store_pruned", removed = expired.len(), "Pruned expired files");
        }
        Ok(expired.len())
    }

    fn clear(&self) -> Result<usize> {
        let ids: Vec<Uuid> = self.with_index(|index| {
            let ids: Vec<Uuid> = index.keys().copied().collect();
            index.clear();
            self.write_index(index)?;
            Ok(ids)
        })?;
        for id in &ids {
            self.remove_blob(id);
        }
        Ok(ids.len())
    }
}

// ── Memory ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<HashMap<Uuid, (StoredFile, Bytes)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, (StoredFile, Bytes)>> {
        self.files.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl FileStore for MemoryStore {
    fn save(&self, file: &StoredFile, data: &[u8]) -> Result<()> {
        self.files()
            .insert(file.id, (file.clone(), Bytes::copy_from_slice(data)));
        Ok(())
    }

    fn list(&self) -> Result<Vec<StoredFile>> {
        Ok(newest_first(self.files().values().map(|(f, _)| f.clone()).collect()))
    }

    fn load(&self, id: &Uuid) -> Result<Option<(StoredFile, Bytes)>> {
        Ok(self.files().get(id).cloned())
    }

    fn delete(&self, id: &Uuid) -> Result<bool> {
        Ok(self.files().remove(id).is_some())
    }

    fn prune_expired(&self, now_millis: u64) -> Result<usize> {
        let mut files = self.files();
        let before = files.len();
        files.retain(|_, (f, _)| !f.is_expired(now_millis));
        Ok(before - files.len())
    }

    fn clear(&self) -> Result<usize> {
        let mut files = self.files();
        let n = files.len();
        files.clear();
        Ok(n)
    }
}
