//! Persistent memory backends.
//!
//! [`MemoryBackend`] is the abstract contract; [`FileMemory`] is the bundled
//! implementation, serializing `{entries, updated_at}` to a single JSON file
//! with write-temp-then-rename atomic replacement so a crash mid-save never
//! corrupts the store.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// One remembered item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Unix seconds.
    pub timestamp: u64,
}

impl MemoryEntry {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: Value::Null,
            embedding: None,
            timestamp: unix_now(),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Abstract memory contract.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn store(&self, entry: MemoryEntry) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>>;
    /// Case-insensitive substring search over entry content, newest first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>>;
    async fn delete(&self, id: &str) -> Result<bool>;
    async fn clear(&self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct MemoryFile {
    entries: Vec<MemoryEntry>,
    updated_at: u64,
}

/// JSON-file backed memory store.
pub struct FileMemory {
    path: PathBuf,
    entries: Mutex<Vec<MemoryEntry>>,
}

impl FileMemory {
    /// Open (or create) a store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: MemoryFile = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Memory(format!("corrupt memory file: {}", e)))?;
                file.entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Error::Memory(format!("failed to read memory file: {}", e))),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Serialize to a temp file, then rename over the target.
    async fn save(&self) -> Result<()> {
        let file = {
            let entries = self.entries.lock().unwrap();
            MemoryFile {
                entries: entries.clone(),
                updated_at: unix_now(),
            }
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| Error::Memory(format!("failed to write memory file: {}", e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Memory(format!("failed to replace memory file: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl MemoryBackend for FileMemory {
    async fn store(&self, entry: MemoryEntry) -> Result<()> {
        {
            let mut entries = self.entries.lock().unwrap();
            // Same id replaces
            entries.retain(|e| e.id != entry.id);
            entries.push(entry);
        }
        self.save().await
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        let query = query.to_lowercase();
        let mut matches: Vec<MemoryEntry> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.content.to_lowercase().contains(&query))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|e| e.id != id);
            entries.len() != before
        };
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().unwrap().clear();
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("uas-memory-{}-{}.json", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_store_and_reload() {
        let path = temp_path("reload");
        let _ = tokio::fs::remove_file(&path).await;

        let memory = FileMemory::open(&path).await.unwrap();
        memory
            .store(MemoryEntry::new("m1", "the user prefers terse answers"))
            .await
            .unwrap();
        memory
            .store(
                MemoryEntry::new("m2", "project uses postgres")
                    .with_metadata(json!({"topic": "infra"})),
            )
            .await
            .unwrap();
        drop(memory);

        let reopened = FileMemory::open(&path).await.unwrap();
        let entry = reopened.get("m2").await.unwrap().unwrap();
        assert_eq!(entry.content, "project uses postgres");
        assert_eq!(entry.metadata["topic"], "infra");

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_store_replaces_same_id() {
        let path = temp_path("replace");
        let _ = tokio::fs::remove_file(&path).await;

        let memory = FileMemory::open(&path).await.unwrap();
        memory.store(MemoryEntry::new("m1", "old")).await.unwrap();
        memory.store(MemoryEntry::new("m1", "new")).await.unwrap();
        assert_eq!(memory.get("m1").await.unwrap().unwrap().content, "new");
        assert_eq!(memory.search("", 10).await.unwrap().len(), 1);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_search_substring_and_limit() {
        let path = temp_path("search");
        let _ = tokio::fs::remove_file(&path).await;

        let memory = FileMemory::open(&path).await.unwrap();
        memory
            .store(MemoryEntry::new("m1", "Rust borrow checker notes"))
            .await
            .unwrap();
        memory
            .store(MemoryEntry::new("m2", "rust async pitfalls"))
            .await
            .unwrap();
        memory
            .store(MemoryEntry::new("m3", "python gil"))
            .await
            .unwrap();

        let hits = memory.search("RUST", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        let one = memory.search("rust", 1).await.unwrap();
        assert_eq!(one.len(), 1);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let path = temp_path("delete");
        let _ = tokio::fs::remove_file(&path).await;

        let memory = FileMemory::open(&path).await.unwrap();
        memory.store(MemoryEntry::new("m1", "a")).await.unwrap();
        assert!(memory.delete("m1").await.unwrap());
        assert!(!memory.delete("m1").await.unwrap());

        memory.store(MemoryEntry::new("m2", "b")).await.unwrap();
        memory.clear().await.unwrap();
        assert!(memory.get("m2").await.unwrap().is_none());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_no_tmp_file_left_behind() {
        let path = temp_path("atomic");
        let _ = tokio::fs::remove_file(&path).await;

        let memory = FileMemory::open(&path).await.unwrap();
        memory.store(MemoryEntry::new("m1", "x")).await.unwrap();
        assert!(!path.with_extension("tmp").exists());
        assert!(path.exists());

        let _ = tokio::fs::remove_file(&path).await;
    }
}
