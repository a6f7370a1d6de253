//! Persistence Adapter (C10): a thin contract over conversation storage,
//! plus a minimal file-per-conversation reference implementation so the
//! binary runs standalone. Durability/indexing beyond "don't lose data on a
//! crash mid-write" is explicitly not a design target here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::conversation::{Conversation, Message};
use crate::errors::{CouncilError, CouncilResult};

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn create_conversation(&self) -> CouncilResult<Conversation>;
    async fn get(&self, id: Uuid) -> CouncilResult<Conversation>;
    async fn list_active(&self) -> CouncilResult<Vec<Conversation>>;
    async fn list_deleted(&self) -> CouncilResult<Vec<Conversation>>;
    async fn append_message(&self, id: Uuid, message: Message) -> CouncilResult<()>;
    async fn update_title(&self, id: Uuid, title: String) -> CouncilResult<()>;
    async fn soft_delete(&self, id: Uuid) -> CouncilResult<()>;
    async fn restore(&self, id: Uuid) -> CouncilResult<()>;
    async fn hard_delete(&self, id: Uuid) -> CouncilResult<()>;
}

/// File-per-conversation adapter. Each conversation is one JSON file named
/// `<id>.json` under `data_dir`. Writes go through a temp-file-plus-rename
/// so a reader never observes a half-written record. An in-process index
/// avoids a directory scan on every read.
pub struct FileStore {
    data_dir: PathBuf,
    index: RwLock<HashMap<Uuid, Conversation>>,
}

impl FileStore {
    pub async fn open(data_dir: impl Into<PathBuf>) -> CouncilResult<Arc<Self>> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| CouncilError::ConfigInvalid(format!("cannot create data dir: {e}")))?;

        let mut index = HashMap::new();
        let mut entries = tokio::fs::read_dir(&data_dir)
            .await
            .map_err(|e| CouncilError::ConfigInvalid(format!("cannot read data dir: {e}")))?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(&path).await {
                if let Ok(conv) = serde_json::from_slice::<Conversation>(&bytes) {
                    index.insert(conv.id, conv);
                }
            }
        }

        Ok(Arc::new(Self {
            data_dir,
            index: RwLock::new(index),
        }))
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.data_dir.join(format!("{id}.json"))
    }

    async fn write_through(&self, conv: &Conversation) -> CouncilResult<()> {
        let path = self.path_for(conv.id);
        let tmp_path = tmp_path_for(&path);
        let bytes = serde_json::to_vec_pretty(conv)
            .map_err(|e| CouncilError::ProtocolError(format!("serialize conversation: {e}")))?;
        tokio::fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| CouncilError::ProtocolError(format!("write conversation: {e}")))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| CouncilError::ProtocolError(format!("rename conversation file: {e}")))?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[async_trait]
impl PersistenceAdapter for FileStore {
    async fn create_conversation(&self) -> CouncilResult<Conversation> {
        let conv = Conversation::new();
        self.write_through(&conv).await?;
        self.index.write().await.insert(conv.id, conv.clone());
        Ok(conv)
    }

    async fn get(&self, id: Uuid) -> CouncilResult<Conversation> {
        self.index
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CouncilError::NotFound(id.to_string()))
    }

    async fn list_active(&self) -> CouncilResult<Vec<Conversation>> {
        let mut list: Vec<Conversation> = self
            .index
            .read()
            .await
            .values()
            .filter(|c| !c.deleted)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn list_deleted(&self) -> CouncilResult<Vec<Conversation>> {
        let mut list: Vec<Conversation> = self
            .index
            .read()
            .await
            .values()
            .filter(|c| c.deleted)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn append_message(&self, id: Uuid, message: Message) -> CouncilResult<()> {
        let mut index = self.index.write().await;
        let conv = index
            .get_mut(&id)
            .ok_or_else(|| CouncilError::NotFound(id.to_string()))?;
        conv.messages.push(message);
        let snapshot = conv.clone();
        drop(index);
        self.write_through(&snapshot).await
    }

    async fn update_title(&self, id: Uuid, title: String) -> CouncilResult<()> {
        let mut index = self.index.write().await;
        let conv = index
            .get_mut(&id)
            .ok_or_else(|| CouncilError::NotFound(id.to_string()))?;
        conv.title = title;
        let snapshot = conv.clone();
        drop(index);
        self.write_through(&snapshot).await
    }

    async fn soft_delete(&self, id: Uuid) -> CouncilResult<()> {
        let mut index = self.index.write().await;
        let conv = index
            .get_mut(&id)
            .ok_or_else(|| CouncilError::NotFound(id.to_string()))?;
        conv.soft_delete();
        let snapshot = conv.clone();
        drop(index);
        self.write_through(&snapshot).await
    }

    async fn restore(&self, id: Uuid) -> CouncilResult<()> {
        let mut index = self.index.write().await;
        let conv = index
            .get_mut(&id)
            .ok_or_else(|| CouncilError::NotFound(id.to_string()))?;
        conv.restore();
        let snapshot = conv.clone();
        drop(index);
        self.write_through(&snapshot).await
    }

    async fn hard_delete(&self, id: Uuid) -> CouncilResult<()> {
        let mut index = self.index.write().await;
        if index.remove(&id).is_none() {
            return Err(CouncilError::NotFound(id.to_string()));
        }
        drop(index);
        let path = self.path_for(id);
        let _ = tokio::fs::remove_file(&path).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let conv = store.create_conversation().await.unwrap();
        let fetched = store.get(conv.id).await.unwrap();
        assert_eq!(fetched.id, conv.id);
        assert_eq!(fetched.title, conv.title);
    }

    #[tokio::test]
    async fn test_append_message_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let conv = store.create_conversation().await.unwrap();
        store
            .append_message(conv.id, Message::user("hello"))
            .await
            .unwrap();
        let fetched = store.get(conv.id).await.unwrap();
        assert_eq!(fetched.messages.len(), 1);

        // Reopen from disk to confirm durability across a fresh index load.
        let reopened = FileStore::open(dir.path()).await.unwrap();
        let fetched_again = reopened.get(conv.id).await.unwrap();
        assert_eq!(fetched_again.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_soft_delete_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let conv = store.create_conversation().await.unwrap();
        store.soft_delete(conv.id).await.unwrap();
        assert!(store.list_active().await.unwrap().is_empty());
        assert_eq!(store.list_deleted().await.unwrap().len(), 1);
        store.restore(conv.id).await.unwrap();
        assert_eq!(store.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let err = store.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CouncilError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_hard_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let conv = store.create_conversation().await.unwrap();
        store.hard_delete(conv.id).await.unwrap();
        assert!(store.get(conv.id).await.is_err());
    }
}
