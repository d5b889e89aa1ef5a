//! Remote document stores. The coordinator only needs create, update, list and delete by id,
//! and every document body is an [EncryptedSnapshot].

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fs::operations::{read_optional, remove_optional, write_atomic};

use super::snapshot::EncryptedSnapshot;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote store is unavailable: {0}")]
    Unavailable(String),
    #[error("remote document {0} does not exist")]
    NotFound(String),
    #[error("remote store rejected the request: {0}")]
    Rejected(String),
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to prepare the document: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    pub id: String,
    pub user_id: String,
    pub body: EncryptedSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentPage {
    pub documents: Vec<RemoteDocument>,
    /// Token for the following page, `None` on the last one.
    pub next_page: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteDocumentStore: Send + Sync {
    /// Stores a new document and returns its id.
    async fn create(&self, user_id: &str, body: &EncryptedSnapshot) -> Result<String, RemoteError>;

    async fn update(&self, id: &str, body: &EncryptedSnapshot) -> Result<(), RemoteError>;

    /// Documents of `user_id` ordered by id, at most `page_size` per page.
    async fn list(
        &self,
        user_id: &str,
        page_size: usize,
        page_token: Option<String>,
    ) -> Result<DocumentPage, RemoteError>;

    async fn delete(&self, id: &str) -> Result<(), RemoteError>;
}

fn page_of(
    mut documents: Vec<RemoteDocument>,
    page_size: usize,
    page_token: Option<String>,
) -> DocumentPage {
    let page_size = page_size.max(1);
    documents.sort_by(|a, b| a.id.cmp(&b.id));
    documents.retain(|d| page_token.as_ref().map_or(true, |token| d.id > *token));
    let next_page = (documents.len() > page_size).then(|| documents[page_size - 1].id.clone());
    documents.truncate(page_size);
    DocumentPage {
        documents,
        next_page,
    }
}

/// Store kept in memory. Can be switched off to simulate an unreachable server.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<BTreeMap<String, RemoteDocument>>,
    unavailable: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RemoteError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RemoteDocumentStore for MemoryDocumentStore {
    async fn create(&self, user_id: &str, body: &EncryptedSnapshot) -> Result<String, RemoteError> {
        self.check()?;
        let id = Uuid::new_v4().simple().to_string();
        self.documents.lock().await.insert(
            id.clone(),
            RemoteDocument {
                id: id.clone(),
                user_id: user_id.to_string(),
                body: body.clone(),
            },
        );
        Ok(id)
    }

    async fn update(&self, id: &str, body: &EncryptedSnapshot) -> Result<(), RemoteError> {
        self.check()?;
        let mut documents = self.documents.lock().await;
        let document = documents
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        document.body = body.clone();
        Ok(())
    }

    async fn list(
        &self,
        user_id: &str,
        page_size: usize,
        page_token: Option<String>,
    ) -> Result<DocumentPage, RemoteError> {
        self.check()?;
        let documents = self
            .documents
            .lock()
            .await
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        Ok(page_of(documents, page_size, page_token))
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        self.check()?;
        self.documents.lock().await.remove(id);
        Ok(())
    }
}

const DOCUMENT_EXTENSION: &str = "json";

/// One JSON file per document in a directory. Pointing it at a folder that another tool
/// replicates gives multi-device sync without a server.
pub struct DirectoryDocumentStore {
    dir: PathBuf,
}

fn unavailable(e: impl std::fmt::Display) -> RemoteError {
    RemoteError::Unavailable(e.to_string())
}

impl DirectoryDocumentStore {
    pub fn new(dir: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, RemoteError> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(RemoteError::Rejected(format!("illegal document id {id:?}")));
        }
        Ok(self.dir.join(format!("{id}.{DOCUMENT_EXTENSION}")))
    }

    async fn write(&self, document: &RemoteDocument) -> Result<(), RemoteError> {
        let bytes =
            serde_json::to_vec_pretty(document).map_err(|e| RemoteError::Encoding(e.to_string()))?;
        write_atomic(&self.path_for(&document.id)?, &bytes)
            .await
            .map_err(unavailable)
    }

    async fn read(&self, id: &str) -> Result<Option<RemoteDocument>, RemoteError> {
        let Some(bytes) = read_optional(&self.path_for(id)?).await.map_err(unavailable)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(document) => Ok(Some(document)),
            Err(e) => {
                warn!("Skipping unreadable document {id}: {e}");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl RemoteDocumentStore for DirectoryDocumentStore {
    async fn create(&self, user_id: &str, body: &EncryptedSnapshot) -> Result<String, RemoteError> {
        let document = RemoteDocument {
            id: Uuid::new_v4().simple().to_string(),
            user_id: user_id.to_string(),
            body: body.clone(),
        };
        self.write(&document).await?;
        debug!("Created remote document {}", document.id);
        Ok(document.id)
    }

    async fn update(&self, id: &str, body: &EncryptedSnapshot) -> Result<(), RemoteError> {
        let mut document = self
            .read(id)
            .await?
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        document.body = body.clone();
        self.write(&document).await
    }

    async fn list(
        &self,
        user_id: &str,
        page_size: usize,
        page_token: Option<String>,
    ) -> Result<DocumentPage, RemoteError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(unavailable)?;
        let mut documents = vec![];
        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            let path = entry.path();
            if path.extension().and_then(|v| v.to_str()) != Some(DOCUMENT_EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|v| v.to_str()) else {
                continue;
            };
            if let Some(document) = self.read(id).await? {
                if document.user_id == user_id {
                    documents.push(document);
                }
            }
        }
        Ok(page_of(documents, page_size, page_token))
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        remove_optional(&self.path_for(id)?)
            .await
            .map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    use super::{DirectoryDocumentStore, MemoryDocumentStore, RemoteDocumentStore, RemoteError};
    use crate::{crypto::store::SealedDocument, sync::snapshot::EncryptedSnapshot};

    fn body(device: &str) -> EncryptedSnapshot {
        EncryptedSnapshot {
            sealed: SealedDocument {
                key_id: "k".into(),
                salt: None,
                kdf: None,
                nonce: "bm9uY2U=".into(),
                ciphertext: "Y2lwaGVy".into(),
                integrity_hash: "00".into(),
            },
            schema_version: 2,
            device_id: device.into(),
            updated_at: Utc.with_ymd_and_hms(2018, 7, 4, 0, 0, 0).unwrap(),
        }
    }

    async fn exercise(store: &dyn RemoteDocumentStore) {
        let first = store.create("user", &body("laptop")).await.unwrap();
        store.create("user", &body("desktop")).await.unwrap();
        store.create("user", &body("phone")).await.unwrap();
        store.create("someone-else", &body("x")).await.unwrap();

        store.update(&first, &body("laptop-2")).await.unwrap();
        assert!(matches!(
            store.update("missing", &body("y")).await,
            Err(RemoteError::NotFound(_))
        ));

        let page = store.list("user", 2, None).await.unwrap();
        assert_eq!(page.documents.len(), 2);
        let rest = store.list("user", 2, page.next_page.clone()).await.unwrap();
        assert_eq!(rest.documents.len(), 1);
        assert_eq!(rest.next_page, None);

        let all = page.documents.iter().chain(&rest.documents).collect::<Vec<_>>();
        assert!(all.iter().any(|d| d.body.device_id == "laptop-2"));
        assert!(all.iter().all(|d| d.user_id == "user"));

        store.delete(&first).await.unwrap();
        assert_eq!(store.list("user", 10, None).await.unwrap().documents.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryDocumentStore::new();
        exercise(&store).await;

        store.set_available(false);
        assert!(matches!(
            store.list("user", 10, None).await,
            Err(RemoteError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_directory_store() {
        let dir = tempdir().unwrap();
        let store = DirectoryDocumentStore::new(dir.path().join("remote")).unwrap();
        exercise(&store).await;
        assert!(matches!(
            store.delete("../escape").await,
            Err(RemoteError::Rejected(_))
        ));
    }
}
