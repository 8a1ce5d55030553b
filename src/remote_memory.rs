//! In-process remote store.
//!
//! Backs the `memory` provider and the test suites. Content is stored
//! verbatim, versions are a per-document counter that only moves when the
//! bytes change, and timestamps come from the local clock, so every
//! capability is reported as reliable.
//!
//! The `edit`/`insert`/`remove` helpers simulate changes made by other
//! clients of the remote store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::models::{RemoteContent, RemoteMeta};
use crate::remote::{Capabilities, RemoteAdapter, RemoteError};

#[derive(Debug, Clone)]
struct StoredDoc {
    parent: String,
    name: String,
    content: Vec<u8>,
    version: u64,
    modified: DateTime<Utc>,
}

impl StoredDoc {
    fn meta(&self, id: &str) -> RemoteMeta {
        RemoteMeta {
            id: id.to_string(),
            name: self.name.clone(),
            version: Some(self.version.to_string()),
            modified: Some(self.modified),
            size: Some(self.content.len() as u64),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRemote {
    docs: RwLock<HashMap<String, StoredDoc>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a document out of band and return its id.
    pub fn insert(&self, parent: &str, name: &str, content: &[u8]) -> String {
        let id = format!("mem-{}", uuid::Uuid::new_v4());
        let doc = StoredDoc {
            parent: parent.to_string(),
            name: name.to_string(),
            content: content.to_vec(),
            version: 1,
            modified: Utc::now(),
        };
        self.docs.write().unwrap().insert(id.clone(), doc);
        id
    }

    /// Replace a document's content out of band. Returns false if it does not exist.
    pub fn edit(&self, id: &str, content: &[u8]) -> bool {
        let mut docs = self.docs.write().unwrap();
        match docs.get_mut(id) {
            Some(doc) => {
                if doc.content != content {
                    doc.content = content.to_vec();
                    doc.version += 1;
                    doc.modified = Utc::now();
                }
                true
            }
            None => false,
        }
    }

    /// Delete a document out of band.
    pub fn remove(&self, id: &str) -> bool {
        self.docs.write().unwrap().remove(id).is_some()
    }

    pub fn set_modified(&self, id: &str, modified: DateTime<Utc>) {
        if let Some(doc) = self.docs.write().unwrap().get_mut(id) {
            doc.modified = modified;
        }
    }

    /// Id of the document named `name` under `parent`.
    pub fn find(&self, parent: &str, name: &str) -> Option<String> {
        self.docs
            .read()
            .unwrap()
            .iter()
            .find(|(_, d)| d.parent == parent && d.name == name)
            .map(|(id, _)| id.clone())
    }

    /// Content of the document named `name` under `parent`.
    pub fn content_of(&self, parent: &str, name: &str) -> Option<Vec<u8>> {
        let id = self.find(parent, name)?;
        self.docs.read().unwrap().get(&id).map(|d| d.content.clone())
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RemoteAdapter for InMemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            verbatim_content: true,
            stable_versions: true,
            trustworthy_timestamps: true,
            timestamp_resolution: Duration::ZERO,
        }
    }

    fn validate_target(&self, target: &str) -> Result<(), String> {
        if target.chars().any(char::is_whitespace) {
            return Err("must not contain whitespace".to_string());
        }
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<Option<RemoteContent>, RemoteError> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(id).map(|doc| RemoteContent {
            meta: doc.meta(id),
            content: doc.content.clone(),
        }))
    }

    async fn create(
        &self,
        parent: &str,
        name: &str,
        content: &[u8],
    ) -> Result<RemoteMeta, RemoteError> {
        let id = self.insert(parent, name, content);
        let docs = self.docs.read().unwrap();
        docs.get(&id)
            .map(|d| d.meta(&id))
            .ok_or_else(|| RemoteError::InvalidResponse("created document vanished".into()))
    }

    async fn update(
        &self,
        id: &str,
        content: &[u8],
        expected_version: Option<&str>,
    ) -> Result<RemoteMeta, RemoteError> {
        let mut docs = self.docs.write().unwrap();
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;

        let current = doc.version.to_string();
        if let Some(expected) = expected_version {
            if expected != current {
                return Err(RemoteError::VersionConflict {
                    id: id.to_string(),
                    expected: Some(expected.to_string()),
                    actual: Some(current),
                });
            }
        }

        if doc.content != content {
            doc.content = content.to_vec();
            doc.version += 1;
            doc.modified = Utc::now();
        }
        Ok(doc.meta(id))
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        match self.docs.write().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(id.to_string())),
        }
    }

    async fn list_children(&self, parent: &str) -> Result<Vec<RemoteMeta>, RemoteError> {
        let docs = self.docs.read().unwrap();
        let mut out: Vec<RemoteMeta> = docs
            .iter()
            .filter(|(_, d)| d.parent == parent)
            .map(|(id, d)| d.meta(id))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}
