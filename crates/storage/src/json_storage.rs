//! JSON document store.
//!
//! Keeps every document in memory and, when opened on a file, writes the
//! whole collection back after each mutation.

use super::{Change, ChangeStream, Document, DocumentStore, Filter, Result, StoreError};
use factory_core::new_record_id;
use factory_core::record::fields;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

struct Subscriber {
    filter: Filter,
    tx: mpsc::UnboundedSender<Change>,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, Document>,
    subscribers: Vec<Subscriber>,
}

impl Inner {
    fn notify(&mut self, old: Option<&Document>, new: Option<&Document>) {
        self.subscribers.retain(|sub| {
            let old = old.filter(|d| sub.filter.matches(d));
            let new = new.filter(|d| sub.filter.matches(d));
            if old.is_none() && new.is_none() {
                return !sub.tx.is_closed();
            }
            sub.tx
                .send(Change {
                    old: old.cloned(),
                    new: new.cloned(),
                })
                .is_ok()
        });
    }

    fn apply(&mut self, id: &str, patch: &Document) -> Option<Document> {
        let doc = self.docs.get_mut(id)?;
        let old = doc.clone();
        merge(doc, patch);
        let new = doc.clone();
        self.notify(Some(&old), Some(&new));
        Some(new)
    }
}

/// In-memory document store with optional write-through to a JSON file.
pub struct JsonStore {
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl JsonStore {
    /// Create a store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Open a store backed by `path`, loading it if it exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut inner = Inner::default();
        match fs::read_to_string(&path).await {
            Ok(json) => {
                let docs: Vec<Document> = serde_json::from_str(&json)?;
                for doc in docs {
                    let id = doc_id(&doc)
                        .ok_or_else(|| StoreError::Other(format!("document without id in {}", path.display())))?
                        .to_string();
                    inner.docs.insert(id, doc);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
            }
            Err(e) => return Err(e.into()),
        }
        debug!(path = %path.display(), documents = inner.docs.len(), "Opened store");
        Ok(Self {
            path: Some(path),
            inner: Mutex::new(inner),
        })
    }

    async fn persist(&self, inner: &Inner) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let docs: Vec<&Document> = inner.docs.values().collect();
        let json = serde_json::to_string_pretty(&docs)?;
        fs::write(path, json.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DocumentStore for JsonStore {
    async fn get(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.inner.lock().await.docs.get(id).cloned())
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<Document>> {
        let inner = self.inner.lock().await;
        Ok(inner.docs.values().filter(|d| filter.matches(d)).cloned().collect())
    }

    async fn insert(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        let mut inner = self.inner.lock().await;
        let mut batch: Vec<(String, Document)> = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = match doc_id(&doc) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => new_record_id(),
            };
            if inner.docs.contains_key(&id) || batch.iter().any(|(other, _)| *other == id) {
                return Err(StoreError::Conflict(id));
            }
            batch.push((id, doc));
        }

        let mut stored = Vec::with_capacity(batch.len());
        for (id, mut doc) in batch {
            doc.insert(fields::ID.to_string(), Value::String(id.clone()));
            inner.docs.insert(id, doc.clone());
            inner.notify(None, Some(&doc));
            stored.push(doc);
        }
        self.persist(&inner).await?;
        Ok(stored)
    }

    async fn update(
        &self,
        id: &str,
        patch: &Document,
        condition: Option<&Filter>,
    ) -> Result<Option<Document>> {
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.docs.get(id) else { return Ok(None) };
        if condition.is_some_and(|c| !c.matches(current)) {
            return Ok(None);
        }
        let updated = inner.apply(id, patch);
        self.persist(&inner).await?;
        Ok(updated)
    }

    async fn update_all(&self, filter: &Filter, patch: &Document) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<String> = inner
            .docs
            .iter()
            .filter(|(_, d)| filter.matches(d))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            inner.apply(id, patch);
        }
        if !ids.is_empty() {
            self.persist(&inner).await?;
        }
        Ok(ids.len())
    }

    async fn delete(&self, filter: &Filter) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<String> = inner
            .docs
            .iter()
            .filter(|(_, d)| filter.matches(d))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(old) = inner.docs.remove(id) {
                inner.notify(Some(&old), None);
            }
        }
        if !ids.is_empty() {
            self.persist(&inner).await?;
        }
        Ok(ids.len())
    }

    async fn subscribe(&self, filter: Filter) -> Result<ChangeStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        for doc in inner.docs.values().filter(|d| filter.matches(d)) {
            // Receiver is alive, it's still in scope.
            let _ = tx.send(Change {
                old: None,
                new: Some(doc.clone()),
            });
        }
        inner.subscribers.push(Subscriber { filter, tx });
        Ok(ChangeStream::new(rx))
    }
}

fn doc_id(doc: &Document) -> Option<&str> {
    doc.get(fields::ID).and_then(Value::as_str)
}

fn merge(doc: &mut Document, patch: &Document) {
    for (key, value) in patch {
        if key == fields::ID {
            continue;
        }
        if value.is_null() {
            doc.remove(key);
        } else {
            doc.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_ids() {
        let store = JsonStore::in_memory();
        let docs = store
            .insert(vec![doc(json!({"state": 0})), doc(json!({"id": "", "state": 3}))])
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        let id = docs[0]["id"].as_str().unwrap();
        assert_eq!(id.len(), 26);
        assert_ne!(docs[0]["id"], docs[1]["id"]);
        assert_eq!(store.get(id).await.unwrap().unwrap()["state"], json!(0));

        let err = store.insert(vec![docs[0].clone()]).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_conflicting_batch_inserts_nothing() {
        let store = JsonStore::in_memory();
        store.insert(vec![doc(json!({"id": "a"}))]).await.unwrap();

        let err = store
            .insert(vec![doc(json!({"id": "b"})), doc(json!({"id": "a"}))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(ref id) if id == "a"));
        assert!(store.get("b").await.unwrap().is_none());

        let err = store
            .insert(vec![doc(json!({"id": "c"})), doc(json!({"id": "c"}))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.get("c").await.unwrap().is_none());
        assert_eq!(store.find(&Filter::All).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let store = JsonStore::in_memory();
        let id = store.insert(vec![doc(json!({"due_at": 100, "state": 0}))]).await.unwrap()[0]["id"]
            .as_str()
            .unwrap()
            .to_string();

        let claim = Filter::eq("due_at", 100);
        let updated = store
            .update(&id, &doc(json!({"due_at": 200})), Some(&claim))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated["due_at"], json!(200));
        assert_eq!(updated["id"], json!(id));

        // Second claim with the stale value loses
        assert!(store.update(&id, &doc(json!({"due_at": 300})), Some(&claim)).await.unwrap().is_none());
        assert!(store.update("missing", &doc(json!({})), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_null_patch_removes_field() {
        let store = JsonStore::in_memory();
        let id = store.insert(vec![doc(json!({"handle": "w1"}))]).await.unwrap()[0]["id"]
            .as_str()
            .unwrap()
            .to_string();
        let updated = store.update(&id, &doc(json!({"handle": null})), None).await.unwrap().unwrap();
        assert!(!updated.contains_key("handle"));
    }

    #[tokio::test]
    async fn test_update_all_and_delete() {
        let store = JsonStore::in_memory();
        store
            .insert(vec![
                doc(json!({"job_id": "a", "state": 0})),
                doc(json!({"job_id": "a", "state": 3})),
                doc(json!({"job_id": "b", "state": 0})),
            ])
            .await
            .unwrap();
        let n = store.update_all(&Filter::eq("job_id", "a"), &doc(json!({"state": 5}))).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.find(&Filter::eq("state", 5)).await.unwrap().len(), 2);
        assert_eq!(store.delete(&Filter::eq("job_id", "a")).await.unwrap(), 2);
        assert_eq!(store.find(&Filter::All).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_initial_and_changes() {
        let store = JsonStore::in_memory();
        store.insert(vec![doc(json!({"state": 0}))]).await.unwrap();
        let mut stream = store.subscribe(Filter::lt("state", 3)).await.unwrap();

        let initial = stream.recv().await.unwrap();
        assert!(initial.old.is_none());
        let id = initial.new.unwrap()["id"].as_str().unwrap().to_string();

        // Leaving the filter shows up as a change with no new value
        store.update(&id, &doc(json!({"state": 4})), None).await.unwrap();
        let change = stream.recv().await.unwrap();
        assert_eq!(change.old.unwrap()["state"], json!(0));
        assert!(change.new.is_none());

        // Changes outside the filter aren't delivered
        store.update(&id, &doc(json!({"state": 5})), None).await.unwrap();
        assert!(stream.try_recv().is_none());

        store.insert(vec![doc(json!({"state": 1}))]).await.unwrap();
        assert_eq!(stream.recv().await.unwrap().new.unwrap()["state"], json!(1));
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let store = JsonStore::in_memory();
        let stream = store.subscribe(Filter::All).await.unwrap();
        drop(stream);
        store.insert(vec![doc(json!({}))]).await.unwrap();
        assert!(store.inner.lock().await.subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("jobs.json");
        {
            let store = JsonStore::open(&path).await.unwrap();
            store.insert(vec![doc(json!({"id": "j1", "recipe": "render"}))]).await.unwrap();
        }
        let store = JsonStore::open(&path).await.unwrap();
        let loaded = store.get("j1").await.unwrap().unwrap();
        assert_eq!(loaded["recipe"], json!("render"));
    }
}
