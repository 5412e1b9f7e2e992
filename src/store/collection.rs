use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::backend::{MemoryBackend, StorageBackend};
use super::pipeline::{run_pipeline, FindOptions};
use super::query::matches;
use super::update::apply_patch;
use crate::core::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

/// Which version of the document `update_one` hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnDocument {
    Before,
    #[default]
    After,
}

#[derive(Default)]
struct Documents {
    by_seq: BTreeMap<u64, Value>,
    next_seq: u64,
}

/// A named set of JSON documents held in memory and written through
/// to a [`StorageBackend`].
///
/// Each document receives a system `_id`. Natural order is insertion order.
pub struct Collection {
    name: String,
    docs: RwLock<Documents>,
    backend: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("name", &self.name).finish()
    }
}

impl Collection {
    /// Memory-only collection.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: RwLock::new(Documents::default()),
            backend: Arc::new(MemoryBackend),
        }
    }

    /// Opens a collection, loading whatever the backend already holds.
    pub fn open(name: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let name = name.into();
        let mut docs = Documents::default();
        for (seq, doc) in backend.load()? {
            docs.next_seq = docs.next_seq.max(seq + 1);
            docs.by_seq.insert(seq, doc);
        }
        debug!(collection = %name, documents = docs.by_seq.len(), "Loaded collection");
        Ok(Self {
            name,
            docs: RwLock::new(docs),
            backend,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> RwLockReadGuard<'_, Documents> {
        self.docs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Documents> {
        self.docs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a document and returns its `_id`.
    pub fn insert(&self, mut doc: Value) -> Result<String> {
        let map = doc.as_object_mut().ok_or(StoreError::NotADocument)?;
        let id = match map.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                map.insert("_id".to_string(), Value::String(id.clone()));
                id
            }
        };

        let mut docs = self.write();
        let seq = docs.next_seq;
        self.backend.put(seq, &doc)?;
        docs.next_seq += 1;
        docs.by_seq.insert(seq, doc);
        Ok(id)
    }

    pub fn find(&self, query: &Value, options: &FindOptions) -> Result<Vec<Value>> {
        let docs = self.read();
        let mut found = Vec::new();
        for doc in docs.by_seq.values() {
            if matches(doc, query)? {
                found.push(doc.clone());
            }
        }
        drop(docs);
        options.apply(found)
    }

    pub fn find_one(&self, query: &Value) -> Result<Option<Value>> {
        let docs = self.read();
        for doc in docs.by_seq.values() {
            if matches(doc, query)? {
                return Ok(Some(doc.clone()));
            }
        }
        Ok(None)
    }

    pub fn has(&self, query: &Value) -> Result<bool> {
        Ok(self.find_one(query)?.is_some())
    }

    pub fn count(&self, query: &Value) -> Result<u64> {
        let docs = self.read();
        let mut count = 0;
        for doc in docs.by_seq.values() {
            if matches(doc, query)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Applies `patch` to every matching document and returns how many changed.
    pub fn update(&self, query: &Value, patch: &Value) -> Result<usize> {
        let mut docs = self.write();
        let mut updated = Vec::new();
        for (seq, doc) in docs.by_seq.iter() {
            if matches(doc, query)? {
                let mut next = doc.clone();
                apply_patch(&mut next, patch)?;
                updated.push((*seq, next));
            }
        }
        let count = updated.len();
        for (seq, next) in updated {
            self.backend.put(seq, &next)?;
            docs.by_seq.insert(seq, next);
        }
        Ok(count)
    }

    /// Patches the first matching document. `None` when nothing matched.
    ///
    /// Match and write happen under one lock, so a filter on the current
    /// state (`{uuid, status: "queued"}`) acts as a compare-and-set.
    pub fn update_one(
        &self,
        query: &Value,
        patch: &Value,
        returning: ReturnDocument,
    ) -> Result<Option<Value>> {
        let mut docs = self.write();
        let mut target = None;
        for (seq, doc) in docs.by_seq.iter() {
            if matches(doc, query)? {
                target = Some((*seq, doc.clone()));
                break;
            }
        }
        let Some((seq, before)) = target else {
            return Ok(None);
        };

        let mut after = before.clone();
        apply_patch(&mut after, patch)?;
        self.backend.put(seq, &after)?;
        docs.by_seq.insert(seq, after.clone());

        Ok(Some(match returning {
            ReturnDocument::Before => before,
            ReturnDocument::After => after,
        }))
    }

    /// Deletes every matching document and returns how many were removed.
    pub fn remove(&self, query: &Value) -> Result<usize> {
        let mut docs = self.write();
        let mut doomed = Vec::new();
        for (seq, doc) in docs.by_seq.iter() {
            if matches(doc, query)? {
                doomed.push(*seq);
            }
        }
        for seq in &doomed {
            self.backend.delete(*seq)?;
            docs.by_seq.remove(seq);
        }
        Ok(doomed.len())
    }

    /// Runs an aggregation pipeline over the whole collection.
    pub fn aggregate(&self, pipeline: &[Value]) -> Result<Vec<Value>> {
        let snapshot: Vec<Value> = self.read().by_seq.values().cloned().collect();
        run_pipeline(snapshot, pipeline)
    }

    pub fn flush(&self) -> Result<()> {
        self.backend.flush()
    }
}
