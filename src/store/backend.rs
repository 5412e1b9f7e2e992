//! Durable backends behind a [`Collection`](super::Collection).

use serde_json::Value;
use tracing::debug;

use crate::core::StoreError;

/// Write-through persistence for one collection.
///
/// Documents are keyed by their insertion sequence so that reloading
/// preserves natural order.
pub trait StorageBackend: Send + Sync {
    fn load(&self) -> Result<Vec<(u64, Value)>, StoreError>;

    fn put(&self, seq: u64, doc: &Value) -> Result<(), StoreError>;

    fn delete(&self, seq: u64) -> Result<(), StoreError>;

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Keeps nothing; the collection lives only in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryBackend;

impl StorageBackend for MemoryBackend {
    fn load(&self) -> Result<Vec<(u64, Value)>, StoreError> {
        Ok(Vec::new())
    }

    fn put(&self, _seq: u64, _doc: &Value) -> Result<(), StoreError> {
        Ok(())
    }

    fn delete(&self, _seq: u64) -> Result<(), StoreError> {
        Ok(())
    }
}

/// One sled tree per collection.
pub struct SledBackend {
    tree: sled::Tree,
}

impl SledBackend {
    pub fn open(db: &sled::Db, collection: &str) -> Result<Self, StoreError> {
        let tree = db.open_tree(collection)?;
        debug!(collection = %collection, documents = tree.len(), "Opened sled tree");
        Ok(Self { tree })
    }
}

impl StorageBackend for SledBackend {
    fn load(&self) -> Result<Vec<(u64, Value)>, StoreError> {
        let mut docs = Vec::with_capacity(self.tree.len());
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            let mut seq = [0u8; 8];
            if key.len() != seq.len() {
                return Err(StoreError::invalid_query("corrupt sequence key in sled tree"));
            }
            seq.copy_from_slice(&key);
            docs.push((u64::from_be_bytes(seq), serde_json::from_slice(&value)?));
        }
        Ok(docs)
    }

    fn put(&self, seq: u64, doc: &Value) -> Result<(), StoreError> {
        self.tree.insert(seq.to_be_bytes(), serde_json::to_vec(doc)?)?;
        Ok(())
    }

    fn delete(&self, seq: u64) -> Result<(), StoreError> {
        self.tree.remove(seq.to_be_bytes())?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.tree.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_sled_backend_round_trips_in_sequence_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let backend = SledBackend::open(&db, "tasks").unwrap();

        backend.put(300, &json!({"n": 3})).unwrap();
        backend.put(2, &json!({"n": 1})).unwrap();
        backend.put(40, &json!({"n": 2})).unwrap();
        backend.delete(40).unwrap();

        let loaded = backend.load().unwrap();
        assert_eq!(loaded, vec![(2, json!({"n": 1})), (300, json!({"n": 3}))]);
    }
}
