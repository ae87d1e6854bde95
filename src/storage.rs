use crate::errors::{BillingError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// optional filter applied by `Storage::list_docs`. the core only ever
/// needs prefix filtering ("every dues document under this unit") and
/// exact-field equality, so the filter is kept to that shape rather than
/// a general query language.
#[derive(Debug, Clone)]
pub enum DocFilter {
    FieldEquals { field: String, value: Value },
}

/// abstract document store the core depends on (spec.md §6.1). documents
/// are addressed by slash-separated paths matching the persisted-state
/// layout in spec.md §6.3 (`clients/{cid}/units/{uid}/dues/{fiscalYear}`,
/// etc.) and carry an untyped `serde_json::Value` payload, mirroring a
/// Firestore-shaped store rather than a typed ORM.
pub trait Storage: Send + Sync {
    fn get_doc(&self, path: &str) -> Result<Option<Value>>;
    fn set_doc(&self, path: &str, data: Value) -> Result<()>;
    fn update_doc(&self, path: &str, partial: Value) -> Result<()>;
    fn delete_doc(&self, path: &str) -> Result<()>;
    fn list_docs(&self, collection_path: &str, filter: Option<DocFilter>) -> Result<Vec<(String, Value)>>;

    /// open a batch of operations to commit atomically
    fn batch(&self) -> Box<dyn Batch + '_>;
}

/// a batch accumulates writes and commits them as one atomic unit
/// (spec.md §5.3). partial application must never be observable.
pub trait Batch {
    fn set(&mut self, path: &str, data: Value);
    fn update(&mut self, path: &str, partial: Value);
    fn delete(&mut self, path: &str);
    fn commit(self: Box<Self>) -> Result<()>;
}

/// shallow-merge `partial` into `base`, recursing into nested objects.
/// matches Firestore's `updateDoc` merge semantics: arrays and scalars are
/// replaced wholesale, objects are merged key by key.
fn merge_json(base: &mut Value, partial: &Value) {
    match (base, partial) {
        (Value::Object(base_map), Value::Object(partial_map)) => {
            for (key, value) in partial_map {
                merge_json(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base_slot, partial_value) => {
            *base_slot = partial_value.clone();
        }
    }
}

enum Op {
    Set(String, Value),
    Update(String, Value),
    Delete(String),
}

/// in-memory reference `Storage` implementation for tests and local
/// integration runs. not intended for production use; a real deployment
/// backs this trait with a document store (Firestore, per spec.md §6.3).
pub struct MemoryStore {
    docs: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore { docs: Mutex::new(BTreeMap::new()) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStore {
    fn get_doc(&self, path: &str) -> Result<Option<Value>> {
        let docs = self.docs.lock().map_err(|_| BillingError::StoragePoisoned)?;
        Ok(docs.get(path).cloned())
    }

    fn set_doc(&self, path: &str, data: Value) -> Result<()> {
        let mut docs = self.docs.lock().map_err(|_| BillingError::StoragePoisoned)?;
        docs.insert(path.to_string(), data);
        Ok(())
    }

    fn update_doc(&self, path: &str, partial: Value) -> Result<()> {
        let mut docs = self.docs.lock().map_err(|_| BillingError::StoragePoisoned)?;
        let entry = docs.entry(path.to_string()).or_insert(Value::Object(Default::default()));
        merge_json(entry, &partial);
        Ok(())
    }

    fn delete_doc(&self, path: &str) -> Result<()> {
        let mut docs = self.docs.lock().map_err(|_| BillingError::StoragePoisoned)?;
        docs.remove(path);
        Ok(())
    }

    fn list_docs(&self, collection_path: &str, filter: Option<DocFilter>) -> Result<Vec<(String, Value)>> {
        let docs = self.docs.lock().map_err(|_| BillingError::StoragePoisoned)?;
        let prefix = format!("{}/", collection_path.trim_end_matches('/'));
        let mut results: Vec<(String, Value)> = docs
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix) && !path[prefix.len()..].contains('/'))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect();
        if let Some(DocFilter::FieldEquals { field, value }) = filter {
            results.retain(|(_, doc)| doc.get(&field) == Some(&value));
        }
        Ok(results)
    }

    fn batch(&self) -> Box<dyn Batch + '_> {
        Box::new(MemoryBatch { store: self, ops: Vec::new() })
    }
}

struct MemoryBatch<'s> {
    store: &'s MemoryStore,
    ops: Vec<Op>,
}

impl<'s> Batch for MemoryBatch<'s> {
    fn set(&mut self, path: &str, data: Value) {
        self.ops.push(Op::Set(path.to_string(), data));
    }

    fn update(&mut self, path: &str, partial: Value) {
        self.ops.push(Op::Update(path.to_string(), partial));
    }

    fn delete(&mut self, path: &str) {
        self.ops.push(Op::Delete(path.to_string()));
    }

    /// commits every accumulated op against a single lock acquisition, so
    /// no reader ever observes a partially-applied batch (spec.md §5.3).
    fn commit(self: Box<Self>) -> Result<()> {
        let mut docs = self.store.docs.lock().map_err(|_| BillingError::StoragePoisoned)?;
        for op in self.ops {
            match op {
                Op::Set(path, data) => {
                    docs.insert(path, data);
                }
                Op::Update(path, partial) => {
                    let entry = docs.entry(path).or_insert(Value::Object(Default::default()));
                    merge_json(entry, &partial);
                }
                Op::Delete(path) => {
                    docs.remove(&path);
                }
            }
        }
        Ok(())
    }
}
