// =============================================================================
// Store adapters — whole-document read / replace
// =============================================================================
//
// The relay never merges into the store. Every publish replaces a complete
// collection document, so the only operations an adapter needs are "read the
// current document" and "overwrite it".
// =============================================================================

pub mod firebase;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::IngestError;

pub use firebase::FirebaseStore;

/// Durable keyed document store.
///
/// `collection` is a logical name such as `ticks` or `candles_60`; adapters
/// decide how it maps onto their own key space.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Overwrite the whole collection with `document`.
    async fn replace(&self, collection: &str, document: Value) -> Result<(), IngestError>;

    /// Fetch the current document, `None` if nothing has been written yet.
    async fn read(&self, collection: &str) -> Result<Option<Value>, IngestError>;
}

/// Number of entries in a collection document (object keys or array items).
pub fn entry_count(document: &Value) -> usize {
    match document {
        Value::Object(map) => map.len(),
        Value::Array(items) => items.len(),
        Value::Null => 0,
        _ => 1,
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-process store. Backs tests and local runs without a database.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct synchronous access for assertions.
    pub fn get(&self, collection: &str) -> Option<Value> {
        self.documents.read().get(collection).cloned()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn replace(&self, collection: &str, document: Value) -> Result<(), IngestError> {
        self.documents
            .write()
            .insert(collection.to_string(), document);
        Ok(())
    }

    async fn read(&self, collection: &str) -> Result<Option<Value>, IngestError> {
        Ok(self.get(collection))
    }
}
