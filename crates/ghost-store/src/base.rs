//! The base `DataStore` contract (§6, §11): key/value get/set/delete/exists,
//! batch variants, and `query`/`execute`/`begin_transaction` for SQL-like
//! backends. An in-memory implementation satisfies the contract for local
//! use and as the innermost capability under the decorator stack.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;

    async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn set_batch(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        for (key, value) in entries {
            self.set(&key, value).await?;
        }
        Ok(())
    }

    /// SQL-like read path. The in-memory implementation answers this against
    /// a single flat table of JSON rows; concrete SQL backends are out of
    /// scope (§11), so callers should not depend on real query semantics.
    async fn query(&self, statement: &str, params: &[serde_json::Value]) -> Result<Vec<serde_json::Value>>;

    async fn execute(&self, statement: &str, params: &[serde_json::Value]) -> Result<u64>;

    /// Opens a transaction scoped to key/value writes, buffered until
    /// `commit`. Routes through whatever decorator stack wraps `self`, so a
    /// transaction committed through `Instrumented(Resilient(Encrypting(Caching(..))))`
    /// still gets caching/encryption/resilience for each buffered write.
    ///
    /// Each implementor's override is just `open_transaction(self).await` —
    /// not a default method, since a default body can't perform the
    /// `Arc<Self> -> Arc<dyn DataStore>` unsizing coercion without a `Self:
    /// Sized` bound that would remove the method from the vtable entirely.
    async fn begin_transaction(self: Arc<Self>) -> Result<Transaction>;
}

/// Shared body for every `DataStore::begin_transaction` override.
pub fn open_transaction(target: Arc<dyn DataStore>) -> Transaction {
    Transaction {
        target,
        ops: Vec::new(),
    }
}

enum TxOp {
    Set(String, Vec<u8>),
    Delete(String),
}

pub struct Transaction {
    target: Arc<dyn DataStore>,
    ops: Vec<TxOp>,
}

impl Transaction {
    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(TxOp::Set(key.into(), value));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(TxOp::Delete(key.into()));
    }

    pub fn pending_len(&self) -> usize {
        self.ops.len()
    }

    pub async fn commit(self) -> Result<()> {
        for op in self.ops {
            match op {
                TxOp::Set(key, value) => self.target.set(&key, value).await?,
                TxOp::Delete(key) => self.target.delete(&key).await?,
            }
        }
        Ok(())
    }

    /// Discards buffered writes without touching the target store.
    pub fn rollback(self) {}
}

/// In-memory `DataStore`: a key/value map plus a single flat table of JSON
/// rows standing in for the query/execute surface.
#[derive(Default)]
pub struct InMemoryStore {
    kv: DashMap<String, Vec<u8>>,
    rows: Mutex<Vec<serde_json::Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.kv.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.kv.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.kv.contains_key(key))
    }

    async fn query(&self, _statement: &str, _params: &[serde_json::Value]) -> Result<Vec<serde_json::Value>> {
        Ok(self.rows.lock().await.clone())
    }

    async fn execute(&self, statement: &str, params: &[serde_json::Value]) -> Result<u64> {
        let normalized = statement.trim_start().to_ascii_lowercase();
        let mut rows = self.rows.lock().await;
        if normalized.starts_with("insert") {
            if let Some(row) = params.first() {
                rows.push(row.clone());
            }
            Ok(1)
        } else if normalized.starts_with("delete") {
            let affected = rows.len() as u64;
            rows.clear();
            Ok(affected)
        } else {
            Ok(0)
        }
    }

    async fn begin_transaction(self: Arc<Self>) -> Result<Transaction> {
        Ok(open_transaction(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = InMemoryStore::new();
        store.set("k1", b"v1".to_vec()).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), Some(b"v1".to_vec()));
        assert!(store.exists("k1").await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = InMemoryStore::new();
        store.set("k1", b"v1".to_vec()).await.unwrap();
        store.delete("k1").await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), None);
        assert!(!store.exists("k1").await.unwrap());
    }

    #[tokio::test]
    async fn transaction_buffers_until_commit() {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryStore::new());
        let mut tx = store.clone().begin_transaction().await.unwrap();
        tx.set("a", b"1".to_vec());
        tx.set("b", b"2".to_vec());
        assert_eq!(store.get("a").await.unwrap(), None);
        tx.commit().await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("b").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn execute_insert_then_query_returns_row() {
        let store = InMemoryStore::new();
        let row = serde_json::json!({"id": 1, "name": "svc-1"});
        let affected = store.execute("INSERT INTO peers", &[row.clone()]).await.unwrap();
        assert_eq!(affected, 1);
        let rows = store.query("SELECT * FROM peers", &[]).await.unwrap();
        assert_eq!(rows, vec![row]);
    }
}
