//! Instrumentation wrapper (§9/§11): per-operation latency and counters via
//! `tracing`, with a slow-op warning at 100 ms for single ops and 500 ms for
//! batch ops.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

use crate::base::{open_transaction, DataStore, Transaction};
use crate::error::Result;

const SINGLE_OP_THRESHOLD: Duration = Duration::from_millis(100);
const BATCH_OP_THRESHOLD: Duration = Duration::from_millis(500);

pub struct InstrumentedStore {
    inner: Arc<dyn DataStore>,
    op_counts: DashMap<&'static str, AtomicU64>,
    error_counts: DashMap<&'static str, AtomicU64>,
}

impl InstrumentedStore {
    pub fn new(inner: Arc<dyn DataStore>) -> Self {
        Self {
            inner,
            op_counts: DashMap::new(),
            error_counts: DashMap::new(),
        }
    }

    pub fn op_count(&self, op: &str) -> u64 {
        self.op_counts.get(op).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn error_count(&self, op: &str) -> u64 {
        self.error_counts.get(op).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    fn observe(&self, op: &'static str, is_batch: bool, elapsed: Duration, ok: bool) {
        self.op_counts
            .entry(op)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.error_counts
                .entry(op)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }

        let threshold = if is_batch { BATCH_OP_THRESHOLD } else { SINGLE_OP_THRESHOLD };
        if elapsed > threshold {
            warn!(op, is_batch, elapsed_ms = elapsed.as_millis() as u64, "slow datastore operation");
        } else {
            trace!(op, is_batch, elapsed_ms = elapsed.as_millis() as u64, "datastore operation");
        }
    }
}

macro_rules! timed {
    ($self:expr, $op:expr, $batch:expr, $body:expr) => {{
        let start = Instant::now();
        let result = $body.await;
        $self.observe($op, $batch, start.elapsed(), result.is_ok());
        result
    }};
}

#[async_trait]
impl DataStore for InstrumentedStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        timed!(self, "get", false, self.inner.get(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        timed!(self, "set", false, self.inner.set(key, value))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        timed!(self, "delete", false, self.inner.delete(key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        timed!(self, "exists", false, self.inner.exists(key))
    }

    async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        timed!(self, "get_batch", true, self.inner.get_batch(keys))
    }

    async fn set_batch(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        timed!(self, "set_batch", true, self.inner.set_batch(entries))
    }

    async fn query(&self, statement: &str, params: &[serde_json::Value]) -> Result<Vec<serde_json::Value>> {
        timed!(self, "query", true, self.inner.query(statement, params))
    }

    async fn execute(&self, statement: &str, params: &[serde_json::Value]) -> Result<u64> {
        timed!(self, "execute", true, self.inner.execute(statement, params))
    }

    async fn begin_transaction(self: Arc<Self>) -> Result<Transaction> {
        Ok(open_transaction(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::InMemoryStore;

    #[tokio::test]
    async fn counts_operations_per_kind() {
        let store = InstrumentedStore::new(Arc::new(InMemoryStore::new()));
        store.set("k1", b"v1".to_vec()).await.unwrap();
        store.get("k1").await.unwrap();
        store.get("k1").await.unwrap();
        assert_eq!(store.op_count("set"), 1);
        assert_eq!(store.op_count("get"), 2);
        assert_eq!(store.error_count("get"), 0);
    }
}
