//! Resilience wrapper (§9/§11): exponential backoff over a fixed fault list
//! (unavailable/timeout), composed with the circuit breaker of
//! `circuit_breaker.rs`.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::base::{open_transaction, DataStore, Transaction};
use crate::circuit_breaker::{CircuitBreaker, OperationKind};
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy)]
pub struct ResilienceConfig {
    pub base_delay: Duration,
    pub max_retries: u32,
    pub circuit_failure_threshold: u32,
    pub circuit_success_threshold: u32,
    pub circuit_open_duration: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_retries: 3,
            circuit_failure_threshold: 5,
            circuit_success_threshold: 2,
            circuit_open_duration: Duration::from_secs(30),
        }
    }
}

pub struct ResilientStore {
    inner: Arc<dyn DataStore>,
    breaker: CircuitBreaker,
    config: ResilienceConfig,
}

impl ResilientStore {
    pub fn new(inner: Arc<dyn DataStore>, config: ResilienceConfig) -> Self {
        let breaker = CircuitBreaker::new(
            config.circuit_failure_threshold,
            config.circuit_success_threshold,
            config.circuit_open_duration,
        );
        Self { inner, breaker, config }
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, kind: OperationKind, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.breaker.allow_request() {
            return Err(StoreError::CircuitOpen);
        }

        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    self.breaker.record_failure(kind);
                    attempt += 1;
                    let delay = self.config.base_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying datastore operation");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.breaker.record_failure(kind);
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl DataStore for ResilientStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.clone();
        let key = key.to_string();
        self.with_retry("get", OperationKind::Read, move || {
            let inner = inner.clone();
            let key = key.clone();
            async move { inner.get(&key).await }
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let inner = self.inner.clone();
        let key = key.to_string();
        self.with_retry("set", OperationKind::Write, move || {
            let inner = inner.clone();
            let key = key.clone();
            let value = value.clone();
            async move { inner.set(&key, value).await }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let inner = self.inner.clone();
        let key = key.to_string();
        self.with_retry("delete", OperationKind::Write, move || {
            let inner = inner.clone();
            let key = key.clone();
            async move { inner.delete(&key).await }
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let inner = self.inner.clone();
        let key = key.to_string();
        self.with_retry("exists", OperationKind::Read, move || {
            let inner = inner.clone();
            let key = key.clone();
            async move { inner.exists(&key).await }
        })
        .await
    }

    async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let inner = self.inner.clone();
        let keys = keys.to_vec();
        self.with_retry("get_batch", OperationKind::Read, move || {
            let inner = inner.clone();
            let keys = keys.clone();
            async move { inner.get_batch(&keys).await }
        })
        .await
    }

    async fn set_batch(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        let inner = self.inner.clone();
        self.with_retry("set_batch", OperationKind::Write, move || {
            let inner = inner.clone();
            let entries = entries.clone();
            async move { inner.set_batch(entries).await }
        })
        .await
    }

    async fn query(&self, statement: &str, params: &[serde_json::Value]) -> Result<Vec<serde_json::Value>> {
        let inner = self.inner.clone();
        let statement = statement.to_string();
        let params = params.to_vec();
        self.with_retry("query", OperationKind::Read, move || {
            let inner = inner.clone();
            let statement = statement.clone();
            let params = params.clone();
            async move { inner.query(&statement, &params).await }
        })
        .await
    }

    async fn execute(&self, statement: &str, params: &[serde_json::Value]) -> Result<u64> {
        let inner = self.inner.clone();
        let statement = statement.to_string();
        let params = params.to_vec();
        self.with_retry("execute", OperationKind::Write, move || {
            let inner = inner.clone();
            let statement = statement.clone();
            let params = params.clone();
            async move { inner.execute(&statement, &params).await }
        })
        .await
    }

    async fn begin_transaction(self: Arc<Self>) -> Result<Transaction> {
        Ok(open_transaction(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::InMemoryStore;
    use crate::circuit_breaker::CircuitState;

    #[tokio::test]
    async fn passthrough_operations_succeed() {
        let store = ResilientStore::new(Arc::new(InMemoryStore::new()), ResilienceConfig::default());
        store.set("k1", b"v1".to_vec()).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn circuit_opens_after_repeated_unavailable_errors() {
        struct AlwaysDown;
        #[async_trait]
        impl DataStore for AlwaysDown {
            async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
                Err(StoreError::Unavailable("down".to_string()))
            }
            async fn set(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
                Err(StoreError::Unavailable("down".to_string()))
            }
            async fn delete(&self, _key: &str) -> Result<()> {
                Ok(())
            }
            async fn exists(&self, _key: &str) -> Result<bool> {
                Ok(false)
            }
            async fn query(&self, _s: &str, _p: &[serde_json::Value]) -> Result<Vec<serde_json::Value>> {
                Ok(vec![])
            }
            async fn execute(&self, _s: &str, _p: &[serde_json::Value]) -> Result<u64> {
                Ok(0)
            }
            async fn begin_transaction(self: Arc<Self>) -> Result<Transaction> {
                Ok(open_transaction(self))
            }
        }

        let config = ResilienceConfig {
            base_delay: Duration::from_millis(1),
            max_retries: 1,
            circuit_failure_threshold: 2,
            circuit_success_threshold: 1,
            circuit_open_duration: Duration::from_secs(30),
        };
        let store = ResilientStore::new(Arc::new(AlwaysDown), config);

        assert!(store.get("k1").await.is_err());
        assert!(store.get("k1").await.is_err());
        assert_eq!(store.breaker.state(), CircuitState::Open);
        assert!(matches!(store.get("k1").await, Err(StoreError::CircuitOpen)));
    }
}
