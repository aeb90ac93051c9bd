//! Persisted-state `DataStore` capability (§6, §11): a base key/value +
//! SQL-like contract, plus an orthogonal decorator stack (cache, encryption,
//! resilience, instrumentation) that composes as
//! `Instrumented(Resilient(Encrypting(Caching(base))))` or any subset.
//!
//! Concrete SQL/KV backends are out of scope; [`base::InMemoryStore`]
//! satisfies the contract for local use and as the innermost capability.

pub mod base;
pub mod cache;
pub mod circuit_breaker;
pub mod encryption;
pub mod error;
pub mod instrumentation;
pub mod resilience;

pub use base::{DataStore, InMemoryStore, Transaction};
pub use cache::CachingStore;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use encryption::{EncryptingStore, SECURE_PREFIX};
pub use error::{Result, StoreError};
pub use instrumentation::InstrumentedStore;
pub use resilience::{ResilienceConfig, ResilientStore};

use std::sync::Arc;

/// Builds the default decorator stack over `base`, matching the composition
/// named in §11: caching, then encryption, then resilience, then
/// instrumentation as the outermost layer every caller actually talks to.
pub fn default_stack(
    base: Arc<dyn DataStore>,
    encryption_key: &[u8; 32],
    resilience: ResilienceConfig,
) -> Arc<dyn DataStore> {
    let cached = Arc::new(CachingStore::new(base));
    let encrypted = Arc::new(EncryptingStore::new(cached, encryption_key));
    let resilient = Arc::new(ResilientStore::new(encrypted, resilience));
    Arc::new(InstrumentedStore::new(resilient))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_stack_round_trips_a_secure_key() {
        let base: Arc<dyn DataStore> = Arc::new(InMemoryStore::new());
        let stack = default_stack(base, &[3u8; 32], ResilienceConfig::default());

        stack.set("secure:token", b"shh".to_vec()).await.unwrap();
        assert_eq!(stack.get("secure:token").await.unwrap(), Some(b"shh".to_vec()));
    }

    #[tokio::test]
    async fn default_stack_supports_transactions() {
        let base: Arc<dyn DataStore> = Arc::new(InMemoryStore::new());
        let stack = default_stack(base, &[9u8; 32], ResilienceConfig::default());

        let mut tx = stack.clone().begin_transaction().await.unwrap();
        tx.set("a", b"1".to_vec());
        tx.commit().await.unwrap();
        assert_eq!(stack.get("a").await.unwrap(), Some(b"1".to_vec()));
    }
}
