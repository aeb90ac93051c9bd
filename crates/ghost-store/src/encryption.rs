//! Encryption wrapper (§9/§11): keys prefixed `secure:` are serialized,
//! encrypted, then stored; reads reverse the process. Keys without the
//! prefix pass through unencrypted. AES-256-GCM, grounded on the same
//! crate the source's platform layer uses for its secrets-at-rest path.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use rand::RngCore;
use std::sync::Arc;

use crate::base::{open_transaction, DataStore, Transaction};
use crate::error::{Result, StoreError};

pub const SECURE_PREFIX: &str = "secure:";
const NONCE_LEN: usize = 12;

pub struct EncryptingStore {
    inner: Arc<dyn DataStore>,
    cipher: Aes256Gcm,
}

impl EncryptingStore {
    pub fn new(inner: Arc<dyn DataStore>, key: &[u8; 32]) -> Self {
        Self {
            inner,
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| StoreError::Encryption(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(StoreError::Encryption("ciphertext shorter than nonce".to_string()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| StoreError::Encryption(e.to_string()))
    }
}

#[async_trait]
impl DataStore for EncryptingStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.inner.get(key).await? {
            Some(bytes) if key.starts_with(SECURE_PREFIX) => Ok(Some(self.decrypt(&bytes)?)),
            other => Ok(other),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        if key.starts_with(SECURE_PREFIX) {
            let encrypted = self.encrypt(&value)?;
            self.inner.set(key, encrypted).await
        } else {
            self.inner.set(key, value).await
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

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

    async fn query(&self, statement: &str, params: &[serde_json::Value]) -> Result<Vec<serde_json::Value>> {
        self.inner.query(statement, params).await
    }

    async fn execute(&self, statement: &str, params: &[serde_json::Value]) -> Result<u64> {
        self.inner.execute(statement, params).await
    }

    async fn begin_transaction(self: Arc<Self>) -> Result<Transaction> {
        Ok(open_transaction(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::InMemoryStore;

    fn store() -> EncryptingStore {
        EncryptingStore::new(Arc::new(InMemoryStore::new()), &[7u8; 32])
    }

    #[tokio::test]
    async fn secure_key_round_trips_through_encryption() {
        let store = store();
        store.set("secure:token", b"top-secret".to_vec()).await.unwrap();
        assert_eq!(store.get("secure:token").await.unwrap(), Some(b"top-secret".to_vec()));
    }

    #[tokio::test]
    async fn non_secure_key_passes_through_unencrypted() {
        let inner = Arc::new(InMemoryStore::new());
        let store = EncryptingStore::new(inner.clone(), &[7u8; 32]);
        store.set("plain", b"visible".to_vec()).await.unwrap();
        assert_eq!(inner.get("plain").await.unwrap(), Some(b"visible".to_vec()));
    }

    #[tokio::test]
    async fn secure_value_is_not_stored_as_plaintext_in_the_inner_store() {
        let inner = Arc::new(InMemoryStore::new());
        let store = EncryptingStore::new(inner.clone(), &[7u8; 32]);
        store.set("secure:token", b"top-secret".to_vec()).await.unwrap();
        let raw = inner.get("secure:token").await.unwrap().unwrap();
        assert_ne!(raw, b"top-secret".to_vec());
    }
}
