//! An in-memory token store

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use warden_clock::{Clock, System};

use super::{StorageError, TokenStore};
use crate::{ProviderRef, TokenFields, TokenRecord, UserId};

type Key = (UserId, String);

/// An in-memory token store
///
/// Holds the same upsert semantics as the durable stores, which makes it a
/// convenient stand-in for tests and single-process tools.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore<C = System> {
    records: RwLock<BTreeMap<Key, TokenRecord>>,
    clock: C,
}

impl InMemoryTokenStore<System> {
    /// Constructs a new empty store using the system clock
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C> InMemoryTokenStore<C> {
    /// Sets a custom clock to be used for audit timestamps
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> InMemoryTokenStore<D> {
        InMemoryTokenStore {
            records: self.records,
            clock,
        }
    }

    /// The number of stored records across all providers
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether no records are stored
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn key(user_id: UserId, provider: &ProviderRef) -> Key {
    (user_id, provider.as_str().to_owned())
}

#[async_trait]
impl<C: Clock + Send + Sync> TokenStore for InMemoryTokenStore<C> {
    async fn get(
        &self,
        user_id: UserId,
        provider: &ProviderRef,
    ) -> Result<Option<TokenRecord>, StorageError> {
        Ok(self.records.read().await.get(&key(user_id, provider)).cloned())
    }

    async fn save(
        &self,
        user_id: UserId,
        provider: &ProviderRef,
        fields: TokenFields,
    ) -> Result<TokenRecord, StorageError> {
        let mut records = self.records.write().await;
        let now = self.clock.now();
        let key = key(user_id, provider);
        let created_at = records.get(&key).map_or(now, |r| r.created_at());

        let record = TokenRecord::new(user_id, provider.to_owned(), fields, created_at, now);
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn delete(&self, user_id: UserId, provider: &ProviderRef) -> Result<bool, StorageError> {
        Ok(self
            .records
            .write()
            .await
            .remove(&key(user_id, provider))
            .is_some())
    }

    async fn save_if_unchanged(
        &self,
        previous: &TokenRecord,
        fields: TokenFields,
    ) -> Result<Option<TokenRecord>, StorageError> {
        let mut records = self.records.write().await;
        let key = key(previous.user_id(), previous.provider());
        match records.get(&key) {
            Some(current) if current.is_same_revision(previous) => {}
            _ => return Ok(None),
        }

        let record = TokenRecord::new(
            previous.user_id(),
            previous.provider().to_owned(),
            fields,
            previous.created_at(),
            self.clock.now(),
        );
        records.insert(key, record.clone());
        Ok(Some(record))
    }

    async fn delete_if_unchanged(&self, previous: &TokenRecord) -> Result<bool, StorageError> {
        let mut records = self.records.write().await;
        let key = key(previous.user_id(), previous.provider());
        match records.get(&key) {
            Some(current) if current.is_same_revision(previous) => {
                records.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_all(&self, provider: &ProviderRef) -> Result<Vec<TokenRecord>, StorageError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.provider() == provider)
            .cloned()
            .collect())
    }
}
