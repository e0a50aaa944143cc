//! Durable token storage

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use warden_clock::{DurationSecs, UnixTime};

use crate::{ProviderRef, TokenFields, TokenRecord, TokenStatus, UserId};

pub mod in_memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryTokenStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTokenStore;

/// An error while reading or writing stored tokens
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database reported an error
    #[cfg(feature = "sqlite")]
    #[error("database error")]
    Sqlite(#[from] rusqlite::Error),
    /// The blocking storage task could not complete
    #[error("storage task failed")]
    Join(#[from] tokio::task::JoinError),
    /// A previous writer panicked while holding the connection
    #[error("storage connection lock poisoned")]
    Poisoned,
    /// A stored row could not be decoded into a token record
    #[error("corrupt token row: {0}")]
    Corrupt(String),
    /// The store cannot be reached
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage of one token record per (user, provider) connection
///
/// Saves are atomic upserts keyed on (user, provider), so concurrent writers
/// never interleave partial updates and never create a duplicate row; the last
/// completed save wins.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Gets the record for a connection, if one is stored
    async fn get(
        &self,
        user_id: UserId,
        provider: &ProviderRef,
    ) -> Result<Option<TokenRecord>, StorageError>;

    /// Inserts or replaces the record for a connection, returning it as stored
    ///
    /// `created_at` is preserved across replacements and `updated_at` is set
    /// to the store's current time.
    async fn save(
        &self,
        user_id: UserId,
        provider: &ProviderRef,
        fields: TokenFields,
    ) -> Result<TokenRecord, StorageError>;

    /// Removes the record for a connection
    ///
    /// Returns whether a record existed. Removing an absent record is not an error.
    async fn delete(&self, user_id: UserId, provider: &ProviderRef) -> Result<bool, StorageError>;

    /// Replaces a record only if it is still exactly as `previous` was read
    ///
    /// Returns `None`, writing nothing, when the row has been replaced or removed
    /// since. A row counts as unchanged while its access token and `updated_at`
    /// both match.
    async fn save_if_unchanged(
        &self,
        previous: &TokenRecord,
        fields: TokenFields,
    ) -> Result<Option<TokenRecord>, StorageError>;

    /// Removes a record only if it is still exactly as `previous` was read
    ///
    /// Returns whether a record was removed.
    async fn delete_if_unchanged(&self, previous: &TokenRecord) -> Result<bool, StorageError>;

    /// Gets a snapshot of every record granted by `provider`
    ///
    /// Other writers may keep mutating individual rows while the caller works
    /// through the snapshot.
    async fn list_all(&self, provider: &ProviderRef) -> Result<Vec<TokenRecord>, StorageError>;
}

#[async_trait]
impl<S: TokenStore + ?Sized> TokenStore for Arc<S> {
    async fn get(
        &self,
        user_id: UserId,
        provider: &ProviderRef,
    ) -> Result<Option<TokenRecord>, StorageError> {
        (**self).get(user_id, provider).await
    }

    async fn save(
        &self,
        user_id: UserId,
        provider: &ProviderRef,
        fields: TokenFields,
    ) -> Result<TokenRecord, StorageError> {
        (**self).save(user_id, provider, fields).await
    }

    async fn delete(&self, user_id: UserId, provider: &ProviderRef) -> Result<bool, StorageError> {
        (**self).delete(user_id, provider).await
    }

    async fn save_if_unchanged(
        &self,
        previous: &TokenRecord,
        fields: TokenFields,
    ) -> Result<Option<TokenRecord>, StorageError> {
        (**self).save_if_unchanged(previous, fields).await
    }

    async fn delete_if_unchanged(&self, previous: &TokenRecord) -> Result<bool, StorageError> {
        (**self).delete_if_unchanged(previous).await
    }

    async fn list_all(&self, provider: &ProviderRef) -> Result<Vec<TokenRecord>, StorageError> {
        (**self).list_all(provider).await
    }
}

/// Gets a record whose access token may still be presented at `now`
///
/// This is the read path used when serving a request on a user's behalf. An
/// expired or missing record yields `None`, which callers should treat as
/// "reauthorization required".
pub async fn current_access_token<S: TokenStore + ?Sized>(
    store: &S,
    user_id: UserId,
    provider: &ProviderRef,
    now: UnixTime,
) -> Result<Option<TokenRecord>, StorageError> {
    let record = store.get(user_id, provider).await?;
    Ok(record.filter(|r| r.status_at(now, DurationSecs(0)) != TokenStatus::Expired))
}
