//! A SQLite-backed token store
//!
//! One row per (user_id, provider) in the `oauth_tokens` table. All instants
//! are stored as UTC epoch seconds.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use warden_clock::{Clock, System, UnixTime};

use super::{StorageError, TokenStore};
use crate::{AccessToken, Provider, ProviderRef, RefreshToken, TokenFields, TokenRecord, UserId};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS oauth_tokens (
        user_id         INTEGER NOT NULL,
        provider        TEXT NOT NULL DEFAULT 'default',
        access_token    TEXT NOT NULL,
        refresh_token   TEXT,
        token_type      TEXT NOT NULL DEFAULT 'Bearer',
        expires_at      INTEGER NOT NULL,
        scope           TEXT,
        created_at      INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL,
        UNIQUE(user_id, provider)
    );
    CREATE INDEX IF NOT EXISTS idx_oauth_tokens_expiry ON oauth_tokens(provider, expires_at);
";

const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA busy_timeout = 5000;
";

const SELECT_COLUMNS: &str = "SELECT user_id, provider, access_token, refresh_token, token_type, \
     expires_at, scope, created_at, updated_at FROM oauth_tokens";

/// A token store backed by a SQLite database
///
/// The connection is shared behind a mutex and every operation runs on the
/// blocking thread pool. Other processes may open the same database file; the
/// upsert runs in an immediate transaction so their writes serialize with ours.
#[derive(Clone, Debug)]
pub struct SqliteTokenStore<C = System> {
    conn: Arc<Mutex<Connection>>,
    clock: C,
}

impl SqliteTokenStore<System> {
    /// Opens (creating if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(PRAGMAS)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("token store schema ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: System,
        })
    }
}

impl<C> SqliteTokenStore<C> {
    /// Sets a custom clock to be used for audit timestamps
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> SqliteTokenStore<D> {
        SqliteTokenStore {
            conn: self.conn,
            clock,
        }
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StorageError::Poisoned)?;
            op(&mut guard)
        })
        .await?
    }
}

fn to_sql_time(t: UnixTime) -> i64 {
    i64::try_from(t.0).unwrap_or(i64::MAX)
}

fn from_sql_time(idx: usize, v: i64) -> rusqlite::Result<UnixTime> {
    u64::try_from(v).map(UnixTime).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, Box::new(e))
    })
}

fn row_to_record(row: &Row) -> rusqlite::Result<TokenRecord> {
    let fields = TokenFields {
        access_token: AccessToken::new(row.get(2)?),
        refresh_token: row.get::<_, Option<String>>(3)?.map(RefreshToken::new),
        token_type: row.get(4)?,
        expires_at: from_sql_time(5, row.get(5)?)?,
        scope: row.get(6)?,
    };

    Ok(TokenRecord::new(
        UserId(row.get(0)?),
        Provider::new(row.get(1)?),
        fields,
        from_sql_time(7, row.get(7)?)?,
        from_sql_time(8, row.get(8)?)?,
    ))
}

fn select_one(
    conn: &Connection,
    user_id: UserId,
    provider: &str,
) -> Result<Option<TokenRecord>, StorageError> {
    let sql = format!("{SELECT_COLUMNS} WHERE user_id = ?1 AND provider = ?2");
    Ok(conn
        .query_row(&sql, params![user_id.0, provider], row_to_record)
        .optional()?)
}

#[async_trait]
impl<C: Clock + Send + Sync> TokenStore for SqliteTokenStore<C> {
    async fn get(
        &self,
        user_id: UserId,
        provider: &ProviderRef,
    ) -> Result<Option<TokenRecord>, StorageError> {
        let provider = provider.as_str().to_owned();
        self.with_conn(move |conn| select_one(conn, user_id, &provider)).await
    }

    async fn save(
        &self,
        user_id: UserId,
        provider: &ProviderRef,
        fields: TokenFields,
    ) -> Result<TokenRecord, StorageError> {
        let provider = provider.as_str().to_owned();
        let now = to_sql_time(self.clock.now());

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO oauth_tokens
                    (user_id, provider, access_token, refresh_token, token_type,
                     expires_at, scope, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT (user_id, provider) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    token_type = excluded.token_type,
                    expires_at = excluded.expires_at,
                    scope = excluded.scope,
                    updated_at = excluded.updated_at",
                params![
                    user_id.0,
                    provider,
                    fields.access_token.as_str(),
                    fields.refresh_token.as_ref().map(|rt| rt.as_str()),
                    fields.token_type,
                    to_sql_time(fields.expires_at),
                    fields.scope,
                    now,
                ],
            )?;
            let record = select_one(&tx, user_id, &provider)?.ok_or_else(|| {
                StorageError::Corrupt(format!("row for user {user_id} vanished after upsert"))
            })?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn delete(&self, user_id: UserId, provider: &ProviderRef) -> Result<bool, StorageError> {
        let provider = provider.as_str().to_owned();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM oauth_tokens WHERE user_id = ?1 AND provider = ?2",
                params![user_id.0, provider],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn save_if_unchanged(
        &self,
        previous: &TokenRecord,
        fields: TokenFields,
    ) -> Result<Option<TokenRecord>, StorageError> {
        let user_id = previous.user_id();
        let provider = previous.provider().as_str().to_owned();
        let listed_at = to_sql_time(previous.updated_at());
        let listed_access = previous.access_token().as_str().to_owned();
        let now = to_sql_time(self.clock.now());

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let updated = tx.execute(
                "UPDATE oauth_tokens SET
                    access_token = ?3,
                    refresh_token = ?4,
                    token_type = ?5,
                    expires_at = ?6,
                    scope = ?7,
                    updated_at = ?8
                 WHERE user_id = ?1 AND provider = ?2
                    AND updated_at = ?9 AND access_token = ?10",
                params![
                    user_id.0,
                    provider,
                    fields.access_token.as_str(),
                    fields.refresh_token.as_ref().map(|rt| rt.as_str()),
                    fields.token_type,
                    to_sql_time(fields.expires_at),
                    fields.scope,
                    now,
                    listed_at,
                    listed_access,
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            let record = select_one(&tx, user_id, &provider)?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn delete_if_unchanged(&self, previous: &TokenRecord) -> Result<bool, StorageError> {
        let user_id = previous.user_id();
        let provider = previous.provider().as_str().to_owned();
        let listed_at = to_sql_time(previous.updated_at());
        let listed_access = previous.access_token().as_str().to_owned();

        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM oauth_tokens
                 WHERE user_id = ?1 AND provider = ?2
                    AND updated_at = ?3 AND access_token = ?4",
                params![user_id.0, provider, listed_at, listed_access],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list_all(&self, provider: &ProviderRef) -> Result<Vec<TokenRecord>, StorageError> {
        let provider = provider.as_str().to_owned();
        self.with_conn(move |conn| {
            let sql = format!("{SELECT_COLUMNS} WHERE provider = ?1 ORDER BY user_id");
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params![provider], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }
}
