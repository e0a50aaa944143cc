//! Durable storage and background refresh of per-user OAuth2 tokens
//!
//! A web application that acts on behalf of many users typically holds one
//! OAuth2 grant per user and issuer. Users authorize once; after that, access
//! tokens must be renewed before they expire, without the user being present.
//! This crate provides the pieces needed to do that from a background process.
//!
//! * A [`TokenStore`][store::TokenStore] holds exactly one [`TokenRecord`] per
//!   (user, provider) connection and writes it with an atomic upsert, so the web
//!   layer and the background process can both write without tearing a record.
//! * [`classify`] and [`ValidatorConfig`] decide whether a token is still
//!   [`Valid`][TokenStatus::Valid], [`ExpiringSoon`][TokenStatus::ExpiringSoon],
//!   or already [`Expired`][TokenStatus::Expired]. All instants are UTC epoch
//!   seconds.
//! * A [`TokenRefresher`][refresher::TokenRefresher] exchanges a refresh token
//!   for new tokens and reports whether a failure is transient or permanent.
//! * A [`ConnectionMaintainer`] runs one pass over every stored connection,
//!   refreshing what needs refreshing and disconnecting revoked grants.
//!
//! ```
//! use std::sync::Arc;
//!
//! use warden_clock::DurationSecs;
//! use warden_tokens::{
//!     refresher::{oauth2::dto::ClientCredentials, OAuth2Refresher},
//!     store::SqliteTokenStore,
//!     ClientId, ClientSecret, ConnectionMaintainer, Provider, ValidatorConfig,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteTokenStore::open("warden.db")?);
//!
//! let refresher = OAuth2Refresher::new(
//!     reqwest::Client::builder()
//!         .timeout(std::time::Duration::from_secs(30))
//!         .build()?,
//!     reqwest::Url::parse("https://issuer.example.com/oauth/token")?,
//!     ClientCredentials {
//!         client_id: ClientId::from_static("my-client"),
//!         client_secret: ClientSecret::from_static("my-secret"),
//!     },
//! );
//!
//! let maintainer = ConnectionMaintainer::new(store, refresher, Provider::default_tag())
//!     .with_validator(ValidatorConfig::new(DurationSecs::from_mins(20)));
//!
//! let summary = maintainer.maintain().await?;
//! tracing::info!(%summary, "done");
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `oauth2`: Provides [`OAuth2Refresher`][refresher::OAuth2Refresher], which performs the
//!   _refresh token_ grant against an OAuth2 token endpoint.
//! * `sqlite`: Provides [`SqliteTokenStore`][store::SqliteTokenStore], backed by a bundled
//!   SQLite.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backoff;
mod braids;
mod maintainer;
pub mod refresher;
pub mod store;
mod tokens;

pub use braids::*;
pub use maintainer::{ConnectionMaintainer, MaintenanceSummary};
pub use tokens::{
    classify, TokenFields, TokenRecord, TokenStatus, UserId, ValidatorConfig, DEFAULT_TOKEN_TYPE,
};
