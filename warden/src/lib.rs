//! A background daemon that keeps stored OAuth2 connections usable
//!
//! The daemon runs a [`ConnectionMaintainer`][warden_tokens::ConnectionMaintainer]
//! pass on a fixed interval, for as long as it is allowed to. Only one instance
//! runs at a time; the running instance records its process ID in a PID file,
//! which is also how `stop` and `status` find it.
//!
//! Shutdown is cooperative. Signals only cancel a
//! [`CancellationToken`][tokio_util::sync::CancellationToken], and the loop
//! notices the cancellation between records and while sleeping.

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

pub mod config;
pub mod controller;
pub mod pidfile;
pub mod probe;
pub mod signals;

pub use controller::{ControlError, DaemonController, DaemonState, DaemonStatus};
