//! # fleet-model
//!
//! Record types shared by the worker manager and its registry backends.
//!
//! ## Records
//!
//! - [`WorkerPool`]: a named group of workers sharing a provider and scaling policy
//! - [`Worker`]: one provisioned compute unit and its lifecycle state
//! - [`WorkerPoolError`]: append-only diagnostic attached to a pool
//! - [`WorkerCredential`]: a hashed, scoped access token issued at registration
//!
//! Records read from a registry are wrapped in [`Versioned`], whose version
//! token must be presented again on write (compare-and-swap).
//!
//! ## Wire Format
//!
//! All records serialize with camelCase field names and RFC 3339 timestamps.
//! Serializing then deserializing a record never changes any field.

mod error;
mod pool;
mod records;
mod worker;

pub use error::{ModelError, TransitionError};
pub use pool::*;
pub use records::*;
pub use worker::*;
