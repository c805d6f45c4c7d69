//! # fleet-id
//!
//! Identifier types, parsing, and validation for the worker manager.
//!
//! ## Identifier Families
//!
//! Two kinds of identifiers exist:
//!
//! - **Names** are operator- or provider-chosen strings: `ProviderId`,
//!   `WorkerGroup`, `WorkerId`. They are 1 to 38 characters from
//!   `[a-zA-Z0-9_-]`.
//! - **Generated ids** are system-assigned `{prefix}_{ulid}` values:
//!   `ErrorId`, `CredentialId`, `RequestId`.
//!
//! `WorkerPoolId` is a pair of names joined by a slash, e.g. `proj-ci/linux-large`.
//!
//! All identifiers have a canonical string form with strict parsing and
//! roundtrip through serde as plain strings.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::MAX_NAME_LEN;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
