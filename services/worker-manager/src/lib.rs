//! Fleet worker manager library.
//!
//! This crate primarily ships a `worker-manager` binary, but we expose the
//! library surface for integration testing and reuse.

pub mod api;
pub mod config;
pub mod credentials;
pub mod demand;
pub mod notify;
pub mod providers;
pub mod provisioner;
pub mod registration;
pub mod registry;
pub mod scanner;
pub mod state;
