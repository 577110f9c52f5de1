//! Remote authority plumbing: credentials, the HTTP client implementing
//! the config and command queue contracts, and workflow executors.

pub mod client;
pub mod credentials;
pub mod executor;

pub use client::ServerClient;
pub use credentials::Credentials;
pub use executor::{HttpWorkflowExecutor, UnconfiguredExecutor};
