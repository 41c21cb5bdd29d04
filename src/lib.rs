//! Capability-scoped plugin sandbox.
//!
//! Untrusted plugin payloads are scanned by a [`security::SecurityPolicy`],
//! run against façades narrowed by a validated capability grant
//! ([`capabilities::CapabilityManager`]), and executed in dedicated workers
//! managed by an [`isolation::IsolationManager`].

pub mod capabilities;
pub mod config;
pub mod context;
pub mod error;
pub mod isolation;
pub mod runtime;
pub mod security;

pub use error::{SandboxError, SandboxResult};
