//! Core types for the service runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ServiceId, ContainerId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for observability and invocation

mod config;
mod errors;
mod ids;

pub use config::{Config, InvocationConfig, ObservabilityConfig};
pub use errors::{Error, Result};
pub use ids::{ContainerId, ServiceId};
