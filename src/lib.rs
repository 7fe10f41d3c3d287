//! # Soa Core - In-process Service Runtime
//!
//! Rust implementation of a singleton-service container providing:
//! - Typed service registration with additive, frozen metadata
//! - Cross-service wiring resolved (and checked) at build time
//! - Reactive properties with triggers and change channels
//! - Debounced / throttled methods and repeating timers
//! - Hook invocation across services (linear, parallel, race, fire-and-forget)
//! - Snapshot and restore of persisted properties
//!
//! ## Architecture
//!
//! ```text
//!   Registry ──freeze──→ Catalog ──build──→ Container
//!   (describe)           (metadata)          ┌───────────────────────────┐
//!                                            │ services[id]              │
//!                                            │  ├─ Wired<T>              │
//!                                            │  ├─ RateLimited / Timer   │
//!                                            │  └─ Reactive<T> ─→ channel│
//!                                            │ broadcast bus, updates bus│
//!                                            └───────────────────────────┘
//!                                                   ↑ orchestrator
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod commbus;
pub mod kernel;
pub mod metadata;
pub mod types;

// Internal utilities
pub mod deadline;
pub mod observability;

pub use commbus::{Change, EventBus, Message, Subscription, Update};
pub use kernel::{
    Container, Context, Created, Handler, Hook, MessageReceiver, Properties, Reactive, Service,
    Strategy,
};
pub use metadata::{Annotate, Catalog, Registry};
pub use types::{Config, Error, Result, ServiceId};
