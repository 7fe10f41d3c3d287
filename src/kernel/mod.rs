//! Kernel - the service container and everything it installs.
//!
//! The [`Container`] owns one instance of every registered service. While
//! registering an instance it composes the subsystems below: rate-limited
//! method wrappers, repeating timers, reactive property bindings and the
//! broadcast subscription. The [`orchestrator`] then calls hooks across the
//! instances.

pub mod container;
pub mod orchestrator;
pub mod rate_limiter;
pub mod reactive;
pub mod services;
pub mod snapshot;
pub mod timers;

pub use container::{Container, Context};
pub use orchestrator::{invoke, invoke_all, Created, Handler, Hook, Invoked, Strategy};
pub use rate_limiter::{debounce, throttle, DebounceOptions, Debounced, ThrottleOptions};
pub use reactive::{Binding, Property, Reactive};
pub use services::{Instance, MessageReceiver, Properties, RateLimited, Service, Timer, Wired};
pub use snapshot::{KeySet, Snapshot, SnapshotOptions};
pub use timers::{Repeat, TimerOptions, TimerTask};
