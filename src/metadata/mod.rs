//! Service metadata.
//!
//! Every registered service type has one [`Metadata`] record. Records are
//! additive: the annotation helpers in [`Annotate`] read the current list,
//! append one entry and write the whole list back through
//! [`MetadataRegistry::annotate`], whose merge is a shallow field replace.
//! A record is keyed by the exact type; there is no inheritance.
//!
//! Records are mutable only while the [`Registry`] is open. Once frozen into a
//! [`Catalog`] they are shared, read-only, by every container built from it.

mod annotate;
mod catalog;

pub use annotate::Annotate;
pub use catalog::{Catalog, Registry};

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::commbus::{Change, EventBus, Listener, Message};
use crate::kernel::rate_limiter::{DebounceOptions, ThrottleOptions};
use crate::kernel::services::Instance;
use crate::kernel::timers::{TimerOptions, TimerTask};
use crate::types::{Result, ServiceId};

/// Precedence values for [`Annotate::order`]. Lower runs first.
pub mod order {
    pub const HIGHEST_PRECEDENCE: i32 = -999_999_999;
    pub const DEFAULT: i32 = 0;
    pub const LOWEST_PRECEDENCE: i32 = 999_999_999;
}

// =============================================================================
// Installers
// =============================================================================

pub(crate) type ResolveFn = dyn Fn(&Instance, &Instance) -> Result<()> + Send + Sync;
pub(crate) type InstallFn = dyn Fn(&Instance) -> Result<()> + Send + Sync;
pub(crate) type TimerFn = dyn Fn(&Instance, String) -> Result<Arc<TimerTask>> + Send + Sync;
pub(crate) type TriggerFn = dyn Fn(&Instance) -> Result<Box<dyn Fn() + Send + Sync>> + Send + Sync;
pub(crate) type ReceiverFn = dyn Fn(&Instance) -> Result<Listener<Message>> + Send + Sync;

/// Type-erased glue produced by an annotation and run by the container.
pub struct Installer<F: ?Sized>(pub(crate) Arc<F>);

impl<F: ?Sized> Clone for Installer<F> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<F: ?Sized> fmt::Debug for Installer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Installer(..)")
    }
}

// =============================================================================
// Entries
// =============================================================================

/// Field resolved to another service by type.
#[derive(Debug, Clone)]
pub struct WiredEntry {
    pub key: String,
    pub target: TypeId,
    pub target_name: &'static str,
    pub(crate) resolve: Installer<ResolveFn>,
}

/// Debounced or throttled method.
#[derive(Debug, Clone)]
pub struct RateLimitEntry<O> {
    pub key: String,
    pub wait: Duration,
    pub options: O,
    pub(crate) install: Installer<InstallFn>,
}

/// Repeating timer on a method.
#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub key: String,
    pub period: Duration,
    pub options: TimerOptions,
    pub(crate) install: Installer<TimerFn>,
}

/// Method run when a property changes.
#[derive(Debug, Clone)]
pub struct TriggerEntry {
    pub method: String,
    pub(crate) build: Installer<TriggerFn>,
}

/// Hook the service handles. `call` holds the typed entry point for the hook.
#[derive(Clone)]
pub struct HandlerEntry {
    pub hook: &'static str,
    pub hook_type: TypeId,
    pub(crate) call: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry").field("hook", &self.hook).finish()
    }
}

/// Subscription of the service to the container broadcast channel.
#[derive(Debug, Clone)]
pub struct MessageEntry {
    pub(crate) subscribe: Installer<ReceiverFn>,
}

// =============================================================================
// Metadata
// =============================================================================

/// Accumulated annotations of one service type.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub id: Option<ServiceId>,
    pub order: i32,
    pub name: Option<String>,
    pub hub: bool,
    pub observables: Vec<String>,
    pub wired: Vec<WiredEntry>,
    pub debounce_functions: Vec<RateLimitEntry<DebounceOptions>>,
    pub throttle_functions: Vec<RateLimitEntry<ThrottleOptions>>,
    pub timers: Vec<TimerEntry>,
    pub persisted: Vec<String>,
    pub triggers: BTreeMap<String, Vec<TriggerEntry>>,
    pub handlers: Vec<HandlerEntry>,
    pub message_receiver: Option<MessageEntry>,
    pub channel: Option<EventBus<Change>>,
}

impl Metadata {
    pub fn is_observable(&self, key: &str) -> bool {
        self.hub || self.observables.iter().any(|k| k == key)
    }

    pub fn is_persisted(&self, key: &str) -> bool {
        self.persisted.iter().any(|k| k == key)
    }

    pub fn handles(&self, hook_type: TypeId) -> Option<&HandlerEntry> {
        self.handlers.iter().find(|h| h.hook_type == hook_type)
    }
}

/// Partial record for [`MetadataRegistry::annotate`]. Every `Some` field
/// replaces the stored field entirely.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub id: Option<ServiceId>,
    pub order: Option<i32>,
    pub name: Option<String>,
    pub hub: Option<bool>,
    pub observables: Option<Vec<String>>,
    pub wired: Option<Vec<WiredEntry>>,
    pub debounce_functions: Option<Vec<RateLimitEntry<DebounceOptions>>>,
    pub throttle_functions: Option<Vec<RateLimitEntry<ThrottleOptions>>>,
    pub timers: Option<Vec<TimerEntry>>,
    pub persisted: Option<Vec<String>>,
    pub triggers: Option<BTreeMap<String, Vec<TriggerEntry>>>,
    pub handlers: Option<Vec<HandlerEntry>>,
    pub message_receiver: Option<MessageEntry>,
    pub channel: Option<EventBus<Change>>,
}

impl MetadataPatch {
    fn apply(self, record: &mut Metadata) {
        macro_rules! replace {
            ($patch:ident, $record:ident: $($field:ident),*) => {
                $(if let Some(value) = $patch.$field { $record.$field = value; })*
            };
        }
        let patch = self;
        replace!(
            patch, record:
            order,
            hub,
            observables,
            wired,
            debounce_functions,
            throttle_functions,
            timers,
            persisted,
            triggers,
            handlers
        );
        if patch.id.is_some() {
            record.id = patch.id;
        }
        if patch.name.is_some() {
            record.name = patch.name;
        }
        if patch.message_receiver.is_some() {
            record.message_receiver = patch.message_receiver;
        }
        if patch.channel.is_some() {
            record.channel = patch.channel;
        }
    }
}

/// Mutable store of metadata records, keyed by type.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    records: HashMap<TypeId, Metadata>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulated record for `type_id`, or an empty record.
    pub fn metadata_of(&self, type_id: TypeId) -> Metadata {
        self.records.get(&type_id).cloned().unwrap_or_default()
    }

    /// Shallow-merge `patch` into the record for `type_id`.
    pub fn annotate(&mut self, type_id: TypeId, patch: MetadataPatch) {
        patch.apply(self.records.entry(type_id).or_default());
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.records.contains_key(&type_id)
    }
}
