//! Reactive properties.
//!
//! A [`Reactive`] cell stores a value and, once bound by the container,
//! reports every real change: triggers first, then the service channel, then
//! the container updates channel. Writes of an equal value are dropped
//! silently, which keeps listeners from feeding back into each other.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::commbus::{Change, EventBus, Update};
use crate::types::{Result, ServiceId};

/// Method run synchronously when a bound property changes.
pub(crate) struct Trigger {
    pub(crate) method: String,
    pub(crate) run: Box<dyn Fn() + Send + Sync>,
}

/// Notification targets attached to a cell at registration.
pub struct Binding {
    service: ServiceId,
    key: String,
    channel: EventBus<Change>,
    updates: EventBus<Update>,
    triggers: Vec<Trigger>,
}

impl Binding {
    pub(crate) fn new(
        service: ServiceId,
        key: impl Into<String>,
        channel: EventBus<Change>,
        updates: EventBus<Update>,
        triggers: Vec<Trigger>,
    ) -> Self {
        Self {
            service,
            key: key.into(),
            channel,
            updates,
            triggers,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }

    fn notify(&self, value: serde_json::Value) {
        for trigger in &self.triggers {
            tracing::trace!(key = %self.key, method = %trigger.method, "running trigger");
            (trigger.run)();
        }
        self.channel.dispatch(&Change {
            key: self.key.clone(),
            value: value.clone(),
        });
        self.updates.dispatch(&Update {
            service: self.service,
            key: self.key.clone(),
            value,
        });
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("service", &self.service)
            .field("key", &self.key)
            .field("triggers", &self.triggers.len())
            .finish()
    }
}

/// Type-erased view of a service property, used for binding and snapshots.
pub trait Property: Send + Sync {
    /// Current value as JSON.
    fn snapshot(&self) -> Result<serde_json::Value>;

    /// Whether `value` deserializes into this property, without assigning it.
    fn check(&self, value: &serde_json::Value) -> Result<()>;

    /// Assign a JSON value through the normal setter. Returns whether it changed.
    fn restore(&self, value: serde_json::Value) -> Result<bool>;

    /// Attach notification targets. Returns false if the property was already bound.
    fn bind(&self, binding: Binding) -> bool;
}

/// Change-notifying value cell.
pub struct Reactive<T> {
    value: RwLock<T>,
    binding: OnceLock<Binding>,
}

impl<T> Reactive<T>
where
    T: Clone + PartialEq + Serialize + Send + Sync,
{
    pub fn new(value: T) -> Self {
        Self {
            value: RwLock::new(value),
            binding: OnceLock::new(),
        }
    }

    /// Clone of the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Borrow the current value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.read())
    }

    /// Store `value` if it differs from the current one and notify.
    /// Returns whether a change happened.
    pub fn set(&self, value: T) -> bool {
        {
            let mut current = self.value.write();
            if *current == value {
                return false;
            }
            *current = value.clone();
        }

        if let Some(binding) = self.binding.get() {
            let json = serde_json::to_value(&value).unwrap_or_else(|err| {
                tracing::warn!(key = %binding.key, "reactive value not serializable: {}", err);
                serde_json::Value::Null
            });
            binding.notify(json);
        }
        true
    }

    /// Apply `f` to a copy of the current value and store the result.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        let mut next = self.get();
        f(&mut next);
        self.set(next)
    }

    /// Whether the container has bound this cell.
    pub fn is_bound(&self) -> bool {
        self.binding.get().is_some()
    }
}

impl<T> Property for Reactive<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync,
{
    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&*self.value.read())?)
    }

    fn check(&self, value: &serde_json::Value) -> Result<()> {
        T::deserialize(value)?;
        Ok(())
    }

    fn restore(&self, value: serde_json::Value) -> Result<bool> {
        let value: T = serde_json::from_value(value)?;
        Ok(self.set(value))
    }

    fn bind(&self, binding: Binding) -> bool {
        self.binding.set(binding).is_ok()
    }
}

impl<T> Default for Reactive<T>
where
    T: Clone + PartialEq + Serialize + Send + Sync + Default,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Reactive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactive")
            .field("value", &*self.value.read())
            .field("bound", &self.binding.get().is_some())
            .finish()
    }
}
