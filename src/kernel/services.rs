//! Service contract and the slots the container fills at registration.
//!
//! A service is a `Default`-constructible singleton. Its annotations are
//! declared once per type in [`Service::describe`]; the container then
//! resolves [`Wired`] fields, installs [`RateLimited`] wrappers and
//! [`Timer`]s, and binds the reactive properties listed by
//! [`Service::properties`].

use parking_lot::RwLock;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use super::container::Context;
use super::rate_limiter::Debounced;
use super::reactive::Property;
use super::timers::TimerTask;
use crate::commbus::Message;
use crate::metadata::Annotate;
use crate::types::{Error, Result};

// =============================================================================
// Service Trait
// =============================================================================

/// Singleton owned by a container.
pub trait Service: Any + Send + Sync + Default {
    /// Declare annotations for this type. Runs once, at registration.
    fn describe(_meta: &mut Annotate<'_, Self>) {}

    /// Called once per container, in id order, before wiring.
    fn initialize(&self, _ctx: &Context) {}

    /// Expose the properties that may be observed or persisted.
    ///
    /// Hub services get every listed property bound; other services only the
    /// keys declared with [`Annotate::observable`].
    fn properties<'a>(&'a self, _props: &mut Properties<'a>) {}
}

/// Services that receive container broadcasts (see [`Annotate::receives_messages`]).
pub trait MessageReceiver: Send + Sync + 'static {
    fn message_received(&self, message: &Message);
}

/// Property list collected from [`Service::properties`].
pub struct Properties<'a> {
    entries: Vec<(&'static str, &'a dyn Property)>,
}

impl<'a> Properties<'a> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, key: &'static str, property: &'a dyn Property) -> &mut Self {
        self.entries.push((key, property));
        self
    }

    pub fn get(&self, key: &str) -> Option<&'a dyn Property> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, property)| *property)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &'a dyn Property)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Properties<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter().map(|(k, _)| k)).finish()
    }
}

// =============================================================================
// Instances
// =============================================================================

/// Type-erased service instance as stored by the container.
pub type Instance = Arc<dyn Any + Send + Sync>;

pub(crate) fn downcast<S: Any + Send + Sync>(instance: Instance) -> Result<Arc<S>> {
    instance
        .downcast::<S>()
        .map_err(|_| Error::internal(format!("instance is not a {}", type_name::<S>())))
}

/// Last path segment of a type name, used as the default service name.
pub(crate) fn short_type_name<S: ?Sized>() -> &'static str {
    let full = type_name::<S>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

// =============================================================================
// Wired
// =============================================================================

/// Reference to another service, resolved when the container is built.
pub struct Wired<T> {
    target: OnceLock<Weak<T>>,
}

impl<T: Service> Wired<T> {
    /// The wired service. Fails if the container was dropped or the field was
    /// never resolved (the owning type was not built by a container).
    pub fn get(&self) -> Result<Arc<T>> {
        self.try_get().ok_or_else(|| {
            Error::not_found(format!("wired {} is not available", short_type_name::<T>()))
        })
    }

    pub fn try_get(&self) -> Option<Arc<T>> {
        self.target.get().and_then(Weak::upgrade)
    }

    pub(crate) fn resolve(&self, target: Weak<T>) -> bool {
        self.target.set(target).is_ok()
    }
}

impl<T> Default for Wired<T> {
    fn default() -> Self {
        Self {
            target: OnceLock::new(),
        }
    }
}

impl<T> fmt::Debug for Wired<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wired")
            .field("target", &short_type_name::<T>())
            .field("resolved", &self.target.get().is_some())
            .finish()
    }
}

// =============================================================================
// RateLimited
// =============================================================================

/// Method slot replaced by a debounce or throttle wrapper at registration.
///
/// A slot wraps exactly one method. Further layers are added with
/// `debounced_over` or `throttled_over`, which take no method of their own;
/// annotating a filled slot with a second method, or stacking on an empty
/// one, fails the container build. Throttles install before debounces, so a
/// debounce always ends up outermost.
pub struct RateLimited<A, R> {
    installed: RwLock<Option<Debounced<A, Option<R>>>>,
}

impl<A, R> RateLimited<A, R>
where
    A: Send + 'static,
    R: Clone + Send + 'static,
{
    /// Call through the wrapper. Returns the latest result of the underlying
    /// method, or `None` if it has not produced one yet.
    pub fn call(&self, args: A) -> Option<R> {
        let wrapper = self.installed.read().clone();
        match wrapper {
            Some(wrapper) => wrapper.call(args).flatten(),
            None => {
                tracing::warn!("rate-limited method called before installation");
                None
            }
        }
    }

    /// Drop the pending invocation.
    pub fn cancel(&self) {
        if let Some(wrapper) = self.installed.read().clone() {
            wrapper.cancel();
        }
    }

    /// Run the pending invocation now.
    pub fn flush(&self) -> Option<R> {
        let wrapper = self.installed.read().clone();
        wrapper.and_then(|w| w.flush().flatten())
    }

    pub fn is_installed(&self) -> bool {
        self.installed.read().is_some()
    }

    pub(crate) fn current(&self) -> Option<Debounced<A, Option<R>>> {
        self.installed.read().clone()
    }

    pub(crate) fn install(&self, wrapper: Debounced<A, Option<R>>) {
        *self.installed.write() = Some(wrapper);
    }
}

impl<A, R> Default for RateLimited<A, R> {
    fn default() -> Self {
        Self {
            installed: RwLock::new(None),
        }
    }
}

impl<A, R> fmt::Debug for RateLimited<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimited")
            .field("installed", &self.installed.read().is_some())
            .finish()
    }
}

// =============================================================================
// Timer
// =============================================================================

/// Handle to a repeating timer installed at registration.
#[derive(Default)]
pub struct Timer {
    task: OnceLock<Arc<TimerTask>>,
}

impl Timer {
    pub fn start(&self) {
        match self.task.get() {
            Some(task) => task.start(),
            None => tracing::warn!("timer started before installation"),
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.get() {
            task.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.get().is_some_and(|task| task.is_running())
    }

    pub fn is_installed(&self) -> bool {
        self.task.get().is_some()
    }

    pub(crate) fn install(&self, task: Arc<TimerTask>) -> bool {
        self.task.set(task).is_ok()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.task.get() {
            Some(task) => task.fmt(f),
            None => f.write_str("Timer(uninstalled)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::reactive::Reactive;

    #[derive(Default)]
    struct Sample {
        a: Reactive<u8>,
        b: Reactive<String>,
    }

    impl Service for Sample {
        fn properties<'a>(&'a self, props: &mut Properties<'a>) {
            props.add("a", &self.a).add("b", &self.b);
        }
    }

    #[test]
    fn test_properties_lookup() {
        let sample = Sample::default();
        let mut props = Properties::new();
        sample.properties(&mut props);

        assert_eq!(props.len(), 2);
        assert!(props.get("b").is_some());
        assert!(props.get("c").is_none());
        assert_eq!(props.iter().map(|(k, _)| k).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<Sample>(), "Sample");
        assert_eq!(short_type_name::<Wired<Sample>>(), "Wired");
    }

    #[test]
    fn test_unresolved_wired_is_an_error() {
        let wired: Wired<Sample> = Wired::default();
        assert!(wired.try_get().is_none());
        assert!(matches!(wired.get(), Err(Error::NotFound(_))));

        let target = Arc::new(Sample::default());
        assert!(wired.resolve(Arc::downgrade(&target)));
        assert!(wired.get().is_ok());
        drop(target);
        assert!(wired.get().is_err());
    }

    #[test]
    fn test_uninstalled_slots_are_inert() {
        let method: RateLimited<u32, u32> = RateLimited::default();
        assert_eq!(method.call(1), None);
        assert_eq!(method.flush(), None);
        method.cancel();

        let timer = Timer::default();
        timer.start();
        timer.stop();
        assert!(!timer.is_running());
        assert!(!timer.is_installed());
    }
}
