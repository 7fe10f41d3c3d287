//! Service container.
//!
//! [`Container::build`] creates one instance per catalog entry, then registers
//! each instance in ascending id order:
//!
//! 1. create the [`Context`] back-reference
//! 2. run [`Service::initialize`]
//! 3. resolve wired fields
//! 4. install throttled, then debounced methods
//! 5. install timers (auto-started unless `stopped`)
//! 6. bind reactive properties, with their triggers
//! 7. subscribe message receivers to the broadcast channel
//!
//! All instances exist before step 3 runs for any of them, so wiring is a
//! plain lookup by id and cycles are fine. Metadata that cannot be satisfied
//! fails the build before any service is initialized.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use super::reactive::{Binding, Trigger};
use super::services::{downcast, Instance, Service};
use super::snapshot::{self, Snapshot, SnapshotOptions};
use super::timers::TimerTask;
use crate::commbus::{Change, EventBus, Message, Update};
use crate::metadata::{Catalog, Metadata};
use crate::types::{Config, ContainerId, Error, Result, ServiceId};

pub(crate) struct Shared {
    id: ContainerId,
    catalog: Catalog,
    config: Config,
    services: Vec<Instance>,
    channel: EventBus<Message>,
    updates: EventBus<Update>,
    timers: Mutex<Vec<Arc<TimerTask>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let timers = std::mem::take(self.timers.get_mut());
        for timer in &timers {
            timer.stop();
        }
        tracing::debug!(container = %self.id, timers = timers.len(), "container dropped");
    }
}

/// Owner of one set of service singletons. Cheap to clone.
#[derive(Clone)]
pub struct Container {
    shared: Arc<Shared>,
}

impl Container {
    /// Instantiate and register every service of `catalog`.
    ///
    /// Must run inside a tokio runtime: timers are spawned as tasks.
    pub fn build(catalog: &Catalog, config: Config) -> Result<Self> {
        let id = ContainerId::new();
        let mut services = Vec::with_capacity(catalog.len());
        for service in catalog.ids() {
            let vtable = catalog
                .vtable(service)
                .ok_or_else(|| Error::internal(format!("no entry for service {service}")))?;
            services.push((vtable.create)());
        }
        validate(catalog, &services)?;

        let container = Self {
            shared: Arc::new(Shared {
                id,
                catalog: catalog.clone(),
                config,
                services,
                channel: EventBus::new(),
                updates: EventBus::new(),
                timers: Mutex::new(Vec::new()),
            }),
        };
        for service in catalog.ids() {
            container.register(service)?;
        }

        tracing::info!(
            container = %container.shared.id,
            services = catalog.len(),
            "container built"
        );
        Ok(container)
    }

    fn register(&self, id: ServiceId) -> Result<()> {
        let shared = &self.shared;
        let catalog = &shared.catalog;
        let meta = catalog
            .metadata(id)
            .ok_or_else(|| Error::internal(format!("no metadata for service {id}")))?;
        let vtable = catalog
            .vtable(id)
            .ok_or_else(|| Error::internal(format!("no entry for service {id}")))?;
        let instance = &shared.services[id.index()];
        let name = catalog.name(id).unwrap_or("<unnamed>");

        let ctx = Context {
            shared: Arc::downgrade(shared),
            service: id,
        };
        (vtable.initialize)(instance, &ctx);

        for wired in &meta.wired {
            let target = catalog.id_of_type(wired.target).ok_or_else(|| unregistered(name, wired))?;
            (wired.resolve.0)(instance, &shared.services[target.index()])?;
            tracing::trace!(service = name, key = %wired.key, target = %target, "wired");
        }

        for entry in &meta.throttle_functions {
            (entry.install.0)(instance)?;
            tracing::trace!(service = name, key = %entry.key, wait = ?entry.wait, "throttled");
        }
        for entry in &meta.debounce_functions {
            (entry.install.0)(instance)?;
            tracing::trace!(service = name, key = %entry.key, wait = ?entry.wait, "debounced");
        }

        for entry in &meta.timers {
            let label = entry
                .options
                .name
                .clone()
                .unwrap_or_else(|| format!("{}.{}", name, entry.key));
            let task = (entry.install.0)(instance, label)?;
            if !entry.options.stopped {
                task.start();
            }
            shared.timers.lock().push(task);
        }

        self.bind_properties(id, meta, instance)?;

        if let Some(receiver) = &meta.message_receiver {
            let listener = (receiver.subscribe.0)(instance)?;
            // Lives as long as the broadcast channel.
            let _subscription = shared.channel.attach(listener);
        }

        tracing::debug!(container = %shared.id, service = name, id = %id, "service registered");
        Ok(())
    }

    fn bind_properties(&self, id: ServiceId, meta: &Metadata, instance: &Instance) -> Result<()> {
        let shared = &self.shared;
        let channel = meta
            .channel
            .clone()
            .ok_or_else(|| Error::internal(format!("service {id} has no channel")))?;

        let mut triggers: HashMap<&str, Vec<Trigger>> = HashMap::new();
        for (key, entries) in &meta.triggers {
            let mut built = Vec::with_capacity(entries.len());
            for entry in entries {
                built.push(Trigger {
                    method: entry.method.clone(),
                    run: (entry.build.0)(instance)?,
                });
            }
            triggers.insert(key.as_str(), built);
        }

        let vtable = shared
            .catalog
            .vtable(id)
            .ok_or_else(|| Error::internal(format!("no entry for service {id}")))?;
        let mut bound = 0usize;
        (vtable.visit_properties)(instance, &mut |key, property| {
            if !meta.is_observable(key) {
                return;
            }
            let binding = Binding::new(
                id,
                key,
                channel.clone(),
                shared.updates.clone(),
                triggers.remove(key).unwrap_or_default(),
            );
            if property.bind(binding) {
                bound += 1;
            } else {
                tracing::warn!(service = %id, key, "property listed twice, second binding ignored");
            }
        });

        for key in triggers.keys() {
            tracing::warn!(service = %id, key, "trigger on a property that is not observed");
        }
        tracing::trace!(service = %id, bound, "properties bound");
        Ok(())
    }

    pub fn id(&self) -> &ContainerId {
        &self.shared.id
    }

    /// The `S` singleton.
    pub fn pick<S: Service>(&self) -> Result<Arc<S>> {
        let id = self.shared.catalog.id_of::<S>().ok_or_else(|| {
            Error::not_found(format!("{} is not registered", std::any::type_name::<S>()))
        })?;
        let instance = self
            .get(id)
            .ok_or_else(|| Error::not_found(format!("no service at {id}")))?;
        downcast::<S>(instance)
    }

    /// Instance at `id`.
    pub fn get(&self, id: ServiceId) -> Option<Instance> {
        self.shared.services.get(id.index()).cloned()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn metadata_of<S: Service>(&self) -> Result<&Metadata> {
        self.shared
            .catalog
            .metadata_of::<S>()
            .ok_or_else(|| Error::not_found(format!("{} is not registered", std::any::type_name::<S>())))
    }

    /// Broadcast channel.
    pub fn channel(&self) -> &EventBus<Message> {
        &self.shared.channel
    }

    /// Every reactive change of every service.
    pub fn updates(&self) -> &EventBus<Update> {
        &self.shared.updates
    }

    /// Property-change channel of `S`.
    pub fn channel_of<S: Service>(&self) -> Result<EventBus<Change>> {
        self.metadata_of::<S>()?
            .channel
            .clone()
            .ok_or_else(|| Error::internal("service has no channel"))
    }

    /// Dispatch `message` on the broadcast channel. Returns the number of
    /// listeners reached.
    pub fn broadcast(&self, message: &Message) -> usize {
        self.shared.channel.dispatch(message)
    }

    /// Back-reference for the service at `id`.
    pub fn context(&self, id: ServiceId) -> Context {
        Context {
            shared: Arc::downgrade(&self.shared),
            service: id,
        }
    }

    pub fn len(&self) -> usize {
        self.shared.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.services.is_empty()
    }

    /// Number of timers installed across all services.
    pub fn timer_count(&self) -> usize {
        self.shared.timers.lock().len()
    }

    pub fn snapshot(&self, options: &SnapshotOptions) -> Result<Snapshot> {
        snapshot::snapshot(self, options)
    }

    pub fn restore(&self, snapshot: &Snapshot, options: &SnapshotOptions) -> Result<usize> {
        snapshot::restore(self, snapshot, options)
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.shared.id)
            .field("catalog", &self.shared.catalog)
            .finish()
    }
}

fn unregistered(service: &str, wired: &crate::metadata::WiredEntry) -> Error {
    Error::configuration(format!(
        "{}.{} is wired to {}, which is not registered",
        service, wired.key, wired.target_name
    ))
}

/// Check every service's metadata against the catalog and its properties.
fn validate(catalog: &Catalog, services: &[Instance]) -> Result<()> {
    for id in catalog.ids() {
        let (Some(meta), Some(vtable)) = (catalog.metadata(id), catalog.vtable(id)) else {
            continue;
        };
        let name = catalog.name(id).unwrap_or("<unnamed>");

        if let Some(wired) = meta.wired.iter().find(|w| catalog.id_of_type(w.target).is_none()) {
            return Err(unregistered(name, wired));
        }

        let mut keys = Vec::new();
        (vtable.visit_properties)(&services[id.index()], &mut |key, _| keys.push(key));
        let missing = meta
            .observables
            .iter()
            .map(|k| ("observable", k))
            .chain(meta.persisted.iter().map(|k| ("persisted", k)))
            .find(|(_, k)| !keys.iter().any(|exposed| *exposed == k.as_str()));
        if let Some((kind, key)) = missing {
            return Err(Error::configuration(format!(
                "{name} declares {kind} `{key}` but does not expose it as a property"
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Context
// =============================================================================

/// Weak back-reference from a service to its container.
#[derive(Clone)]
pub struct Context {
    shared: Weak<Shared>,
    service: ServiceId,
}

impl Context {
    /// Id of the service this context belongs to.
    pub fn service(&self) -> ServiceId {
        self.service
    }

    pub fn container(&self) -> Result<Container> {
        self.shared
            .upgrade()
            .map(|shared| Container { shared })
            .ok_or_else(|| Error::internal("container was dropped"))
    }

    pub fn pick<S: Service>(&self) -> Result<Arc<S>> {
        self.container()?.pick::<S>()
    }

    pub fn broadcast(&self, message: &Message) -> Result<usize> {
        Ok(self.container()?.broadcast(message))
    }

    /// Property-change channel of this service.
    pub fn channel(&self) -> Result<EventBus<Change>> {
        let container = self.container()?;
        container
            .catalog()
            .metadata(self.service)
            .and_then(|m| m.channel.clone())
            .ok_or_else(|| Error::internal(format!("service {} has no channel", self.service)))
    }

    pub fn updates(&self) -> Result<EventBus<Update>> {
        Ok(self.container()?.updates().clone())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("service", &self.service)
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::reactive::Reactive;
    use crate::kernel::services::{Properties, Wired};
    use crate::metadata::{Annotate, Registry};
    use std::sync::OnceLock;

    #[derive(Default)]
    struct Log {
        lines: Mutex<Vec<String>>,
        ctx: OnceLock<Context>,
    }
    impl Service for Log {
        fn initialize(&self, ctx: &Context) {
            let _ = self.ctx.set(ctx.clone());
            self.lines.lock().push("init".into());
        }
    }

    #[derive(Default)]
    struct Counter {
        count: Reactive<u32>,
        log: Wired<Log>,
    }
    impl Service for Counter {
        fn describe(meta: &mut Annotate<'_, Self>) {
            meta.observable("count")
                .wired("log", |s| &s.log)
                .trigger("count", "record", |s: &Counter| {
                    if let Ok(log) = s.log.get() {
                        log.lines.lock().push(format!("count={}", s.count.get()));
                    }
                });
        }

        fn properties<'a>(&'a self, props: &mut Properties<'a>) {
            props.add("count", &self.count);
        }
    }

    #[derive(Default)]
    struct Orphan {
        missing: Wired<Log>,
    }
    impl Service for Orphan {
        fn describe(meta: &mut Annotate<'_, Self>) {
            meta.wired("missing", |s| &s.missing);
        }
    }

    #[derive(Default)]
    struct Undeclared;
    impl Service for Undeclared {
        fn describe(meta: &mut Annotate<'_, Self>) {
            meta.observable("ghost");
        }
    }

    fn catalog() -> Catalog {
        let mut registry = Registry::new();
        registry.register::<Counter>().unwrap();
        registry.register::<Log>().unwrap();
        registry.freeze()
    }

    #[tokio::test]
    async fn test_build_wires_and_binds() {
        let container = Container::build(&catalog(), Config::default()).unwrap();
        assert_eq!(container.len(), 2);

        let counter = container.pick::<Counter>().unwrap();
        let log = container.pick::<Log>().unwrap();
        assert!(Arc::ptr_eq(&counter.log.get().unwrap(), &log));
        assert!(counter.count.is_bound());

        counter.count.set(3);
        assert_eq!(*log.lines.lock(), vec!["init", "count=3"]);
    }

    #[tokio::test]
    async fn test_context_reaches_container() {
        let container = Container::build(&catalog(), Config::default()).unwrap();
        let log = container.pick::<Log>().unwrap();
        let ctx = log.ctx.get().unwrap().clone();

        assert_eq!(ctx.service(), ServiceId::new(1));
        assert!(ctx.pick::<Counter>().is_ok());
        assert!(ctx.channel().unwrap().same_bus(&container.channel_of::<Log>().unwrap()));

        drop(log);
        drop(container);
        assert!(ctx.container().is_err());
    }

    #[tokio::test]
    async fn test_unregistered_wiring_fails_build() {
        let mut registry = Registry::new();
        registry.register::<Orphan>().unwrap();
        let err = Container::build(&registry.freeze(), Config::default()).unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("Orphan.missing"));
    }

    #[tokio::test]
    async fn test_unknown_observable_fails_build() {
        let mut registry = Registry::new();
        registry.register::<Undeclared>().unwrap();
        let err = Container::build(&registry.freeze(), Config::default()).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_pick_unregistered_type() {
        let container = Container::build(&catalog(), Config::default()).unwrap();
        assert!(matches!(container.pick::<Orphan>(), Err(Error::NotFound(_))));
        assert!(container.get(ServiceId::new(9)).is_none());
    }

    #[tokio::test]
    async fn test_containers_from_one_catalog_are_independent() {
        let catalog = catalog();
        let first = Container::build(&catalog, Config::default()).unwrap();
        let second = Container::build(&catalog, Config::default()).unwrap();

        first.pick::<Counter>().unwrap().count.set(1);
        assert_eq!(second.pick::<Counter>().unwrap().count.get(), 0);
        assert_ne!(first.id(), second.id());
    }
}
