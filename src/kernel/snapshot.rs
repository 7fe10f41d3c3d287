//! Capture and restore of persisted properties.
//!
//! A [`Snapshot`] maps service ids to a JSON object holding exactly the
//! service's `persisted` properties, or its observables when asked through
//! [`SnapshotOptions::keys`]. Restoring goes through each property's
//! normal setter, so bound properties notify on change.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::container::Container;
use crate::metadata::Metadata;
use crate::types::{Result, ServiceId};

/// Persisted state by service id.
pub type Snapshot = BTreeMap<ServiceId, Map<String, Value>>;

type KeyFilter = Arc<dyn Fn(&Metadata, &str) -> bool + Send + Sync>;

/// Metadata key list a snapshot covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeySet {
    #[default]
    Persisted,
    Observables,
}

/// Options for [`snapshot`] and [`restore`].
#[derive(Clone, Default)]
pub struct SnapshotOptions {
    keys: KeySet,
    validate: Option<KeyFilter>,
}

impl SnapshotOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture and restore the keys of `keys` instead of the persisted ones.
    pub fn keys(mut self, keys: KeySet) -> Self {
        self.keys = keys;
        self
    }

    /// Only keys for which `filter` returns true are captured or restored.
    pub fn validate<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Metadata, &str) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(filter));
        self
    }

    fn covers(&self, meta: &Metadata) -> bool {
        match self.keys {
            KeySet::Persisted => !meta.persisted.is_empty(),
            KeySet::Observables => meta.hub || !meta.observables.is_empty(),
        }
    }

    fn selects(&self, meta: &Metadata, key: &str) -> bool {
        let listed = match self.keys {
            KeySet::Persisted => meta.is_persisted(key),
            KeySet::Observables => meta.is_observable(key),
        };
        listed && self.validate.as_ref().map_or(true, |filter| filter(meta, key))
    }
}

impl fmt::Debug for SnapshotOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotOptions")
            .field("keys", &self.keys)
            .field("validate", &self.validate.is_some())
            .finish()
    }
}

/// Selected properties of every service, persisted ones by default. Services
/// without selected keys are omitted.
pub fn snapshot(container: &Container, options: &SnapshotOptions) -> Result<Snapshot> {
    let catalog = container.catalog();
    let mut out = Snapshot::new();

    for id in catalog.ids() {
        let (Some(meta), Some(vtable), Some(instance)) =
            (catalog.metadata(id), catalog.vtable(id), container.get(id))
        else {
            continue;
        };
        if !options.covers(meta) {
            continue;
        }

        let mut values = Map::new();
        let mut failure = None;
        (vtable.visit_properties)(&instance, &mut |key, property| {
            if failure.is_some() || !options.selects(meta, key) {
                return;
            }
            match property.snapshot() {
                Ok(value) => {
                    values.insert(key.to_string(), value);
                }
                Err(err) => failure = Some(err),
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }
        out.insert(id, values);
    }

    tracing::debug!(container = %container.id(), services = out.len(), "snapshot taken");
    Ok(out)
}

/// Apply `snapshot`. Only keys that are both present and selected are
/// touched. Returns the number of properties that changed.
///
/// Every applicable value is checked before the first write, so a value that
/// does not fit its property fails the call with nothing assigned.
pub fn restore(container: &Container, snapshot: &Snapshot, options: &SnapshotOptions) -> Result<usize> {
    let catalog = container.catalog();
    let mut entries = Vec::with_capacity(snapshot.len());
    for (id, values) in snapshot {
        match (catalog.metadata(*id), catalog.vtable(*id), container.get(*id)) {
            (Some(meta), Some(vtable), Some(instance)) => {
                entries.push((*id, meta, vtable, instance, values));
            }
            _ => tracing::warn!(service = %id, "snapshot entry for unknown service skipped"),
        }
    }

    for (id, meta, vtable, instance, values) in &entries {
        let mut failure = None;
        (vtable.visit_properties)(instance, &mut |key, property| {
            if failure.is_some() || !options.selects(meta, key) {
                return;
            }
            if let Some(value) = values.get(key) {
                if let Err(err) = property.check(value) {
                    tracing::warn!(service = %id, key, error = %err, "snapshot value rejected");
                    failure = Some(err);
                }
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }
    }

    let mut changed = 0;
    let mut failure = None;
    for (_, meta, vtable, instance, values) in &entries {
        (vtable.visit_properties)(instance, &mut |key, property| {
            if failure.is_some() || !options.selects(meta, key) {
                return;
            }
            let Some(value) = values.get(key) else {
                return;
            };
            match property.restore(value.clone()) {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(err) => failure = Some(err),
            }
        });
    }
    if let Some(err) = failure {
        return Err(err);
    }

    tracing::debug!(container = %container.id(), changed, "snapshot restored");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commbus::Change;
    use crate::kernel::reactive::Reactive;
    use crate::kernel::services::{Properties, Service};
    use crate::metadata::{Annotate, Registry};
    use crate::types::Config;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Default)]
    struct Prefs {
        theme: Reactive<String>,
        volume: Reactive<u8>,
        scratch: Reactive<u8>,
    }

    impl Service for Prefs {
        fn describe(meta: &mut Annotate<'_, Self>) {
            meta.observable("theme").persisted("theme").persisted("volume");
        }

        fn properties<'a>(&'a self, props: &mut Properties<'a>) {
            props
                .add("theme", &self.theme)
                .add("volume", &self.volume)
                .add("scratch", &self.scratch);
        }
    }

    #[derive(Default)]
    struct Stateless;
    impl Service for Stateless {}

    fn container() -> Container {
        let mut registry = Registry::new();
        registry.register::<Stateless>().unwrap();
        registry.register::<Prefs>().unwrap();
        Container::build(&registry.freeze(), Config::default()).unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_holds_only_persisted_keys() {
        let container = container();
        let prefs = container.pick::<Prefs>().unwrap();
        prefs.theme.set("dark".into());
        prefs.volume.set(7);
        prefs.scratch.set(1);

        let snap = container.snapshot(&SnapshotOptions::new()).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(
            Value::Object(snap[&ServiceId::new(1)].clone()),
            json!({"theme": "dark", "volume": 7})
        );
    }

    #[tokio::test]
    async fn test_restore_touches_only_persisted_keys_and_notifies() {
        let container = container();
        let prefs = container.pick::<Prefs>().unwrap();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        let _sub = container
            .channel_of::<Prefs>()
            .unwrap()
            .listen(move |c: &Change| sink.lock().push(c.key.clone()));

        let mut values = Map::new();
        values.insert("theme".into(), json!("light"));
        values.insert("scratch".into(), json!(9));
        let mut snap = Snapshot::new();
        snap.insert(ServiceId::new(1), values);

        assert_eq!(container.restore(&snap, &SnapshotOptions::new()).unwrap(), 1);
        assert_eq!(prefs.theme.get(), "light");
        assert_eq!(prefs.scratch.get(), 0);
        assert_eq!(prefs.volume.get(), 0);
        assert_eq!(*changes.lock(), vec!["theme".to_string()]);
    }

    #[tokio::test]
    async fn test_validate_filter() {
        let container = container();
        container.pick::<Prefs>().unwrap().volume.set(3);
        let options = SnapshotOptions::new().validate(|_, key| key != "theme");

        let snap = container.snapshot(&options).unwrap();
        assert_eq!(
            Value::Object(snap[&ServiceId::new(1)].clone()),
            json!({"volume": 3})
        );
    }

    #[tokio::test]
    async fn test_snapshot_of_observables() {
        let container = container();
        let prefs = container.pick::<Prefs>().unwrap();
        prefs.theme.set("dark".into());
        prefs.volume.set(7);

        let options = SnapshotOptions::new().keys(KeySet::Observables);
        let snap = container.snapshot(&options).unwrap();
        assert_eq!(
            Value::Object(snap[&ServiceId::new(1)].clone()),
            json!({"theme": "dark"})
        );

        let mut values = Map::new();
        values.insert("theme".into(), json!("light"));
        values.insert("volume".into(), json!(1));
        let snap = Snapshot::from([(ServiceId::new(1), values)]);
        assert_eq!(container.restore(&snap, &options).unwrap(), 1);
        assert_eq!(prefs.theme.get(), "light");
        assert_eq!(prefs.volume.get(), 7);
    }

    #[tokio::test]
    async fn test_restore_rejects_mistyped_value_without_writing() {
        let container = container();
        let prefs = container.pick::<Prefs>().unwrap();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        let _sub = container
            .channel_of::<Prefs>()
            .unwrap()
            .listen(move |c: &Change| sink.lock().push(c.key.clone()));

        let mut values = Map::new();
        values.insert("theme".into(), json!("dark"));
        values.insert("volume".into(), json!("loud"));
        let snap = Snapshot::from([(ServiceId::new(1), values)]);

        let err = container.restore(&snap, &SnapshotOptions::new()).unwrap_err();
        assert!(matches!(err, crate::types::Error::Serialization(_)));
        assert_eq!(prefs.theme.get(), "");
        assert_eq!(prefs.volume.get(), 0);
        assert!(changes.lock().is_empty());
    }
}
