//! Service type registration.
//!
//! A [`Registry`] collects service types in registration order, assigning
//! dense ids. [`Registry::freeze`] turns it into an immutable [`Catalog`],
//! which containers are built from.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{Annotate, Metadata, MetadataPatch, MetadataRegistry};
use crate::commbus::EventBus;
use crate::kernel::container::Context;
use crate::kernel::reactive::Property;
use crate::kernel::services::{short_type_name, Instance, Properties, Service};
use crate::types::{Error, Result, ServiceId};

// =============================================================================
// VTable
// =============================================================================

/// Monomorphized entry points for one service type.
#[derive(Clone, Copy)]
pub(crate) struct ServiceVTable {
    pub(crate) create: fn() -> Instance,
    pub(crate) initialize: fn(&Instance, &Context),
    pub(crate) visit_properties: fn(&Instance, &mut dyn FnMut(&'static str, &dyn Property)),
}

impl ServiceVTable {
    fn of<S: Service>() -> Self {
        Self {
            create: create::<S>,
            initialize: initialize::<S>,
            visit_properties: visit_properties::<S>,
        }
    }
}

fn create<S: Service>() -> Instance {
    Arc::new(S::default())
}

fn initialize<S: Service>(instance: &Instance, ctx: &Context) {
    if let Some(service) = instance.downcast_ref::<S>() {
        service.initialize(ctx);
    }
}

fn visit_properties<S: Service>(
    instance: &Instance,
    visit: &mut dyn FnMut(&'static str, &dyn Property),
) {
    if let Some(service) = instance.downcast_ref::<S>() {
        let mut props = Properties::new();
        service.properties(&mut props);
        for (key, property) in props.iter() {
            visit(key, property);
        }
    }
}

#[derive(Clone)]
struct TypeEntry {
    type_id: TypeId,
    type_name: &'static str,
    vtable: ServiceVTable,
}

// =============================================================================
// Registry
// =============================================================================

/// Open set of service types. Not shareable; freeze it to build containers.
#[derive(Default)]
pub struct Registry {
    entries: Vec<TypeEntry>,
    metadata: MetadataRegistry,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `S`, assign its id and create its channel, then run
    /// [`Service::describe`].
    pub fn register<S: Service>(&mut self) -> Result<ServiceId> {
        self.add::<S>(false)
    }

    /// Register `S` as a hub: every property it lists is reactive.
    pub fn register_hub<S: Service>(&mut self) -> Result<ServiceId> {
        self.add::<S>(true)
    }

    fn add<S: Service>(&mut self, hub: bool) -> Result<ServiceId> {
        let type_id = TypeId::of::<S>();
        if self.entries.iter().any(|e| e.type_id == type_id) {
            return Err(Error::validation(format!(
                "service type {} is already registered",
                short_type_name::<S>()
            )));
        }

        let id = ServiceId::new(self.entries.len());
        self.entries.push(TypeEntry {
            type_id,
            type_name: short_type_name::<S>(),
            vtable: ServiceVTable::of::<S>(),
        });
        self.metadata.annotate(
            type_id,
            MetadataPatch {
                id: Some(id),
                hub: Some(hub),
                channel: Some(EventBus::new()),
                ..Default::default()
            },
        );
        S::describe(&mut Annotate::new(&mut self.metadata));

        tracing::debug!(service = short_type_name::<S>(), id = %id, hub, "registered service type");
        Ok(id)
    }

    /// Add annotations to `S` outside of [`Service::describe`].
    pub fn annotate<S: Service>(&mut self) -> Annotate<'_, S> {
        Annotate::new(&mut self.metadata)
    }

    /// Accumulated record of `S`, or an empty record.
    pub fn metadata_of<S: Service>(&self) -> Metadata {
        self.metadata.metadata_of(TypeId::of::<S>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze the registered types and their metadata.
    pub fn freeze(self) -> Catalog {
        let metadata = self
            .entries
            .iter()
            .map(|entry| self.metadata.metadata_of(entry.type_id))
            .collect();
        let by_type = self
            .entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.type_id, ServiceId::new(index)))
            .collect();

        Catalog {
            inner: Arc::new(CatalogInner {
                entries: self.entries,
                metadata,
                by_type,
            }),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field(
                "types",
                &self.entries.iter().map(|e| e.type_name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

// =============================================================================
// Catalog
// =============================================================================

struct CatalogInner {
    entries: Vec<TypeEntry>,
    metadata: Vec<Metadata>,
    by_type: HashMap<TypeId, ServiceId>,
}

/// Frozen registry. Cheap to clone.
#[derive(Clone)]
pub struct Catalog {
    inner: Arc<CatalogInner>,
}

impl Catalog {
    pub fn id_of<S: Service>(&self) -> Option<ServiceId> {
        self.id_of_type(TypeId::of::<S>())
    }

    pub fn id_of_type(&self, type_id: TypeId) -> Option<ServiceId> {
        self.inner.by_type.get(&type_id).copied()
    }

    pub fn metadata(&self, id: ServiceId) -> Option<&Metadata> {
        self.inner.metadata.get(id.index())
    }

    pub fn metadata_of<S: Service>(&self) -> Option<&Metadata> {
        self.id_of::<S>().and_then(|id| self.metadata(id))
    }

    /// Display name: the annotated name, else the type name.
    pub fn name(&self, id: ServiceId) -> Option<&str> {
        let entry = self.inner.entries.get(id.index())?;
        let annotated = self.metadata(id).and_then(|m| m.name.as_deref());
        Some(annotated.unwrap_or(entry.type_name))
    }

    /// Look a service up by its display name.
    pub fn find(&self, name: &str) -> Option<ServiceId> {
        self.ids().find(|id| self.name(*id) == Some(name))
    }

    pub fn ids(&self) -> impl Iterator<Item = ServiceId> + '_ {
        (0..self.inner.entries.len()).map(ServiceId::new)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub(crate) fn vtable(&self, id: ServiceId) -> Option<ServiceVTable> {
        self.inner.entries.get(id.index()).map(|e| e.vtable)
    }
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field(
                "types",
                &self.inner.entries.iter().map(|e| e.type_name).collect::<Vec<_>>(),
            )
            .finish()
    }
}
