//! Hook invocation across services.
//!
//! A hook is a named, typed method that services opt into with
//! [`Annotate::handles`](crate::metadata::Annotate::handles). The orchestrator
//! calls it on one service ([`invoke`]) or on every service handling it
//! ([`invoke_all`]), ordered by the services' `order` (ties keep id order).
//!
//! Strategies:
//!   - `Linear`: one after another; an error stops the remaining calls
//!   - `Parallel`: all at once; the first error fails the whole call
//!   - `Race`: all at once; the first call to settle decides the result
//!   - `All`: fire and forget; errors are logged
//!
//! Concurrent calls run as spawned tasks and are never cancelled by the
//! orchestrator: losers of a race, and siblings of a failed parallel call,
//! keep running unobserved.

use async_trait::async_trait;
use futures::future::{select_all, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument;

use super::container::Container;
use super::services::{Instance, Service};
use crate::deadline::within;
use crate::types::{Error, Result, ServiceId};

// =============================================================================
// Hooks
// =============================================================================

/// Named method a service may handle.
pub trait Hook: Send + Sync + 'static {
    const NAME: &'static str;
    type Args: Clone + Send + Sync + 'static;
    type Output: Send + 'static;
}

/// Implementation of hook `H` by a service.
#[async_trait]
pub trait Handler<H: Hook>: Send + Sync + 'static {
    async fn handle(&self, args: H::Args) -> Result<H::Output>;
}

/// Post-build initialization hook, invoked by the application once the
/// container is ready.
#[derive(Debug, Clone, Copy)]
pub struct Created;

impl Hook for Created {
    const NAME: &'static str = "created";
    type Args = ();
    type Output = ();
}

pub(crate) type HookFn<H> = Arc<
    dyn Fn(Instance, <H as Hook>::Args) -> BoxFuture<'static, Result<<H as Hook>::Output>>
        + Send
        + Sync,
>;

// =============================================================================
// Strategies
// =============================================================================

/// How [`invoke_all`] runs its calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Linear,
    Parallel,
    Race,
    All,
}

/// Result of [`invoke_all`].
#[derive(Debug)]
pub enum Invoked<T> {
    /// Value per service (`Linear`, `Parallel`; empty for `All`).
    Each(BTreeMap<ServiceId, T>),
    /// Winner of a `Race`, `None` when no service handles the hook.
    First(Option<T>),
}

impl<T> Invoked<T> {
    /// Per-service values. Empty for a race result.
    pub fn into_each(self) -> BTreeMap<ServiceId, T> {
        match self {
            Invoked::Each(values) => values,
            Invoked::First(_) => BTreeMap::new(),
        }
    }

    /// Race winner. `None` for per-service results.
    pub fn into_first(self) -> Option<T> {
        match self {
            Invoked::Each(_) => None,
            Invoked::First(value) => value,
        }
    }
}

struct Target<H: Hook> {
    id: ServiceId,
    label: String,
    instance: Instance,
    call: HookFn<H>,
}

impl<H: Hook> Target<H> {
    fn run(
        self,
        args: H::Args,
        limit: Option<Duration>,
    ) -> impl std::future::Future<Output = Result<H::Output>> + Send + 'static {
        let Target {
            label,
            instance,
            call,
            ..
        } = self;
        async move { within(limit, &label, call(instance, args)).await }
    }

    fn spawn(self, args: H::Args, limit: Option<Duration>) -> (ServiceId, JoinHandle<Result<H::Output>>) {
        let id = self.id;
        (id, tokio::spawn(self.run(args, limit).in_current_span()))
    }
}

fn target<H: Hook>(container: &Container, id: ServiceId) -> Result<Option<Target<H>>> {
    let catalog = container.catalog();
    let meta = catalog
        .metadata(id)
        .ok_or_else(|| Error::not_found(format!("no service at {id}")))?;
    let Some(entry) = meta.handles(TypeId::of::<H>()) else {
        return Ok(None);
    };
    let call = entry
        .call
        .downcast_ref::<HookFn<H>>()
        .cloned()
        .ok_or_else(|| Error::internal(format!("handler for `{}` has the wrong type", H::NAME)))?;
    let instance = container
        .get(id)
        .ok_or_else(|| Error::not_found(format!("no service at {id}")))?;
    let name = catalog.name(id).unwrap_or("<unnamed>");
    Ok(Some(Target {
        id,
        label: format!("{}::{}", name, H::NAME),
        instance,
        call,
    }))
}

/// Every service handling `H`, stably sorted by order.
fn targets<H: Hook>(container: &Container) -> Result<Vec<Target<H>>> {
    let catalog = container.catalog();
    let mut found = Vec::new();
    for id in catalog.ids() {
        if let Some(t) = target::<H>(container, id)? {
            let order = catalog.metadata(id).map_or(0, |m| m.order);
            found.push((order, t));
        }
    }
    found.sort_by_key(|(order, _)| *order);
    Ok(found.into_iter().map(|(_, t)| t).collect())
}

fn joined<T>(id: ServiceId, result: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    result.map_err(|err| Error::internal(format!("hook call on service {id} failed: {err}")))?
}

// =============================================================================
// Invocation
// =============================================================================

/// Call hook `H` on service `S`.
pub async fn invoke<S: Service, H: Hook>(container: &Container, args: H::Args) -> Result<H::Output> {
    let catalog = container.catalog();
    let id = catalog.id_of::<S>().ok_or_else(|| {
        Error::not_found(format!("{} is not registered", std::any::type_name::<S>()))
    })?;
    let target = target::<H>(container, id)?.ok_or_else(|| {
        Error::missing_handler(catalog.name(id).unwrap_or("<unnamed>"), H::NAME)
    })?;

    tracing::debug!(hook = H::NAME, service = %id, "invoking hook");
    target.run(args, container.config().invocation.call_timeout).await
}

/// Call hook `H` on every service that handles it.
pub async fn invoke_all<H: Hook>(
    container: &Container,
    strategy: Strategy,
    args: H::Args,
) -> Result<Invoked<H::Output>> {
    let targets = targets::<H>(container)?;
    let limit = container.config().invocation.call_timeout;
    tracing::debug!(
        hook = H::NAME,
        strategy = ?strategy,
        targets = targets.len(),
        "invoking hook on all handlers"
    );

    match strategy {
        Strategy::Linear => {
            let mut results = BTreeMap::new();
            for target in targets {
                let id = target.id;
                let value = target.run(args.clone(), limit).await?;
                results.insert(id, value);
            }
            Ok(Invoked::Each(results))
        }
        Strategy::Parallel => {
            let mut pending: FuturesUnordered<_> = targets
                .into_iter()
                .map(|target| {
                    let (id, handle) = target.spawn(args.clone(), limit);
                    async move { (id, handle.await) }
                })
                .collect();

            let mut results = BTreeMap::new();
            while let Some((id, outcome)) = pending.next().await {
                results.insert(id, joined(id, outcome)?);
            }
            Ok(Invoked::Each(results))
        }
        Strategy::Race => {
            if targets.is_empty() {
                if container.config().invocation.race_empty_is_error {
                    return Err(Error::not_found(format!("no service handles `{}`", H::NAME)));
                }
                return Ok(Invoked::First(None));
            }
            let (ids, handles): (Vec<_>, Vec<_>) = targets
                .into_iter()
                .map(|target| target.spawn(args.clone(), limit))
                .unzip();
            let (outcome, index, _rest) = select_all(handles).await;
            joined(ids[index], outcome).map(|value| Invoked::First(Some(value)))
        }
        Strategy::All => {
            fire_and_forget(targets, &args, limit);
            Ok(Invoked::Each(BTreeMap::new()))
        }
    }
}

fn fire_and_forget<H: Hook>(targets: Vec<Target<H>>, args: &H::Args, limit: Option<Duration>) -> usize {
    let started = targets.len();
    for target in targets {
        let label = target.label.clone();
        let call = target.run(args.clone(), limit);
        let task = async move {
            if let Err(err) = call.await {
                tracing::warn!(call = %label, "fire-and-forget hook call failed: {}", err);
            }
        };
        tokio::spawn(task.in_current_span());
    }
    started
}

// =============================================================================
// Container shortcuts
// =============================================================================

impl Container {
    /// Call hook `H` on service `S`.
    pub async fn invoke<S: Service, H: Hook>(&self, args: H::Args) -> Result<H::Output> {
        invoke::<S, H>(self, args).await
    }

    pub async fn invoke_linear<H: Hook>(&self, args: H::Args) -> Result<BTreeMap<ServiceId, H::Output>> {
        invoke_all::<H>(self, Strategy::Linear, args).await.map(Invoked::into_each)
    }

    pub async fn invoke_parallel<H: Hook>(&self, args: H::Args) -> Result<BTreeMap<ServiceId, H::Output>> {
        invoke_all::<H>(self, Strategy::Parallel, args).await.map(Invoked::into_each)
    }

    pub async fn invoke_race<H: Hook>(&self, args: H::Args) -> Result<Option<H::Output>> {
        invoke_all::<H>(self, Strategy::Race, args).await.map(Invoked::into_first)
    }

    /// Start `H` on every handler without waiting. Returns how many calls
    /// were started.
    pub fn invoke_all<H: Hook>(&self, args: H::Args) -> Result<usize> {
        let targets = targets::<H>(self)?;
        Ok(fire_and_forget(targets, &args, self.config().invocation.call_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Annotate, Registry};
    use crate::types::Config;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    struct Probe;
    impl Hook for Probe {
        const NAME: &'static str = "probe";
        type Args = u32;
        type Output = String;
    }

    #[derive(Default)]
    struct Echo;
    impl Service for Echo {
        fn describe(meta: &mut Annotate<'_, Self>) {
            meta.handles::<Probe>();
        }
    }
    #[async_trait]
    impl Handler<Probe> for Echo {
        async fn handle(&self, args: u32) -> Result<String> {
            Ok(format!("echo {args}"))
        }
    }

    #[derive(Default)]
    struct Silent;
    impl Service for Silent {}

    #[derive(Default)]
    struct Greeter {
        greeted: Mutex<bool>,
    }
    impl Service for Greeter {
        fn describe(meta: &mut Annotate<'_, Self>) {
            meta.handles::<Created>().handles::<Probe>();
        }
    }
    #[async_trait]
    impl Handler<Created> for Greeter {
        async fn handle(&self, _: ()) -> Result<()> {
            *self.greeted.lock() = true;
            Ok(())
        }
    }
    #[async_trait]
    impl Handler<Probe> for Greeter {
        async fn handle(&self, args: u32) -> Result<String> {
            Ok(format!("hello {args}"))
        }
    }

    #[derive(Default)]
    struct Refuser;
    impl Service for Refuser {
        fn describe(meta: &mut Annotate<'_, Self>) {
            meta.handles::<Probe>();
        }
    }
    #[async_trait]
    impl Handler<Probe> for Refuser {
        async fn handle(&self, _: u32) -> Result<String> {
            Err(Error::validation("refused"))
        }
    }

    fn container() -> Container {
        let mut registry = Registry::new();
        registry.register::<Echo>().unwrap();
        registry.register::<Silent>().unwrap();
        registry.register::<Greeter>().unwrap();
        Container::build(&registry.freeze(), Config::default()).unwrap()
    }

    #[tokio::test]
    async fn test_invoke_single_service() {
        let container = container();
        assert_eq!(container.invoke::<Echo, Probe>(4).await.unwrap(), "echo 4");

        container.invoke::<Greeter, Created>(()).await.unwrap();
        assert!(*container.pick::<Greeter>().unwrap().greeted.lock());
    }

    #[tokio::test]
    async fn test_invoke_missing_handler() {
        let container = container();
        let err = container.invoke::<Silent, Probe>(1).await.unwrap_err();
        assert!(matches!(err, Error::MissingHandler { hook: "probe", .. }));
    }

    #[tokio::test]
    async fn test_linear_collects_by_id() {
        let container = container();
        let results = container.invoke_linear::<Probe>(2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[&ServiceId::new(0)], "echo 2");
        assert_eq!(results[&ServiceId::new(2)], "hello 2");
    }

    #[tokio::test]
    async fn test_race_over_no_handlers() {
        struct Nobody;
        impl Hook for Nobody {
            const NAME: &'static str = "nobody";
            type Args = ();
            type Output = ();
        }

        let container = container();
        assert!(container.invoke_race::<Nobody>(()).await.unwrap().is_none());
        assert_eq!(container.invoke_all::<Nobody>(()).unwrap(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_fire_and_forget_only_logs_failures() {
        let mut registry = Registry::new();
        registry.register::<Echo>().unwrap();
        registry.register::<Refuser>().unwrap();
        let container = Container::build(&registry.freeze(), Config::default()).unwrap();

        let invoked = invoke_all::<Probe>(&container, Strategy::All, 3).await.unwrap();
        assert!(invoked.into_each().is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(logs_contain("fire-and-forget hook call failed"));
        assert!(logs_contain("refused"));
    }

    #[test]
    fn test_first_of_per_service_results_is_none() {
        let each = Invoked::Each(BTreeMap::from([(ServiceId::new(0), 1u32)]));
        assert_eq!(each.into_first(), None);
        assert_eq!(Invoked::First(Some(2u32)).into_first(), Some(2));
    }

    #[test]
    fn test_strategy_serde() {
        let json = serde_json::to_string(&Strategy::Parallel).unwrap();
        assert_eq!(json, "\"parallel\"");
    }
}
