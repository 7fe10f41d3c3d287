//! Annotation builder handed to [`Service::describe`].

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::any::TypeId;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::{
    HandlerEntry, Installer, Metadata, MessageEntry, MetadataPatch, MetadataRegistry,
    RateLimitEntry, TimerEntry, TriggerEntry, WiredEntry,
};
use crate::commbus::{Listener, Message};
use crate::kernel::orchestrator::{Handler, Hook, HookFn};
use crate::kernel::rate_limiter::{
    debounce, throttle, DebounceOptions, Debounced, ThrottleOptions,
};
use crate::kernel::services::{
    downcast, short_type_name, Instance, MessageReceiver, RateLimited, Service, Timer, Wired,
};
use crate::kernel::timers::{Repeat, TimerOptions, TimerTask};
use crate::types::{Error, Result};

#[derive(Clone, Copy)]
enum Limit {
    Debounce(Duration, DebounceOptions),
    Throttle(Duration, ThrottleOptions),
}

/// Builder over the metadata record of service type `S`.
///
/// ```ignore
/// impl Service for Store {
///     fn describe(meta: &mut Annotate<'_, Self>) {
///         meta.name("store")
///             .observable("items")
///             .persisted("items")
///             .wired("api", |s| &s.api)
///             .debounced("save", Duration::from_millis(300), DebounceOptions::default(),
///                 |s| &s.save, |s, ()| s.write())
///             .handles::<Created>();
///     }
/// }
/// ```
pub struct Annotate<'r, S> {
    registry: &'r mut MetadataRegistry,
    _service: PhantomData<fn() -> S>,
}

impl<'r, S: Service> Annotate<'r, S> {
    pub(crate) fn new(registry: &'r mut MetadataRegistry) -> Self {
        Self {
            registry,
            _service: PhantomData,
        }
    }

    /// Current record of `S`.
    pub fn metadata(&self) -> Metadata {
        self.registry.metadata_of(TypeId::of::<S>())
    }

    fn merge(&mut self, patch: MetadataPatch) -> &mut Self {
        self.registry.annotate(TypeId::of::<S>(), patch);
        self
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.merge(MetadataPatch {
            name: Some(name.into()),
            ..Default::default()
        })
    }

    /// Position in multi-target invocation. See [`super::order`].
    pub fn order(&mut self, order: i32) -> &mut Self {
        self.merge(MetadataPatch {
            order: Some(order),
            ..Default::default()
        })
    }

    /// Bind the property `key` so that changes are reported.
    pub fn observable(&mut self, key: impl Into<String>) -> &mut Self {
        let mut observables = self.metadata().observables;
        observables.push(key.into());
        self.merge(MetadataPatch {
            observables: Some(observables),
            ..Default::default()
        })
    }

    /// Include the property `key` in snapshots.
    pub fn persisted(&mut self, key: impl Into<String>) -> &mut Self {
        let mut persisted = self.metadata().persisted;
        persisted.push(key.into());
        self.merge(MetadataPatch {
            persisted: Some(persisted),
            ..Default::default()
        })
    }

    /// Resolve `field` to the `T` singleton at build time.
    pub fn wired<T: Service>(
        &mut self,
        key: impl Into<String>,
        field: fn(&S) -> &Wired<T>,
    ) -> &mut Self {
        let key = key.into();
        let field_key = key.clone();
        let resolve = move |owner: &Instance, target: &Instance| -> Result<()> {
            let owner = downcast::<S>(Arc::clone(owner))?;
            let target = downcast::<T>(Arc::clone(target))?;
            if !field(&owner).resolve(Arc::downgrade(&target)) {
                return Err(Error::configuration(format!(
                    "wired field `{}` of {} resolved twice",
                    field_key,
                    short_type_name::<S>()
                )));
            }
            Ok(())
        };

        let mut wired = self.metadata().wired;
        wired.push(WiredEntry {
            key,
            target: TypeId::of::<T>(),
            target_name: short_type_name::<T>(),
            resolve: Installer(Arc::new(resolve)),
        });
        self.merge(MetadataPatch {
            wired: Some(wired),
            ..Default::default()
        })
    }

    /// Debounce `method` behind `field`.
    pub fn debounced<A, R, F>(
        &mut self,
        key: impl Into<String>,
        wait: Duration,
        options: DebounceOptions,
        field: fn(&S) -> &RateLimited<A, R>,
        method: F,
    ) -> &mut Self
    where
        A: Send + 'static,
        R: Clone + Send + 'static,
        F: Fn(&S, A) -> R + Send + Sync + 'static,
    {
        self.rate_limit(key.into(), Limit::Debounce(wait, options), field, Some(method))
    }

    /// Debounce whatever an earlier annotation installed in `field`.
    ///
    /// Throttles install before debounces, so this stacks a debounce on a
    /// [`throttled`](Self::throttled) or another debounce of the same slot.
    pub fn debounced_over<A, R>(
        &mut self,
        key: impl Into<String>,
        wait: Duration,
        options: DebounceOptions,
        field: fn(&S) -> &RateLimited<A, R>,
    ) -> &mut Self
    where
        A: Send + 'static,
        R: Clone + Send + 'static,
    {
        self.rate_limit(
            key.into(),
            Limit::Debounce(wait, options),
            field,
            None::<fn(&S, A) -> R>,
        )
    }

    /// Debounce firing on the leading edge only.
    pub fn leading<A, R, F>(
        &mut self,
        key: impl Into<String>,
        wait: Duration,
        field: fn(&S) -> &RateLimited<A, R>,
        method: F,
    ) -> &mut Self
    where
        A: Send + 'static,
        R: Clone + Send + 'static,
        F: Fn(&S, A) -> R + Send + Sync + 'static,
    {
        self.debounced(key, wait, DebounceOptions::leading_only(), field, method)
    }

    /// Debounce firing on the trailing edge only.
    pub fn trailing<A, R, F>(
        &mut self,
        key: impl Into<String>,
        wait: Duration,
        field: fn(&S) -> &RateLimited<A, R>,
        method: F,
    ) -> &mut Self
    where
        A: Send + 'static,
        R: Clone + Send + 'static,
        F: Fn(&S, A) -> R + Send + Sync + 'static,
    {
        self.debounced(key, wait, DebounceOptions::trailing_only(), field, method)
    }

    /// Throttle `method` behind `field`.
    pub fn throttled<A, R, F>(
        &mut self,
        key: impl Into<String>,
        wait: Duration,
        options: ThrottleOptions,
        field: fn(&S) -> &RateLimited<A, R>,
        method: F,
    ) -> &mut Self
    where
        A: Send + 'static,
        R: Clone + Send + 'static,
        F: Fn(&S, A) -> R + Send + Sync + 'static,
    {
        self.rate_limit(key.into(), Limit::Throttle(wait, options), field, Some(method))
    }

    /// Throttle whatever an earlier throttle installed in `field`.
    pub fn throttled_over<A, R>(
        &mut self,
        key: impl Into<String>,
        wait: Duration,
        options: ThrottleOptions,
        field: fn(&S) -> &RateLimited<A, R>,
    ) -> &mut Self
    where
        A: Send + 'static,
        R: Clone + Send + 'static,
    {
        self.rate_limit(
            key.into(),
            Limit::Throttle(wait, options),
            field,
            None::<fn(&S, A) -> R>,
        )
    }

    fn rate_limit<A, R, F>(
        &mut self,
        key: String,
        limit: Limit,
        field: fn(&S) -> &RateLimited<A, R>,
        method: Option<F>,
    ) -> &mut Self
    where
        A: Send + 'static,
        R: Clone + Send + 'static,
        F: Fn(&S, A) -> R + Send + Sync + 'static,
    {
        let install = rate_limit_installer(key.clone(), limit, field, method);
        let mut patch = MetadataPatch::default();
        match limit {
            Limit::Debounce(wait, options) => {
                let mut debounced = self.metadata().debounce_functions;
                debounced.push(RateLimitEntry {
                    key,
                    wait,
                    options,
                    install,
                });
                patch.debounce_functions = Some(debounced);
            }
            Limit::Throttle(wait, options) => {
                let mut throttled = self.metadata().throttle_functions;
                throttled.push(RateLimitEntry {
                    key,
                    wait,
                    options,
                    install,
                });
                patch.throttle_functions = Some(throttled);
            }
        }
        self.merge(patch)
    }

    /// Run `method` every `period`, controlled through `field`.
    ///
    /// The method receives the timestamp of the last `start()`. Returning
    /// `false` (or [`Repeat::Stop`]) ends the repeat chain.
    pub fn timer<T, F>(
        &mut self,
        key: impl Into<String>,
        period: Duration,
        options: TimerOptions,
        field: fn(&S) -> &Timer,
        method: F,
    ) -> &mut Self
    where
        T: Into<Repeat>,
        F: Fn(&S, DateTime<Utc>) -> T + Send + Sync + 'static,
    {
        let key = key.into();
        let method = Arc::new(method);
        let timer_options = options.clone();
        let field_key = key.clone();
        let install = move |instance: &Instance, label: String| -> Result<Arc<TimerTask>> {
            let service = downcast::<S>(Arc::clone(instance))?;
            let weak = Arc::downgrade(&service);
            let method = Arc::clone(&method);
            let task = TimerTask::new(label, period, timer_options.clone(), move |started| {
                match weak.upgrade() {
                    Some(service) => method(&service, started).into(),
                    None => Repeat::Stop,
                }
            });
            if !field(&service).install(Arc::clone(&task)) {
                return Err(Error::configuration(format!(
                    "timer `{}` of {} installed twice",
                    field_key,
                    short_type_name::<S>()
                )));
            }
            Ok(task)
        };

        let mut timers = self.metadata().timers;
        timers.push(TimerEntry {
            key,
            period,
            options,
            install: Installer(Arc::new(install)),
        });
        self.merge(MetadataPatch {
            timers: Some(timers),
            ..Default::default()
        })
    }

    /// Run `method` whenever the bound property `property` changes, before
    /// the change is dispatched.
    pub fn trigger<F>(
        &mut self,
        property: impl Into<String>,
        method_name: impl Into<String>,
        method: F,
    ) -> &mut Self
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        let method = Arc::new(method);
        let build = move |instance: &Instance| -> Result<Box<dyn Fn() + Send + Sync>> {
            let weak = Arc::downgrade(&downcast::<S>(Arc::clone(instance))?);
            let method = Arc::clone(&method);
            Ok(Box::new(move || {
                if let Some(service) = weak.upgrade() {
                    method(&service);
                }
            }))
        };

        let mut triggers: BTreeMap<String, Vec<TriggerEntry>> = self.metadata().triggers;
        triggers
            .entry(property.into())
            .or_default()
            .push(TriggerEntry {
                method: method_name.into(),
                build: Installer(Arc::new(build)),
            });
        self.merge(MetadataPatch {
            triggers: Some(triggers),
            ..Default::default()
        })
    }

    /// Declare that `S` handles hook `H`.
    pub fn handles<H: Hook>(&mut self) -> &mut Self
    where
        S: Handler<H>,
    {
        let mut handlers = self.metadata().handlers;
        if handlers.iter().any(|h| h.hook_type == TypeId::of::<H>()) {
            tracing::debug!(service = short_type_name::<S>(), hook = H::NAME, "hook already declared");
            return self;
        }

        let call: HookFn<H> = Arc::new(
            |instance: Instance, args: H::Args| -> BoxFuture<'static, Result<H::Output>> {
                Box::pin(async move {
                    let service = downcast::<S>(instance)?;
                    <S as Handler<H>>::handle(&service, args).await
                })
            },
        );
        handlers.push(HandlerEntry {
            hook: H::NAME,
            hook_type: TypeId::of::<H>(),
            call: Arc::new(call),
        });
        self.merge(MetadataPatch {
            handlers: Some(handlers),
            ..Default::default()
        })
    }

    /// Subscribe `S` to the container broadcast channel.
    pub fn receives_messages(&mut self) -> &mut Self
    where
        S: MessageReceiver,
    {
        let subscribe = |instance: &Instance| -> Result<Listener<Message>> {
            let weak = Arc::downgrade(&downcast::<S>(Arc::clone(instance))?);
            let listener: Listener<Message> = Arc::new(move |message: &Message| {
                if let Some(service) = weak.upgrade() {
                    service.message_received(message);
                }
            });
            Ok(listener)
        };
        self.merge(MetadataPatch {
            message_receiver: Some(MessageEntry {
                subscribe: Installer(Arc::new(subscribe)),
            }),
            ..Default::default()
        })
    }
}

/// Installer filling `field` with a wrapper around `method`, or around the
/// wrapper already in `field` when `method` is `None`.
fn rate_limit_installer<S, A, R, F>(
    key: String,
    limit: Limit,
    field: fn(&S) -> &RateLimited<A, R>,
    method: Option<F>,
) -> Installer<super::InstallFn>
where
    S: Service,
    A: Send + 'static,
    R: Clone + Send + 'static,
    F: Fn(&S, A) -> R + Send + Sync + 'static,
{
    let method = method.map(Arc::new);
    let install = move |instance: &Instance| -> Result<()> {
        let service = downcast::<S>(Arc::clone(instance))?;
        let slot = field(&service);
        let wrapper = match (slot.current(), &method) {
            (Some(_), Some(_)) => {
                return Err(Error::configuration(format!(
                    "`{}::{key}` already holds a rate-limited method; stack with an `_over` annotation",
                    short_type_name::<S>()
                )))
            }
            (None, None) => {
                return Err(Error::configuration(format!(
                    "`{}::{key}` has no method to wrap; annotate it with a method first",
                    short_type_name::<S>()
                )))
            }
            (Some(inner), None) => limit.wrap(move |args: A| inner.call(args).flatten()),
            (None, Some(method)) => {
                let weak = Arc::downgrade(&service);
                let method = Arc::clone(method);
                limit.wrap(move |args: A| weak.upgrade().map(|service| method(&service, args)))
            }
        };
        slot.install(wrapper);
        Ok(())
    };
    Installer(Arc::new(install))
}

impl Limit {
    fn wrap<A, R, F>(self, func: F) -> Debounced<A, Option<R>>
    where
        A: Send + 'static,
        R: Clone + Send + 'static,
        F: Fn(A) -> Option<R> + Send + Sync + 'static,
    {
        match self {
            Limit::Debounce(wait, options) => debounce(func, wait, options),
            Limit::Throttle(wait, options) => throttle(func, wait, options),
        }
    }
}

impl<S> std::fmt::Debug for Annotate<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Annotate")
            .field("service", &short_type_name::<S>())
            .finish()
    }
}
