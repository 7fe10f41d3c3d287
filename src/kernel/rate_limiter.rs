//! Rate limiting: debounce and throttle.
//!
//! [`debounce`] delays a function until calls have stopped arriving for `wait`,
//! optionally firing on the leading edge and optionally forcing a call every
//! `max_wait`. [`throttle`] is a debounce whose `max_wait` equals `wait`, which
//! caps invocations at one per window while keeping the edge options.
//!
//! Timers run as tokio tasks, so the wrapper must be called from inside a
//! tokio runtime. The wrapped function is never called with the internal
//! lock held; it may call back into its own wrapper.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Debounce configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceOptions {
    /// Invoke on the leading edge of the wait window.
    pub leading: bool,
    /// Invoke on the trailing edge of the wait window.
    pub trailing: bool,
    /// Longest time a pending call may be delayed. Clamped to at least `wait`.
    #[serde(with = "humantime_serde")]
    pub max_wait: Option<Duration>,
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self {
            leading: false,
            trailing: true,
            max_wait: None,
        }
    }
}

impl DebounceOptions {
    /// Fire on the leading edge only.
    pub fn leading_only() -> Self {
        Self {
            leading: true,
            trailing: false,
            max_wait: None,
        }
    }

    /// Fire on the trailing edge only (the default).
    pub fn trailing_only() -> Self {
        Self::default()
    }
}

/// Throttle configuration. Both edges are enabled by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleOptions {
    pub leading: bool,
    pub trailing: bool,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            leading: true,
            trailing: true,
        }
    }
}

// =============================================================================
// Debounced
// =============================================================================

#[derive(Debug)]
struct PendingTimer {
    generation: u64,
    cancel: CancellationToken,
}

struct State<A, R> {
    timer: Option<PendingTimer>,
    generation: u64,
    last_args: Option<A>,
    last_call: Option<Instant>,
    /// `None` until the first invocation, which makes the max-wait check pass.
    last_invoke: Option<Instant>,
    result: Option<R>,
}

struct Inner<A, R> {
    this: Weak<Inner<A, R>>,
    func: Box<dyn Fn(A) -> R + Send + Sync>,
    wait: Duration,
    max_wait: Option<Duration>,
    leading: bool,
    trailing: bool,
    state: Mutex<State<A, R>>,
}

/// Rate-limited wrapper returned by [`debounce`] and [`throttle`].
///
/// Cloning shares the same timer and bookkeeping.
pub struct Debounced<A, R> {
    inner: Arc<Inner<A, R>>,
}

/// Wrap `func` so it runs only after `wait` has elapsed without another call.
pub fn debounce<A, R, F>(func: F, wait: Duration, options: DebounceOptions) -> Debounced<A, R>
where
    F: Fn(A) -> R + Send + Sync + 'static,
    A: Send + 'static,
    R: Clone + Send + 'static,
{
    let max_wait = options.max_wait.map(|max| max.max(wait));
    Debounced {
        inner: Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            func: Box::new(func),
            wait,
            max_wait,
            leading: options.leading,
            trailing: options.trailing,
            state: Mutex::new(State {
                timer: None,
                generation: 0,
                last_args: None,
                last_call: None,
                last_invoke: None,
                result: None,
            }),
        }),
    }
}

/// Wrap `func` so it runs at most once per `wait`.
pub fn throttle<A, R, F>(func: F, wait: Duration, options: ThrottleOptions) -> Debounced<A, R>
where
    F: Fn(A) -> R + Send + Sync + 'static,
    A: Send + 'static,
    R: Clone + Send + 'static,
{
    debounce(
        func,
        wait,
        DebounceOptions {
            leading: options.leading,
            trailing: options.trailing,
            max_wait: Some(wait),
        },
    )
}

impl<A, R> Debounced<A, R>
where
    A: Send + 'static,
    R: Clone + Send + 'static,
{
    /// Record a call. Returns the result of the invocation this call caused,
    /// or the last result if it did not cause one.
    pub fn call(&self, args: A) -> Option<R> {
        let inner = &self.inner;
        let now = Instant::now();
        let mut state = inner.state.lock();
        let is_invoking = inner.should_invoke(&state, now);
        state.last_args = Some(args);
        state.last_call = Some(now);

        if is_invoking {
            if state.timer.is_none() {
                return inner.leading_edge(state, now);
            }
            if inner.max_wait.is_some() {
                // Tight loop: the max-wait deadline passed while calls kept arriving.
                inner.schedule(&mut state, inner.wait);
                return inner.invoke(state, now);
            }
        }
        if state.timer.is_none() {
            inner.schedule(&mut state, inner.wait);
        }
        state.result.clone()
    }

    /// Drop any pending invocation without running it.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.cancel.cancel();
        }
        state.last_invoke = None;
        state.last_args = None;
        state.last_call = None;
    }

    /// Run the pending trailing invocation now, if a timer is armed.
    /// Otherwise return the last result.
    pub fn flush(&self) -> Option<R> {
        let state = self.inner.state.lock();
        if state.timer.is_none() {
            return state.result.clone();
        }
        self.inner.trailing_edge(state, Instant::now())
    }

    /// Whether a timer is currently armed.
    pub fn pending(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }

    /// Configured wait window.
    pub fn wait(&self) -> Duration {
        self.inner.wait
    }
}

impl<A, R> Inner<A, R>
where
    A: Send + 'static,
    R: Clone + Send + 'static,
{
    fn should_invoke(&self, state: &State<A, R>, now: Instant) -> bool {
        let Some(last_call) = state.last_call else {
            return true;
        };
        if now.duration_since(last_call) >= self.wait {
            return true;
        }
        match (self.max_wait, state.last_invoke) {
            (Some(_), None) => true,
            (Some(max_wait), Some(last_invoke)) => now.duration_since(last_invoke) >= max_wait,
            (None, _) => false,
        }
    }

    fn remaining_wait(&self, state: &State<A, R>, now: Instant) -> Duration {
        let since_call = state
            .last_call
            .map(|t| now.duration_since(t))
            .unwrap_or_default();
        let remaining = self.wait.saturating_sub(since_call);
        match (self.max_wait, state.last_invoke) {
            (Some(max_wait), Some(last_invoke)) => {
                remaining.min(max_wait.saturating_sub(now.duration_since(last_invoke)))
            }
            _ => remaining,
        }
    }

    fn leading_edge(&self, mut state: MutexGuard<'_, State<A, R>>, now: Instant) -> Option<R> {
        state.last_invoke = Some(now);
        self.schedule(&mut state, self.wait);
        if self.leading {
            self.invoke(state, now)
        } else {
            state.result.clone()
        }
    }

    fn trailing_edge(&self, mut state: MutexGuard<'_, State<A, R>>, now: Instant) -> Option<R> {
        if let Some(timer) = state.timer.take() {
            timer.cancel.cancel();
        }
        if self.trailing && state.last_args.is_some() {
            return self.invoke(state, now);
        }
        state.last_args = None;
        state.result.clone()
    }

    /// Release the lock, run the function with the latest arguments and store the result.
    fn invoke(&self, mut state: MutexGuard<'_, State<A, R>>, now: Instant) -> Option<R> {
        let Some(args) = state.last_args.take() else {
            return state.result.clone();
        };
        state.last_invoke = Some(now);
        drop(state);

        let result = (self.func)(args);
        self.state.lock().result = Some(result.clone());
        Some(result)
    }

    fn timer_expired(&self, generation: u64) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.timer.as_ref().map(|t| t.generation) != Some(generation) {
            return;
        }
        if self.should_invoke(&state, now) {
            self.trailing_edge(state, now);
            return;
        }
        let delay = self.remaining_wait(&state, now);
        state.timer = None;
        self.schedule(&mut state, delay);
    }

    /// Arm (or re-arm) the trailing timer. Any previously armed timer is cancelled.
    fn schedule(&self, state: &mut State<A, R>, delay: Duration) {
        if let Some(previous) = state.timer.take() {
            previous.cancel.cancel();
        }
        state.generation += 1;
        let generation = state.generation;
        let cancel = CancellationToken::new();
        state.timer = Some(PendingTimer {
            generation,
            cancel: cancel.clone(),
        });

        let inner = self.this.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.timer_expired(generation);
                    }
                }
            }
        });
    }
}

impl<A, R> Clone for Debounced<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, R> fmt::Debug for Debounced<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debounced")
            .field("wait", &self.inner.wait)
            .field("max_wait", &self.inner.max_wait)
            .field("leading", &self.inner.leading)
            .field("trailing", &self.inner.trailing)
            .finish()
    }
}
