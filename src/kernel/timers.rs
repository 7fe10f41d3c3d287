//! Repeating timers attached to service methods.
//!
//! A [`TimerTask`] owns one callback and re-arms it every `period` until it is
//! stopped, its firing budget (`count`) is spent, or the callback asks to stop
//! by returning [`Repeat::Stop`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Timer annotation options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerOptions {
    /// Do not start automatically at registration.
    pub stopped: bool,
    /// Display name used in logs.
    pub name: Option<String>,
    /// Maximum number of invocations per start.
    pub count: Option<u32>,
    /// `start()` on a running timer is a no-op instead of a restart.
    pub single: bool,
}

/// What a timer callback wants after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Continue,
    Stop,
}

impl From<()> for Repeat {
    fn from(_: ()) -> Self {
        Repeat::Continue
    }
}

impl From<bool> for Repeat {
    fn from(keep_going: bool) -> Self {
        if keep_going {
            Repeat::Continue
        } else {
            Repeat::Stop
        }
    }
}

type TimerCallback = Box<dyn Fn(DateTime<Utc>) -> Repeat + Send + Sync>;

#[derive(Debug)]
struct TimerState {
    /// Set from `start()` until `stop()`, including after the callback ended the chain.
    armed: bool,
    cancel: Option<CancellationToken>,
    generation: u64,
    fired: u32,
    started_at: DateTime<Utc>,
}

/// Repeating timer state machine.
pub struct TimerTask {
    this: Weak<TimerTask>,
    label: String,
    period: Duration,
    options: TimerOptions,
    callback: TimerCallback,
    state: Mutex<TimerState>,
}

impl TimerTask {
    /// Create a stopped timer.
    pub fn new<F, T>(
        label: impl Into<String>,
        period: Duration,
        options: TimerOptions,
        callback: F,
    ) -> Arc<Self>
    where
        F: Fn(DateTime<Utc>) -> T + Send + Sync + 'static,
        T: Into<Repeat>,
    {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            label: label.into(),
            period,
            options,
            callback: Box::new(move |started_at| callback(started_at).into()),
            state: Mutex::new(TimerState {
                armed: false,
                cancel: None,
                generation: 0,
                fired: 0,
                started_at: Utc::now(),
            }),
        })
    }

    /// Start the timer. A running timer is restarted, unless `single` is set.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.armed {
            if self.options.single {
                tracing::trace!(timer = %self.label, "start ignored, single timer already running");
                return;
            }
            Self::stop_locked(&mut state);
        }
        state.started_at = Utc::now();
        state.fired = 0;
        state.armed = true;
        self.arm(&mut state);
        tracing::debug!(timer = %self.label, period_ms = self.period.as_millis() as u64, "timer started");
    }

    /// Cancel the scheduled firing and reset the counter.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        Self::stop_locked(&mut state);
        tracing::debug!(timer = %self.label, "timer stopped");
    }

    /// Whether the timer was started and not stopped since.
    pub fn is_running(&self) -> bool {
        self.state.lock().armed
    }

    /// Number of firings counted since the last start.
    pub fn fired(&self) -> u32 {
        self.state.lock().fired
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn options(&self) -> &TimerOptions {
        &self.options
    }

    fn stop_locked(state: &mut TimerState) {
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        state.generation += 1;
        state.armed = false;
        state.fired = 0;
    }

    fn arm(&self, state: &mut TimerState) {
        state.generation += 1;
        let generation = state.generation;
        let cancel = CancellationToken::new();
        state.cancel = Some(cancel.clone());

        let period = self.period;
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(period) => {
                    if let Some(timer) = this.upgrade() {
                        timer.fire(generation);
                    }
                }
            }
        });
    }

    fn fire(&self, generation: u64) {
        let started_at = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.cancel = None;
            if let Some(limit) = self.options.count {
                state.fired += 1;
                if state.fired > limit {
                    Self::stop_locked(&mut state);
                    tracing::debug!(timer = %self.label, limit, "timer reached its count");
                    return;
                }
            }
            state.started_at
        };

        let repeat = (self.callback)(started_at);

        let mut state = self.state.lock();
        // Stopped or restarted from inside the callback.
        if state.generation != generation {
            return;
        }
        match repeat {
            Repeat::Continue => self.arm(&mut state),
            Repeat::Stop => {
                tracing::debug!(timer = %self.label, "timer callback ended the repeat chain");
            }
        }
    }
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        if let Some(cancel) = self.state.get_mut().cancel.take() {
            cancel.cancel();
        }
    }
}

impl fmt::Debug for TimerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerTask")
            .field("label", &self.label)
            .field("period", &self.period)
            .field("options", &self.options)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::sleep;

    fn counting(options: TimerOptions) -> (Arc<AtomicU32>, Arc<TimerTask>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let timer = TimerTask::new("test", Duration::from_millis(50), options, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Repeat::Continue
        });
        (calls, timer)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_repeats_every_period() {
        let (calls, timer) = counting(TimerOptions::default());
        timer.start();

        sleep(Duration::from_millis(175)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(timer.is_running());

        timer.stop();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!timer.is_running());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_count_limit_then_restart() {
        let (calls, timer) = counting(TimerOptions {
            count: Some(2),
            ..TimerOptions::default()
        });
        timer.start();

        sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!timer.is_running());

        timer.start();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_returning_false_ends_chain_but_stays_armed() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let timer = TimerTask::new(
            "once",
            Duration::from_millis(50),
            TimerOptions {
                single: true,
                ..TimerOptions::default()
            },
            move |_| Repeat::from(counter.fetch_add(1, Ordering::SeqCst) + 1 < 2),
        );
        timer.start();

        sleep(Duration::from_millis(400)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(timer.is_running());

        // Still armed, so a single timer ignores start until stopped.
        timer.start();
        sleep(Duration::from_millis(400)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        timer.stop();
        timer.start();
        sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_restart_resets_schedule() {
        let (calls, timer) = counting(TimerOptions::default());
        timer.start();
        sleep(Duration::from_millis(40)).await;
        timer.start();
        sleep(Duration::from_millis(40)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_callback_receives_start_timestamp() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let timer = TimerTask::new(
            "stamp",
            Duration::from_millis(10),
            TimerOptions {
                count: Some(3),
                ..TimerOptions::default()
            },
            move |started| sink.lock().push(started),
        );
        timer.start();
        sleep(Duration::from_millis(100)).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|s| *s == seen[0]));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_dropped_timer_stops_firing() {
        let (calls, timer) = counting(TimerOptions::default());
        timer.start();
        drop(timer);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
