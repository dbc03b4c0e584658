//! Restartable single-shot timers
//!
//! Used for the three timeout classes: stream keepalive, post-stop cooldown
//! and the auto-reset of motion/doorbell detection flags.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerState {
    /// Bumped on every arm/reset/cancel; a sleeping task only fires if its
    /// generation is still current.
    generation: u64,
    callback: Option<TimerCallback>,
    task: Option<JoinHandle<()>>,
    deadline: Option<Instant>,
}

/// Single-shot timer with at most one pending fire
///
/// The callback runs on the tokio runtime while the timer's internal lock is
/// held, so it must not call back into the same timer. Dropping the timer
/// cancels any pending fire.
pub struct Timer {
    label: &'static str,
    state: Arc<Mutex<TimerState>>,
}

impl Timer {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            state: Arc::new(Mutex::new(TimerState {
                generation: 0,
                callback: None,
                task: None,
                deadline: None,
            })),
        }
    }

    /// Schedule `on_fire` after `duration`, replacing any pending fire and
    /// any previously armed callback.
    pub fn arm<F>(&self, duration: Duration, on_fire: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        state.callback = Some(Arc::new(on_fire));
        Self::schedule(&self.state, &mut state, duration);
    }

    /// Cancel the pending fire and re-arm with the last callback.
    ///
    /// Returns `false` if the timer was never armed.
    pub fn reset(&self, duration: Duration) -> bool {
        let mut state = self.state.lock();
        if state.callback.is_none() {
            return false;
        }
        Self::schedule(&self.state, &mut state, duration);
        true
    }

    /// Cancel the pending fire, if any
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.deadline = None;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().deadline.is_some()
    }

    /// Instant at which the pending fire is due
    pub fn deadline(&self) -> Option<Instant> {
        self.state.lock().deadline
    }

    fn schedule(shared: &Arc<Mutex<TimerState>>, state: &mut TimerState, duration: Duration) {
        state.generation += 1;
        if let Some(task) = state.task.take() {
            task.abort();
        }

        let generation = state.generation;
        let deadline = Instant::now() + duration;
        state.deadline = Some(deadline);

        let weak: Weak<Mutex<TimerState>> = Arc::downgrade(shared);
        state.task = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;

            let Some(shared) = weak.upgrade() else {
                return;
            };
            let mut state = shared.lock();
            if state.generation != generation {
                return;
            }
            state.deadline = None;
            state.task = None;
            if let Some(callback) = state.callback.clone() {
                callback();
            }
        }));
        tracing::trace!("Timer armed for {:?}", duration);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
        tracing::trace!("Timer {} dropped", self.label);
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("label", &self.label)
            .field("pending", &self.is_pending())
            .finish()
    }
}

struct FlagState {
    value: bool,
    /// Incremented on every trigger; the timer only clears the flag for the
    /// trigger that armed it.
    epoch: u64,
}

/// Boolean detection flag that clears itself after a quiet period
///
/// Each trigger sets the flag and pushes the clear deadline out, so two
/// triggers 5s apart with a 30s window clear 30s after the second one.
pub struct AutoResetFlag {
    state: Arc<Mutex<FlagState>>,
    timer: Timer,
    on_change: Arc<dyn Fn(bool) + Send + Sync>,
}

impl AutoResetFlag {
    /// `on_change` is invoked whenever the flag flips
    pub fn new<F>(on_change: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(FlagState {
                value: false,
                epoch: 0,
            })),
            timer: Timer::new("auto-reset"),
            on_change: Arc::new(on_change),
        }
    }

    /// Set the flag and (re)start the clear countdown
    pub fn trigger(&self, reset_after: Duration) {
        let epoch = {
            let mut state = self.state.lock();
            state.epoch += 1;
            if !state.value {
                state.value = true;
                (self.on_change)(true);
            }
            state.epoch
        };

        let state = self.state.clone();
        let on_change = self.on_change.clone();
        self.timer.arm(reset_after, move || {
            let mut state = state.lock();
            if state.epoch == epoch && state.value {
                state.value = false;
                on_change(false);
            }
        });
    }

    /// Clear immediately and cancel the countdown
    pub fn clear(&self) {
        self.timer.cancel();
        let mut state = self.state.lock();
        state.epoch += 1;
        if state.value {
            state.value = false;
            (self.on_change)(false);
        }
    }

    pub fn get(&self) -> bool {
        self.state.lock().value
    }
}
