//! Blocking boolean flag with wakeup-on-touch semantics
//!
//! Every `raise`/`lower` call counts as a touch, even when the value does
//! not change (a "waver"). Threads blocked in [`Flag::wait_touch`] wake on
//! any touch; threads in [`Flag::wait_up`]/[`Flag::wait_down`] wake only
//! once the value matches.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Longest single sleep of a cancellable wait before the cancel flag is re-checked
pub const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Result of a wait that can also be cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited condition became true
    Raised,
    /// The timeout expired first
    TimedOut,
    /// The cancel flag went up first
    Cancelled,
}

#[derive(Debug)]
struct FlagState {
    up: bool,
    touches: u64,
}

/// A thread-safe boolean that threads can block on
#[derive(Debug)]
pub struct Flag {
    state: Mutex<FlagState>,
    changed: Condvar,
}

impl Default for Flag {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Flag {
    pub fn new(initially_up: bool) -> Self {
        Self {
            state: Mutex::new(FlagState {
                up: initially_up,
                touches: 0,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.state.lock().up
    }

    pub fn raise(&self) {
        self.set(true);
    }

    pub fn lower(&self) {
        self.set(false);
    }

    /// Set the value and wake every waiter, whether or not it changed
    pub fn set(&self, up: bool) {
        let mut state = self.state.lock();
        state.up = up;
        state.touches = state.touches.wrapping_add(1);
        self.changed.notify_all();
    }

    /// Number of touches so far; pair with [`Flag::wait_touch_after`]
    pub fn touches(&self) -> u64 {
        self.state.lock().touches
    }

    /// Block until the flag is up. Returns `false` on timeout.
    pub fn wait_up(&self, timeout: Option<Duration>) -> bool {
        self.wait_for(true, timeout)
    }

    /// Block until the flag is down. Returns `false` on timeout.
    pub fn wait_down(&self, timeout: Option<Duration>) -> bool {
        self.wait_for(false, timeout)
    }

    /// Block until the next touch. Returns `false` on timeout.
    pub fn wait_touch(&self, timeout: Option<Duration>) -> bool {
        let seen = self.touches();
        self.wait_touch_after(seen, timeout)
    }

    /// Block until the touch count moves past `seen`
    pub fn wait_touch_after(&self, seen: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while state.touches == seen {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return state.touches != seen;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        true
    }

    /// Like [`Flag::wait_up`] but gives up as soon as `cancel` is raised
    ///
    /// The cancel flag is checked at least every [`CANCEL_POLL`].
    pub fn wait_up_unless(&self, cancel: &Flag, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if cancel.is_up() {
                return WaitOutcome::Cancelled;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return if self.is_up() {
                            WaitOutcome::Raised
                        } else {
                            WaitOutcome::TimedOut
                        };
                    }
                    (deadline - now).min(CANCEL_POLL)
                }
                None => CANCEL_POLL,
            };
            if self.wait_up(Some(slice)) {
                return WaitOutcome::Raised;
            }
        }
    }

    fn wait_for(&self, want: bool, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while state.up != want {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return state.up == want;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        true
    }
}
