//! Latest-value cell that threads can wait on
//!
//! Each update bumps a generation counter. A waiter asks for a value
//! strictly newer than the last generation it saw; intermediate updates it
//! slept through are not queued, only the latest one is returned.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Slot<T> {
    value: Option<T>,
    generation: u64,
}

pub struct WatchBox<T> {
    slot: Mutex<Slot<T>>,
    updated: Condvar,
}

impl<T: Clone> Default for WatchBox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> WatchBox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                generation: 0,
            }),
            updated: Condvar::new(),
        }
    }

    /// Store a new value and wake all waiters. Returns its generation.
    pub fn set(&self, value: T) -> u64 {
        let mut slot = self.slot.lock();
        slot.value = Some(value);
        slot.generation += 1;
        self.updated.notify_all();
        slot.generation
    }

    pub fn latest(&self) -> Option<T> {
        self.slot.lock().value.clone()
    }

    pub fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    /// Wait for a value newer than generation `seen`
    pub fn wait_after(&self, seen: u64, timeout: Option<Duration>) -> Option<(u64, T)> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.slot.lock();
        while slot.generation <= seen {
            match deadline {
                Some(deadline) => {
                    if self.updated.wait_until(&mut slot, deadline).timed_out()
                        && slot.generation <= seen
                    {
                        return None;
                    }
                }
                None => self.updated.wait(&mut slot),
            }
        }
        slot.value.clone().map(|v| (slot.generation, v))
    }

    /// A cursor that starts at the current generation
    pub fn watch(self: &Arc<Self>) -> Watcher<T> {
        Watcher {
            seen: self.generation(),
            watchbox: self.clone(),
        }
    }
}

/// Per-caller view of a [`WatchBox`] remembering the last generation seen
pub struct Watcher<T> {
    watchbox: Arc<WatchBox<T>>,
    seen: u64,
}

impl<T: Clone> Watcher<T> {
    /// Next value posted after the one this watcher last returned
    pub fn wait_next(&mut self, timeout: Option<Duration>) -> Option<T> {
        let (generation, value) = self.watchbox.wait_after(self.seen, timeout)?;
        self.seen = generation;
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_latest_and_generation() {
        let wb = WatchBox::new();
        assert_eq!(wb.latest(), None);
        assert_eq!(wb.set(3), 1);
        assert_eq!(wb.set(4), 2);
        assert_eq!(wb.latest(), Some(4));
    }

    #[test]
    fn test_wait_times_out_without_update() {
        let wb: Arc<WatchBox<u8>> = Arc::new(WatchBox::new());
        wb.set(1);
        let mut watcher = wb.watch();
        assert_eq!(watcher.wait_next(Some(Duration::from_millis(20))), None);
    }

    #[test]
    fn test_two_watchers_see_same_update() {
        let wb = Arc::new(WatchBox::new());
        let mut a = wb.watch();
        let mut b = wb.watch();
        let handle = {
            let wb = wb.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                wb.set("fix");
            })
        };
        assert_eq!(a.wait_next(Some(Duration::from_secs(5))), Some("fix"));
        assert_eq!(b.wait_next(Some(Duration::from_secs(5))), Some("fix"));
        handle.join().unwrap();
    }

    #[test]
    fn test_missed_updates_collapse_to_latest() {
        let wb = Arc::new(WatchBox::new());
        let mut watcher = wb.watch();
        wb.set(1);
        wb.set(2);
        wb.set(3);
        assert_eq!(watcher.wait_next(Some(Duration::from_millis(10))), Some(3));
        assert_eq!(watcher.wait_next(Some(Duration::from_millis(10))), None);
    }
}
