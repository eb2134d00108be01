use std::thread;
use std::time::{Duration, Instant};

/// What a tick callback wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    After(Duration),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TickHandle(u64);

/// Periodic-timer registration in the style of a host application's timer
/// API: a callback runs once per interval and returns the delay until its
/// next run, or `Tick::Stop` to deregister itself.
pub trait Scheduler<'a> {
    fn register<F>(&mut self, callback: F, interval: Duration) -> TickHandle
    where
        F: FnMut() -> Tick + 'a;

    fn cancel(&mut self, handle: TickHandle) -> bool;
}

struct Entry<'a> {
    handle: TickHandle,
    due: Instant,
    callback: Box<dyn FnMut() -> Tick + 'a>,
}

/// Single-threaded cooperative scheduler. Callbacks never overlap; a slow
/// callback delays every other one.
#[derive(Default)]
pub struct TickLoop<'a> {
    next_id: u64,
    entries: Vec<Entry<'a>>,
}

impl<'a> TickLoop<'a> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.entries.iter().map(|entry| entry.due).min()
    }

    /// Runs every callback due at `now`, in registration order. Returns how
    /// many ran.
    pub fn run_due(&mut self, now: Instant) -> usize {
        let mut ran = 0;
        let mut idx = 0;
        while idx < self.entries.len() {
            if self.entries[idx].due > now {
                idx += 1;
                continue;
            }
            ran += 1;
            match (self.entries[idx].callback)() {
                Tick::After(delay) => {
                    self.entries[idx].due = now + delay;
                    idx += 1;
                }
                Tick::Stop => {
                    self.entries.remove(idx);
                }
            }
        }
        ran
    }

    /// Drives callbacks on the wall clock until none remain registered.
    pub fn run(&mut self) {
        while let Some(due) = self.next_due() {
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
            self.run_due(Instant::now());
        }
    }
}

impl<'a> Scheduler<'a> for TickLoop<'a> {
    fn register<F>(&mut self, callback: F, interval: Duration) -> TickHandle
    where
        F: FnMut() -> Tick + 'a,
    {
        self.next_id += 1;
        let handle = TickHandle(self.next_id);
        self.entries.push(Entry {
            handle,
            due: Instant::now() + interval,
            callback: Box::new(callback),
        });
        handle
    }

    fn cancel(&mut self, handle: TickHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.handle != handle);
        before != self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn callbacks_reschedule_until_stop() {
        let count = Cell::new(0);
        let mut ticks = TickLoop::new();
        ticks.register(
            || {
                count.set(count.get() + 1);
                if count.get() >= 3 {
                    Tick::Stop
                } else {
                    Tick::After(Duration::from_millis(1))
                }
            },
            Duration::ZERO,
        );
        ticks.run();
        assert_eq!(count.get(), 3);
        assert!(ticks.is_empty());
    }

    #[test]
    fn run_due_respects_returned_delay() {
        let count = Cell::new(0);
        let mut ticks = TickLoop::new();
        ticks.register(
            || {
                count.set(count.get() + 1);
                Tick::After(Duration::from_secs(5))
            },
            Duration::ZERO,
        );

        let start = Instant::now() + Duration::from_millis(1);
        assert_eq!(ticks.run_due(start), 1);
        assert_eq!(ticks.run_due(start + Duration::from_secs(1)), 0);
        assert_eq!(ticks.run_due(start + Duration::from_secs(5)), 1);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn cancel_removes_only_the_given_handle() {
        let mut ticks = TickLoop::new();
        let first = ticks.register(|| Tick::After(Duration::from_secs(1)), Duration::ZERO);
        let _second = ticks.register(|| Tick::After(Duration::from_secs(1)), Duration::ZERO);
        assert!(ticks.cancel(first));
        assert!(!ticks.cancel(first));
        assert_eq!(ticks.len(), 1);
    }
}
