//! Roaming debouncer (C7).
//!
//! Coalesces topology-change signals into at most one listener call per
//! 100 ms window (§4.7). The actual delayed execution is delegated to an
//! injected `Scheduler`, so the debounce logic itself — the part spec.md
//! §8 wants property-tested — runs independent of a real OS timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const ROAM_DELAY: Duration = Duration::from_millis(100);

/// A delayed-execution facility, standing in for the spec's external "job
/// scheduler with delayed execution." Implementations must guarantee the
/// job runs after at least `delay` has elapsed, but may run it from any
/// thread.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, job: Box<dyn FnOnce() + Send>);
}

/// Schedules jobs on a detached `std::thread`, sleeping for `delay` before
/// running. This is the crate's real-world `Scheduler`; tests use a fake
/// that runs jobs inline to make debounce assertions deterministic.
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, job: Box<dyn FnOnce() + Send>) {
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            job();
        });
    }
}

pub struct Debouncer {
    scheduler: Arc<dyn Scheduler>,
    listener: Arc<dyn Fn(bool) + Send + Sync>,
    state: Mutex<DebounceState>,
}

struct DebounceState {
    last_roam: Option<Instant>,
}

impl Debouncer {
    pub fn new(scheduler: Arc<dyn Scheduler>, listener: Arc<dyn Fn(bool) + Send + Sync>) -> Self {
        Self {
            scheduler,
            listener,
            state: Mutex::new(DebounceState { last_roam: None }),
        }
    }

    /// §4.7: if `now` is strictly after the stored deadline, schedule one
    /// listener call `ROAM_DELAY` from now and push the deadline out;
    /// otherwise this call is a no-op. `now` is threaded in (rather than
    /// read from the clock here) so tests can drive the window boundary
    /// exactly.
    pub fn fire_roam(&self, now: Instant, address_changed: bool) {
        let mut st = self.state.lock().unwrap();
        let should_fire = match st.last_roam {
            Some(deadline) => now > deadline,
            None => true,
        };
        if !should_fire {
            return;
        }
        st.last_roam = Some(now + ROAM_DELAY);
        drop(st);

        let listener = Arc::clone(&self.listener);
        self.scheduler.schedule(
            ROAM_DELAY,
            Box::new(move || {
                listener(address_changed);
            }),
        );
    }
}

/// A fake scheduler that runs every job synchronously and inline, used to
/// make debounce-window tests deterministic without sleeping.
#[cfg(test)]
pub struct ImmediateScheduler;

#[cfg(test)]
impl ImmediateScheduler {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(test)]
impl Scheduler for ImmediateScheduler {
    fn schedule(&self, _delay: Duration, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn n_calls_within_one_window_fire_exactly_once() {
        let scheduler = Arc::new(ImmediateScheduler::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let last_bool = Arc::new(AtomicBool::new(false));
        let (c, b) = (Arc::clone(&calls), Arc::clone(&last_bool));
        let listener: Arc<dyn Fn(bool) + Send + Sync> = Arc::new(move |changed: bool| {
            c.fetch_add(1, Ordering::SeqCst);
            b.store(changed, Ordering::SeqCst);
        });
        let debouncer = Debouncer::new(scheduler, listener);

        let t0 = Instant::now();
        debouncer.fire_roam(t0, true);
        debouncer.fire_roam(t0 + Duration::from_millis(1), false);
        debouncer.fire_roam(t0 + Duration::from_millis(2), false);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(last_bool.load(Ordering::SeqCst), "first call's bool wins");
    }

    #[test]
    fn calls_across_n_windows_fire_n_times() {
        let scheduler = Arc::new(ImmediateScheduler::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let listener: Arc<dyn Fn(bool) + Send + Sync> = Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let debouncer = Debouncer::new(scheduler, listener);

        let t0 = Instant::now();
        // Spaced well beyond ROAM_DELAY so each call lands strictly after
        // the previous call's deadline.
        for i in 0..5u32 {
            debouncer.fire_roam(t0 + ROAM_DELAY * 3 * i, true);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
