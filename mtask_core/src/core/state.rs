use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Component lifecycle states
///
/// ```text
/// Constructed -> Initializing -> Ready <-> Active
///                      |           \        /
///                      |            Finishing -> Finished
///                      +--(startup failure)-----> Finished
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ComponentState {
    Constructed = 0,
    Initializing = 1,
    Ready = 2,
    Active = 3,
    Finishing = 4,
    Finished = 5,
}

impl ComponentState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ComponentState::Constructed,
            1 => ComponentState::Initializing,
            2 => ComponentState::Ready,
            3 => ComponentState::Active,
            4 => ComponentState::Finishing,
            _ => ComponentState::Finished,
        }
    }

    /// Producers must not enqueue anything into a component in these states
    pub fn is_closing(&self) -> bool {
        matches!(self, ComponentState::Finishing | ComponentState::Finished)
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentState::Constructed => write!(f, "Constructed"),
            ComponentState::Initializing => write!(f, "Initializing"),
            ComponentState::Ready => write!(f, "Ready"),
            ComponentState::Active => write!(f, "Active"),
            ComponentState::Finishing => write!(f, "Finishing"),
            ComponentState::Finished => write!(f, "Finished"),
        }
    }
}

/// Lifecycle state shared between a component handle, its thread and the
/// threads waiting on it.
///
/// Reads are a single atomic load. Transitions take the mutex so that waiters
/// blocked in [`StateCell::wait_for`] observe every change.
pub struct StateCell {
    state: AtomicU8,
    failed: AtomicBool,
    failure: Mutex<Option<String>>,
    guard: Mutex<()>,
    changed: Condvar,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ComponentState::Constructed as u8),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
            guard: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    #[inline]
    pub fn get(&self) -> ComponentState {
        ComponentState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; returns false if the current state is not `from`.
    pub fn transition(&self, from: ComponentState, to: ComponentState) -> bool {
        let _guard = self.guard.lock();
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.changed.notify_all();
        }
        swapped
    }

    /// Request `Finishing` from any state except `Finishing`/`Finished`.
    ///
    /// Returns the state the component was in, or `None` if it was already closing.
    pub fn begin_finishing(&self) -> Option<ComponentState> {
        let _guard = self.guard.lock();
        let current = self.get();
        if current.is_closing() {
            return None;
        }
        self.state
            .store(ComponentState::Finishing as u8, Ordering::Release);
        self.changed.notify_all();
        Some(current)
    }

    /// Enter the terminal state. Returns false if it was already reached.
    pub fn finish(&self) -> bool {
        let _guard = self.guard.lock();
        let previous = self
            .state
            .swap(ComponentState::Finished as u8, Ordering::AcqRel);
        self.changed.notify_all();
        previous != ComponentState::Finished as u8
    }

    /// Record a startup failure. The component still has to be moved to Finished.
    pub fn mark_failed(&self, reason: String) {
        *self.failure.lock() = Some(reason);
        self.failed.store(true, Ordering::Release);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Block until `target` is reached or `timeout` elapses.
    ///
    /// Returns early with `false` when the component reaches Finished and
    /// `target` is some other state, since Finished is irreversible.
    pub fn wait_for(&self, target: ComponentState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.wait_until(target, deadline)
    }

    pub fn wait_until(&self, target: ComponentState, deadline: Instant) -> bool {
        let mut guard = self.guard.lock();
        loop {
            let current = self.get();
            if current == target {
                return true;
            }
            if current == ComponentState::Finished {
                return false;
            }
            if self.changed.wait_until(&mut guard, deadline).timed_out() {
                return self.get() == target;
            }
        }
    }

    /// Wake every waiter (used by the run loop to interrupt period sleeps).
    pub fn notify(&self) {
        let _guard = self.guard.lock();
        self.changed.notify_all();
    }

    /// Sleep until `deadline` unless the state changes first.
    pub fn sleep_until(&self, deadline: Instant, while_in: ComponentState) {
        let mut guard = self.guard.lock();
        while self.get() == while_in {
            if self.changed.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("state", &self.get())
            .field("failed", &self.has_failed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_transition_requires_expected_state() {
        let cell = StateCell::new();
        assert!(!cell.transition(ComponentState::Ready, ComponentState::Active));
        assert!(cell.transition(ComponentState::Constructed, ComponentState::Initializing));
        assert_eq!(cell.get(), ComponentState::Initializing);
    }

    #[test]
    fn test_finishing_only_once() {
        let cell = StateCell::new();
        assert_eq!(cell.begin_finishing(), Some(ComponentState::Constructed));
        assert_eq!(cell.begin_finishing(), None);
        assert!(cell.finish());
        assert!(!cell.finish());
        assert_eq!(cell.get(), ComponentState::Finished);
    }

    #[test]
    fn test_wait_for_wakes_on_transition() {
        let cell = Arc::new(StateCell::new());
        let other = cell.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            other.transition(ComponentState::Constructed, ComponentState::Initializing);
            other.transition(ComponentState::Initializing, ComponentState::Ready);
        });
        assert!(cell.wait_for(ComponentState::Ready, Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_for_times_out() {
        let cell = StateCell::new();
        let start = Instant::now();
        assert!(!cell.wait_for(ComponentState::Active, Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_for_gives_up_once_finished() {
        let cell = StateCell::new();
        cell.finish();
        let start = Instant::now();
        assert!(!cell.wait_for(ComponentState::Ready, Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_failure_flag() {
        let cell = StateCell::new();
        cell.mark_failed("no device".into());
        assert!(cell.has_failed());
        assert_eq!(cell.failure().as_deref(), Some("no device"));
    }
}
