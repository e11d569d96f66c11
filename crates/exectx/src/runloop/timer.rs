//! One-shot deadline timers
//!
//! A timer carries a task and an absolute deadline. Registering it on a
//! run loop schedules the task to fire at most once, when a `run` call
//! observes the deadline has passed. Invalidation before firing cancels
//! the task.

use super::runloop::LoopId;
use crate::task::SafeTask;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Unique identifier for a timer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TimerId {
    fn default() -> Self {
        Self::new()
    }
}

struct TimerState {
    /// Taken when the timer fires or is invalidated.
    callback: Option<SafeTask>,
    /// The loop this timer is registered on, if any.
    attached: Option<LoopId>,
}

pub(crate) struct TimerCore {
    id: TimerId,
    deadline: Instant,
    state: Mutex<TimerState>,
}

impl TimerCore {
    pub(crate) fn id(&self) -> TimerId {
        self.id
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.state.lock().callback.is_some()
    }

    /// Record the owning loop. A timer is single-shot and single-loop;
    /// re-registering it elsewhere is a usage error.
    pub(crate) fn bind(&self, loop_id: LoopId) {
        let mut state = self.state.lock();
        match state.attached {
            None => state.attached = Some(loop_id),
            Some(owner) if owner == loop_id => {}
            Some(_) => panic!("timer is already registered on another run loop"),
        }
    }

    /// Take the task for execution. Returns `None` if the timer already
    /// fired or was invalidated, which makes firing at-most-once even if
    /// two loops race.
    pub(crate) fn fire(&self) -> Option<SafeTask> {
        self.state.lock().callback.take()
    }

    pub(crate) fn invalidate(&self) {
        let mut state = self.state.lock();
        state.callback = None;
        state.attached = None;
    }
}

/// Public handle to a one-shot timer. Cloning yields another handle to
/// the same timer.
#[derive(Clone)]
pub struct RunLoopTimer {
    core: Arc<TimerCore>,
}

impl RunLoopTimer {
    /// Create a timer due `delay` from now.
    pub fn new(delay: Duration, task: impl FnOnce() + Send + 'static) -> Self {
        Self::at(Instant::now() + delay, task)
    }

    /// Create a timer due at an absolute instant.
    pub fn at(deadline: Instant, task: impl FnOnce() + Send + 'static) -> Self {
        Self {
            core: Arc::new(TimerCore {
                id: TimerId::new(),
                deadline,
                state: Mutex::new(TimerState {
                    callback: Some(Box::new(task)),
                    attached: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> TimerId {
        self.core.id()
    }

    pub fn deadline(&self) -> Instant {
        self.core.deadline()
    }

    pub fn is_valid(&self) -> bool {
        self.core.is_valid()
    }

    /// Cancel the timer. The task will not run after this returns.
    pub fn invalidate(&self) {
        self.core.invalidate();
    }

    pub(crate) fn core(&self) -> &Arc<TimerCore> {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_deadline_from_delay() {
        let before = Instant::now();
        let timer = RunLoopTimer::new(Duration::from_millis(100), || {});
        assert!(timer.deadline() >= before + Duration::from_millis(100));
        assert!(timer.deadline() <= Instant::now() + Duration::from_millis(100));
    }

    #[test]
    fn test_fires_at_most_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = RunLoopTimer::new(Duration::ZERO, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timer.is_valid());
        timer.core().fire().unwrap()();
        assert!(!timer.is_valid());
        assert!(timer.core().fire().is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidation_cancels_task() {
        let timer = RunLoopTimer::new(Duration::ZERO, || panic!("must not fire"));
        timer.invalidate();
        assert!(!timer.is_valid());
        assert!(timer.core().fire().is_none());
    }

    #[test]
    #[should_panic(expected = "already registered on another run loop")]
    fn test_rebinding_to_foreign_loop_panics() {
        let timer = RunLoopTimer::new(Duration::ZERO, || {});
        timer.core().bind(LoopId::new());
        timer.core().bind(LoopId::new());
    }
}
