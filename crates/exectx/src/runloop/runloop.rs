//! Cooperative run loop
//!
//! A run loop multiplexes three kinds of work on one thread: signaled
//! sources, expired one-shot timers, and a FIFO task queue wired to a
//! built-in source. `run` processes whatever is ready, then parks on a
//! condvar until a signal, a timer deadline, or a stop request arrives.
//!
//! Callbacks always execute with the loop lock released, so they may
//! freely add sources, timers, and tasks to the loop that is running
//! them, or run the loop recursively.

use super::source::{RunLoopSource, SourceCore, TASK_QUEUE_PRIORITY};
use super::timer::{RunLoopTimer, TimerCore};
use crate::queue::TaskQueue;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Unique identifier for a run loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LoopId(u64);

impl LoopId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Named mode a source is registered under; a `run` call only services
/// sources whose mode matches.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RunLoopMode(&'static str);

impl RunLoopMode {
    pub const DEFAULT: RunLoopMode = RunLoopMode("default");

    pub const fn named(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

/// Why a `run` call returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// At least one source or timer fired, or an explicit wakeup arrived.
    Woken,
    /// The timeout elapsed with nothing to do.
    TimedOut,
    /// `stop` was requested.
    Stopped,
    /// The loop has no sources, no timers, and no pending tasks, and is
    /// not protected; running it again would sleep forever.
    Idle,
}

struct SourceSlot {
    source: Arc<SourceCore>,
    mode: RunLoopMode,
}

/// Heap entry ordered soonest-deadline-first.
struct TimerEntry {
    deadline: Instant,
    timer: Arc<TimerCore>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap pops the nearest deadline first.
        other.deadline.cmp(&self.deadline)
    }
}

struct LoopState {
    /// Slot arena; freed slots are reused on the next registration.
    slots: Vec<Option<SourceSlot>>,
    timers: BinaryHeap<TimerEntry>,
    stopped: bool,
    /// Set by `notify`; cleared by the `run` iteration that observes it.
    woken: bool,
    /// Set when the registered timer/source set changed, so a parked run
    /// re-arms its deadline without reporting a wakeup.
    dirty: bool,
    /// A protected loop never reports `Idle`.
    protected: bool,
}

pub(crate) struct LoopCore {
    id: LoopId,
    queue: Arc<TaskQueue>,
    queue_source: Arc<SourceCore>,
    state: Mutex<LoopState>,
    wakeup: Condvar,
    /// Thread the loop is pinned to, once it has been made current.
    thread: Mutex<Option<ThreadId>>,
}

impl LoopCore {
    fn new() -> Arc<Self> {
        let queue = Arc::new(TaskQueue::new());
        Arc::new_cyclic(|weak: &Weak<LoopCore>| {
            let drain_queue = queue.clone();
            let drain_loop = weak.clone();
            let queue_source = SourceCore::new(
                TASK_QUEUE_PRIORITY,
                Arc::new(move || {
                    while let Some(task) = drain_queue.dequeue() {
                        task();
                    }
                    // A drained task may have enqueued more work; keep the
                    // signal alive so the next iteration drains it too.
                    if !drain_queue.is_empty() {
                        if let Some(core) = drain_loop.upgrade() {
                            core.queue_source.signal();
                        }
                    }
                }),
            );
            Self {
                id: LoopId::new(),
                queue,
                queue_source,
                state: Mutex::new(LoopState {
                    slots: Vec::new(),
                    timers: BinaryHeap::new(),
                    stopped: false,
                    woken: false,
                    dirty: false,
                    protected: false,
                }),
                wakeup: Condvar::new(),
                thread: Mutex::new(None),
            }
        })
    }

    pub(crate) fn id(&self) -> LoopId {
        self.id
    }

    /// Wake a parked `run` call. The flag is set before notifying so a
    /// wakeup that races the park is not lost.
    pub(crate) fn notify(&self) {
        {
            let mut state = self.state.lock();
            state.woken = true;
        }
        self.wakeup.notify_all();
    }

    /// Wake a parked `run` call only to recompute its park deadline; does
    /// not count as a wakeup.
    fn reposition(&self) {
        {
            let mut state = self.state.lock();
            state.dirty = true;
        }
        self.wakeup.notify_all();
    }

    pub(crate) fn remove_source_by_id(&self, id: super::source::SourceId) {
        let mut state = self.state.lock();
        for slot in state.slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.source.id() == id) {
                *slot = None;
            }
        }
    }
}

thread_local! {
    static CURRENT_LOOP: RefCell<Option<RunLoop>> = const { RefCell::new(None) };
}

static MAIN_LOOP: Lazy<RunLoop> = Lazy::new(RunLoop::new);

/// Handle to a run loop. Cloning yields another handle to the same loop;
/// handles compare equal when they refer to the same loop.
#[derive(Clone)]
pub struct RunLoop {
    core: Arc<LoopCore>,
}

impl fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoop").field("id", &self.core.id).finish()
    }
}

impl PartialEq for RunLoop {
    fn eq(&self, other: &Self) -> bool {
        self.core.id == other.core.id
    }
}

impl Eq for RunLoop {}

impl RunLoop {
    /// Create a loop not yet pinned to any thread.
    pub fn new() -> Self {
        let rl = Self {
            core: LoopCore::new(),
        };
        rl.core.queue_source.attach_loop(&rl.core);
        rl
    }

    /// The calling thread's loop, created and pinned on first use.
    pub fn current() -> Self {
        CURRENT_LOOP.with(|cell| {
            let mut slot = cell.borrow_mut();
            if let Some(rl) = slot.as_ref() {
                return rl.clone();
            }
            let rl = RunLoop::new();
            *rl.core.thread.lock() = Some(thread::current().id());
            *slot = Some(rl.clone());
            rl
        })
    }

    /// The calling thread's loop, if one has been created.
    pub fn try_current() -> Option<Self> {
        CURRENT_LOOP.with(|cell| cell.borrow().clone())
    }

    /// The process-wide main loop. It only runs once `main_proc` (or an
    /// explicit `run`) is called on the thread that adopted it.
    pub fn main() -> Self {
        MAIN_LOOP.clone()
    }

    /// Pin this loop to the calling thread and make it the thread's
    /// current loop.
    pub(crate) fn make_current(&self) {
        *self.core.thread.lock() = Some(thread::current().id());
        CURRENT_LOOP.with(|cell| {
            *cell.borrow_mut() = Some(self.clone());
        });
    }

    pub(crate) fn clear_current() {
        CURRENT_LOOP.with(|cell| {
            cell.borrow_mut().take();
        });
    }

    /// Whether the calling thread is the one this loop is pinned to.
    pub fn is_current(&self) -> bool {
        *self.core.thread.lock() == Some(thread::current().id())
    }

    pub fn id(&self) -> LoopId {
        self.core.id
    }

    /// A protected loop keeps `run` parked even with nothing registered,
    /// instead of reporting `Idle`.
    pub fn set_protected(&self, protected: bool) {
        self.core.state.lock().protected = protected;
    }

    pub fn is_protected(&self) -> bool {
        self.core.state.lock().protected
    }

    /// Register a source in `mode`. No-op for invalidated sources and for
    /// sources already registered on this loop in the same mode.
    pub fn add_source(&self, source: &RunLoopSource, mode: RunLoopMode) {
        let core = source.core();
        if !core.is_valid() {
            return;
        }
        {
            let mut state = self.core.state.lock();
            let already = state.slots.iter().any(|slot| {
                slot.as_ref()
                    .is_some_and(|s| s.source.id() == core.id() && s.mode == mode)
            });
            if !already {
                let slot = SourceSlot {
                    source: core.clone(),
                    mode,
                };
                match state.slots.iter_mut().find(|s| s.is_none()) {
                    Some(free) => *free = Some(slot),
                    None => state.slots.push(Some(slot)),
                }
            }
        }
        core.attach_loop(&self.core);
        // Checked only after the attach: a signal landing earlier is seen
        // here, one landing later notifies through the back-reference, so
        // no wakeup is lost either way.
        if core.is_signaled() {
            self.core.notify();
        }
    }

    /// Unregister a source from `mode` on this loop. The source stays
    /// attached while it remains registered in another mode.
    pub fn remove_source(&self, source: &RunLoopSource, mode: RunLoopMode) {
        let mut still_registered = false;
        {
            let mut state = self.core.state.lock();
            for slot in state.slots.iter_mut() {
                let Some(s) = slot.as_ref() else { continue };
                if s.source.id() != source.id() {
                    continue;
                }
                if s.mode == mode {
                    *slot = None;
                } else {
                    still_registered = true;
                }
            }
        }
        if !still_registered {
            source.core().detach_loop(self.core.id);
        }
    }

    /// Register a one-shot timer. Panics if the timer is already
    /// registered on a different loop; no-op if it already fired or was
    /// invalidated.
    pub fn add_timer(&self, timer: &RunLoopTimer) {
        let core = timer.core();
        if !core.is_valid() {
            return;
        }
        core.bind(self.core.id);
        {
            let mut state = self.core.state.lock();
            state.timers.push(TimerEntry {
                deadline: core.deadline(),
                timer: core.clone(),
            });
        }
        self.core.reposition();
    }

    /// Enqueue a task for execution on the loop's thread, in FIFO order
    /// with respect to other queued tasks.
    pub fn add_task(&self, task: impl FnOnce() + Send + 'static) {
        if self.core.queue.enqueue(Box::new(task)) {
            self.core.queue_source.signal();
        }
    }

    /// Request that the next (or current) `run` call return `Stopped`.
    /// The request is consumed by the run that observes it.
    pub fn stop(&self) {
        {
            let mut state = self.core.state.lock();
            state.stopped = true;
        }
        self.core.notify();
    }

    /// Wake a parked `run` call without any work attached; it returns
    /// `Woken`.
    pub fn wake_up(&self) {
        self.core.notify();
    }

    /// Run in the default mode. See [`RunLoop::run_in_mode`].
    pub fn run(&self, timeout: Option<Duration>) -> RunResult {
        self.run_in_mode(RunLoopMode::DEFAULT, timeout)
    }

    /// Process ready work, parking until something arrives or `timeout`
    /// elapses. Returns after the first batch of work, an explicit
    /// wakeup, a stop request, the timeout, or when the loop has nothing
    /// registered at all.
    pub fn run_in_mode(&self, mode: RunLoopMode, timeout: Option<Duration>) -> RunResult {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // Phase 1: snapshot ready work under the lock.
            let mut due: Vec<Arc<TimerCore>> = Vec::new();
            let mut candidates: Vec<Arc<SourceCore>> = Vec::new();
            let (woken, next_timer, idle_shape) = {
                let mut state = self.core.state.lock();
                if state.stopped {
                    // Consume the stop request together with its wakeup.
                    state.stopped = false;
                    state.woken = false;
                    return RunResult::Stopped;
                }
                state.dirty = false;

                let now = Instant::now();
                while let Some(entry) = state.timers.peek() {
                    if entry.deadline > now && entry.timer.is_valid() {
                        break;
                    }
                    // Expired or invalidated; invalidated entries are
                    // simply discarded.
                    if let Some(entry) = state.timers.pop() {
                        if entry.timer.is_valid() {
                            due.push(entry.timer);
                        }
                    }
                }

                for slot in state.slots.iter().flatten() {
                    if slot.mode == mode && slot.source.is_valid() {
                        candidates.push(slot.source.clone());
                    }
                }

                let woken = mem::take(&mut state.woken);
                let next_timer = state.timers.peek().map(|e| e.deadline);
                let idle_shape = !state.protected
                    && state.timers.is_empty()
                    && state.slots.iter().all(|s| s.is_none());
                (woken, next_timer, idle_shape)
            };

            // Phase 2: fire outside the lock. The built-in queue source
            // goes first, then user sources by descending priority, then
            // expired timers.
            let mut fired = false;
            if let Some(cb) = self.core.queue_source.take_if_signaled() {
                cb();
                fired = true;
            }
            candidates.sort_by_key(|s| std::cmp::Reverse(s.priority()));
            for source in candidates {
                if let Some(cb) = source.take_if_signaled() {
                    if source.is_valid() {
                        cb();
                        fired = true;
                    }
                }
            }
            for timer in due {
                if let Some(task) = timer.fire() {
                    task();
                    fired = true;
                }
            }

            if fired || woken {
                return RunResult::Woken;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return RunResult::TimedOut;
                }
            }
            if idle_shape && self.core.queue.is_empty() {
                return RunResult::Idle;
            }

            // Phase 3: park until a notify or the nearest deadline.
            let mut state = self.core.state.lock();
            if state.woken || state.stopped || state.dirty {
                continue;
            }
            let park_until = match (deadline, next_timer) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            };
            match park_until {
                Some(until) => {
                    let _ = self.core.wakeup.wait_until(&mut state, until);
                }
                None => self.core.wakeup.wait(&mut state),
            }
        }
    }
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}
