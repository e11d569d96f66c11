//! Signal-driven callback sources
//!
//! A source owns a callback and a sticky signaled flag, and may be
//! registered on any number of run loops. Signaling marks the flag and
//! wakes every registered loop; the loop that services the signal clears
//! the flag and invokes the callback. An invalidated source never fires
//! again, even if a signal was already in flight.

use super::runloop::{LoopCore, LoopId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Priority of the built-in task-queue source; user sources default to 0
/// and fire after it.
pub(crate) const TASK_QUEUE_PRIORITY: i32 = 100;

/// Priority of semaphore wake sources.
pub(crate) const WAKE_SOURCE_PRIORITY: i32 = 2;

pub(crate) type SourceCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Unique identifier for a source.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

struct SourceState {
    /// Dropped on invalidation; `None` means the source is dead.
    callback: Option<SourceCallback>,
    /// Sticky until a loop services the signal.
    signaled: bool,
    /// Loops this source is registered on, for signal delivery.
    loops: Vec<(LoopId, Weak<LoopCore>)>,
}

pub(crate) struct SourceCore {
    id: SourceId,
    priority: i32,
    state: Mutex<SourceState>,
}

impl SourceCore {
    pub(crate) fn new(priority: i32, callback: SourceCallback) -> Arc<Self> {
        Arc::new(Self {
            id: SourceId::new(),
            priority,
            state: Mutex::new(SourceState {
                callback: Some(callback),
                signaled: false,
                loops: Vec::new(),
            }),
        })
    }

    pub(crate) fn id(&self) -> SourceId {
        self.id
    }

    pub(crate) fn priority(&self) -> i32 {
        self.priority
    }

    /// Mark the source signaled and wake every loop it is registered on.
    /// No-op once invalidated.
    pub(crate) fn signal(&self) {
        let loops = {
            let mut state = self.state.lock();
            if state.callback.is_none() {
                return;
            }
            state.signaled = true;
            state.loops.clone()
        };
        for (_, weak) in loops {
            if let Some(rl) = weak.upgrade() {
                rl.notify();
            }
        }
    }

    /// Consume a pending signal, handing back the callback to invoke.
    pub(crate) fn take_if_signaled(&self) -> Option<SourceCallback> {
        let mut state = self.state.lock();
        if state.signaled {
            state.signaled = false;
            state.callback.clone()
        } else {
            None
        }
    }

    pub(crate) fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.state.lock().callback.is_some()
    }

    /// Drop the callback and detach; returns the loops that must forget
    /// this source.
    pub(crate) fn invalidate(&self) -> Vec<(LoopId, Weak<LoopCore>)> {
        let mut state = self.state.lock();
        state.callback = None;
        state.signaled = false;
        std::mem::take(&mut state.loops)
    }

    pub(crate) fn attach_loop(&self, rl: &Arc<LoopCore>) {
        let mut state = self.state.lock();
        if state.loops.iter().all(|(id, _)| *id != rl.id()) {
            state.loops.push((rl.id(), Arc::downgrade(rl)));
        }
    }

    pub(crate) fn detach_loop(&self, loop_id: LoopId) {
        let mut state = self.state.lock();
        state.loops.retain(|(id, _)| *id != loop_id);
    }
}

/// Public handle to a callback source. Cloning yields another handle to
/// the same source.
#[derive(Clone)]
pub struct RunLoopSource {
    core: Arc<SourceCore>,
}

impl RunLoopSource {
    /// Create a source with default priority.
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self::with_priority(0, callback)
    }

    /// Create a source with an explicit priority; higher priorities fire
    /// first within one wakeup.
    pub fn with_priority(priority: i32, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            core: SourceCore::new(priority, Arc::new(callback)),
        }
    }

    pub fn id(&self) -> SourceId {
        self.core.id()
    }

    /// Request a firing on every loop the source is registered on.
    pub fn signal(&self) {
        self.core.signal();
    }

    pub fn is_valid(&self) -> bool {
        self.core.is_valid()
    }

    /// Detach from all run loops and drop the callback. The callback will
    /// not execute after this returns, even for signals already in flight.
    pub fn invalidate(&self) {
        for (_, weak) in self.core.invalidate() {
            if let Some(rl) = weak.upgrade() {
                rl.remove_source_by_id(self.core.id());
            }
        }
    }

    pub(crate) fn core(&self) -> &Arc<SourceCore> {
        &self.core
    }
}
