//! Dedicated-thread backend for serial contexts
//!
//! A serial context owns one run loop. For contexts created at runtime
//! the loop lives on a dedicated named thread spawned here; the main
//! context instead borrows the process main loop and owns no thread.

use crate::error::ContextError;
use crate::runloop::{RunLoop, RunResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub(crate) struct SerialCore {
    run_loop: RunLoop,
    /// `None` for the main context, which does not own its thread.
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SerialCore {
    /// Spawn a dedicated loop thread and wait for it to hand its run loop
    /// back.
    pub(crate) fn spawn() -> Result<Self, ContextError> {
        static SEQ: AtomicU64 = AtomicU64::new(1);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = crossbeam::channel::bounded::<RunLoop>(1);
        let handle = thread::Builder::new()
            .name(format!("exectx-serial-{}", seq))
            .spawn(move || {
                let rl = RunLoop::current();
                rl.set_protected(true);
                let _ = tx.send(rl.clone());
                while rl.run(None) != RunResult::Stopped {}
                RunLoop::clear_current();
            })?;

        let run_loop = rx.recv().map_err(|_| ContextError::LoopHandshake)?;
        Ok(Self {
            run_loop,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Wrap an existing loop without owning a thread.
    pub(crate) fn for_loop(run_loop: RunLoop) -> Self {
        Self {
            run_loop,
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn run_loop(&self) -> &RunLoop {
        &self.run_loop
    }
}

impl Drop for SerialCore {
    fn drop(&mut self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        // Queued behind any pending tasks, so they drain before the loop
        // stops.
        let rl = self.run_loop.clone();
        self.run_loop.add_task(move || {
            rl.set_protected(false);
            rl.stop();
        });
        // Dropped from a task on the loop's own thread: it cannot join
        // itself, so let the thread wind down detached.
        if self.run_loop.is_current() {
            return;
        }
        join_with_timeout(handle, Duration::from_secs(2));
    }
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    let _ = handle.join();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_spawned_core_executes_tasks() {
        let core = SerialCore::spawn().unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        core.run_loop().add_task(move || {
            flag.store(true, Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while !ran.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_drains_pending_tasks() {
        let core = SerialCore::spawn().unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        core.run_loop().add_task(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });
        drop(core);

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_on_own_loop_thread_returns_promptly() {
        let core = SerialCore::spawn().unwrap();
        let rl = core.run_loop().clone();
        let prompt = Arc::new(AtomicBool::new(false));

        let flag = prompt.clone();
        rl.add_task(move || {
            let started = Instant::now();
            drop(core);
            flag.store(started.elapsed() < Duration::from_millis(500), Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while !prompt.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(prompt.load(Ordering::SeqCst));
    }

    #[test]
    fn test_loop_is_not_current_from_outside() {
        let core = SerialCore::spawn().unwrap();
        assert!(!core.run_loop().is_current());
    }
}
