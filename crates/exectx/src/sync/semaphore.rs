//! Counting semaphores
//!
//! Two implementations behind one trait: [`BlockingSemaphore`] parks the
//! calling thread on a condvar, while [`LoopSemaphore`] keeps the calling
//! thread's run loop turning while it waits, so loop-bound work keeps
//! flowing. `semaphore_for_current_thread` picks whichever suits the
//! caller.

use crate::runloop::{RunLoop, RunLoopMode, RunLoopSource, WAKE_SOURCE_PRIORITY};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A counting semaphore. `wait` returns false when the timeout elapsed
/// before a permit became available; the count never goes below zero.
pub trait Semaphore: Send + Sync {
    /// Acquire a permit, waiting up to `timeout` (forever when `None`).
    fn wait(&self, timeout: Option<Duration>) -> bool;

    /// Release a permit and return the new count.
    fn signal(&self) -> isize;
}

/// Semaphore that parks the calling thread.
pub struct BlockingSemaphore {
    count: Mutex<isize>,
    available: Condvar,
}

impl BlockingSemaphore {
    pub fn new(value: isize) -> Self {
        Self {
            count: Mutex::new(value),
            available: Condvar::new(),
        }
    }

    /// A mutex-shaped semaphore with one permit.
    pub fn binary() -> Self {
        Self::new(1)
    }
}

impl Semaphore for BlockingSemaphore {
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.count.lock();
        while *count <= 0 {
            match deadline {
                Some(d) => {
                    if self.available.wait_until(&mut count, d).timed_out() && *count <= 0 {
                        return false;
                    }
                }
                None => self.available.wait(&mut count),
            }
        }
        *count -= 1;
        true
    }

    fn signal(&self) -> isize {
        let mut count = self.count.lock();
        *count += 1;
        self.available.notify_one();
        *count
    }
}

/// Semaphore that waits by running the calling thread's run loop, so
/// queued tasks, sources, and timers on that loop keep executing while
/// the caller blocks. `signal` may come from any thread.
pub struct LoopSemaphore {
    count: Arc<Mutex<isize>>,
    /// Wake source registered on the waiting loop for the duration of a
    /// wait. The callback does nothing; the firing itself is the wakeup
    /// and the wait loop re-checks the count.
    source: RunLoopSource,
}

impl LoopSemaphore {
    pub fn new(value: isize) -> Self {
        Self {
            count: Arc::new(Mutex::new(value)),
            source: RunLoopSource::with_priority(WAKE_SOURCE_PRIORITY, || {}),
        }
    }

    pub fn binary() -> Self {
        Self::new(1)
    }

    fn try_acquire(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}

impl Semaphore for LoopSemaphore {
    fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.try_acquire() {
            return true;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let rl = RunLoop::current();
        rl.add_source(&self.source, RunLoopMode::DEFAULT);

        let granted = loop {
            if self.try_acquire() {
                break true;
            }
            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        break false;
                    }
                    Some(d - now)
                }
                None => None,
            };
            rl.run(remaining);
        };

        rl.remove_source(&self.source, RunLoopMode::DEFAULT);
        granted
    }

    fn signal(&self) -> isize {
        let count = {
            let mut count = self.count.lock();
            *count += 1;
            *count
        };
        self.source.signal();
        count
    }
}

/// The semaphore flavor suited to the calling thread: loop-integrated if
/// the thread already has a run loop, blocking otherwise.
pub fn semaphore_for_current_thread(value: isize) -> Arc<dyn Semaphore> {
    if RunLoop::try_current().is_some() {
        Arc::new(LoopSemaphore::new(value))
    } else {
        Arc::new(BlockingSemaphore::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_blocking_permits_are_consumed() {
        let sem = BlockingSemaphore::new(2);
        assert!(sem.wait(Some(Duration::ZERO)));
        assert!(sem.wait(Some(Duration::ZERO)));
        assert!(!sem.wait(Some(Duration::from_millis(20))));

        assert_eq!(sem.signal(), 1);
        assert!(sem.wait(Some(Duration::ZERO)));
    }

    #[test]
    fn test_blocking_timeout_does_not_go_negative() {
        let sem = BlockingSemaphore::new(0);
        assert!(!sem.wait(Some(Duration::from_millis(20))));
        // The failed wait must not have consumed anything.
        sem.signal();
        assert!(sem.wait(Some(Duration::ZERO)));
    }

    #[test]
    fn test_blocking_cross_thread_signal() {
        let sem = Arc::new(BlockingSemaphore::new(0));
        let signaled = Arc::new(AtomicBool::new(false));

        let remote_sem = sem.clone();
        let remote_flag = signaled.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote_flag.store(true, Ordering::SeqCst);
            remote_sem.signal();
        });

        assert!(sem.wait(Some(Duration::from_secs(2))));
        assert!(signaled.load(Ordering::SeqCst));
        handle.join().unwrap();
    }

    #[test]
    fn test_signal_wakes_exactly_one_waiter() {
        let sem = Arc::new(BlockingSemaphore::new(0));
        let proceeded = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let sem = sem.clone();
            let proceeded = proceeded.clone();
            handles.push(thread::spawn(move || {
                if sem.wait(Some(Duration::from_secs(5))) {
                    proceeded.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        // Let both waiters park before the first permit arrives.
        thread::sleep(Duration::from_millis(50));
        sem.signal();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(proceeded.load(Ordering::SeqCst), 1);

        sem.signal();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(proceeded.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_binary_starts_with_one_permit() {
        let sem = BlockingSemaphore::binary();
        assert!(sem.wait(Some(Duration::ZERO)));
        assert!(!sem.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_loop_semaphore_fast_path() {
        let sem = LoopSemaphore::new(1);
        assert!(sem.wait(Some(Duration::ZERO)));
        assert!(!sem.wait(Some(Duration::from_millis(20))));
    }

    #[test]
    fn test_loop_semaphore_cross_thread_signal() {
        let sem = Arc::new(LoopSemaphore::new(0));

        let remote = sem.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.signal();
        });

        assert!(sem.wait(Some(Duration::from_secs(2))));
        handle.join().unwrap();
    }

    #[test]
    fn test_loop_semaphore_runs_loop_tasks_while_waiting() {
        let sem = Arc::new(LoopSemaphore::new(0));
        let task_ran = Arc::new(AtomicBool::new(false));

        let rl = RunLoop::current();
        let flag = task_ran.clone();
        let release = sem.clone();
        rl.add_task(move || {
            flag.store(true, Ordering::SeqCst);
            release.signal();
        });

        // The permit only appears once the queued task has executed, which
        // requires the wait itself to turn the loop.
        assert!(sem.wait(Some(Duration::from_secs(2))));
        assert!(task_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_picks_flavor_by_thread() {
        // No loop on a fresh thread.
        thread::spawn(|| {
            let sem = semaphore_for_current_thread(1);
            assert!(sem.wait(Some(Duration::ZERO)));
        })
        .join()
        .unwrap();

        let _ = RunLoop::current();
        let sem = semaphore_for_current_thread(1);
        assert!(sem.wait(Some(Duration::ZERO)));
    }
}
