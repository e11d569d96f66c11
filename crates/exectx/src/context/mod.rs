//! Execution contexts
//!
//! An execution context is a place tasks run: inline ([`immediate`]), on
//! one dedicated loop thread (serial), on short-lived loop threads
//! (parallel, [`global`]), or through a user-supplied executor
//! ([`execution_context`]). Every context carries its own error-handler
//! chain; fallible work that escapes a task is routed through it.

mod serial;

use crate::error::{ContextError, HandlerChain, TaskError};
use crate::runloop::{RunLoop, RunLoopTimer, RunResult};
use crate::sync::semaphore_for_current_thread;
use crate::task::SafeTask;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serial::SerialCore;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// User-supplied dispatch function backing a custom context.
pub type Executor = Arc<dyn Fn(SafeTask) + Send + Sync + 'static>;

/// Serial contexts run tasks one at a time in submission order; parallel
/// contexts may run them concurrently.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionContextKind {
    Serial,
    Parallel,
}

/// Unique identifier for a context.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

enum Flavor {
    /// Runs tasks inline on the submitting thread.
    Immediate,
    /// One dedicated loop thread (or the main loop, for the main context).
    Serial(SerialCore),
    /// A fresh short-lived loop thread per submission.
    Parallel,
    /// Dispatch is delegated to a user-supplied executor.
    Custom(Executor),
}

struct ContextInner {
    id: ContextId,
    flavor: Flavor,
    handlers: HandlerChain,
}

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

/// Restores the previous current-context on drop, so nested scopes and
/// panicking tasks unwind cleanly.
struct ContextScope {
    previous: Option<ExecutionContext>,
}

impl ContextScope {
    fn enter(ctx: &ExecutionContext) -> Self {
        let previous =
            CURRENT_CONTEXT.with(|cell| cell.borrow_mut().replace(ctx.clone()));
        Self { previous }
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_CONTEXT.with(|cell| {
            *cell.borrow_mut() = previous;
        });
    }
}

/// Work seeding a fresh parallel loop thread.
enum LoopSeed {
    Task(SafeTask),
    Timer(Duration, SafeTask),
}

fn spawn_parallel_thread(id: ContextId, seed: LoopSeed) -> Result<(), ContextError> {
    thread::Builder::new()
        .name(format!("exectx-parallel-{}", id.as_u64()))
        .spawn(move || {
            let rl = RunLoop::current();
            match seed {
                LoopSeed::Task(task) => rl.add_task(task),
                LoopSeed::Timer(delay, task) => {
                    let timer = RunLoopTimer::new(delay, task);
                    rl.add_timer(&timer);
                }
            }
            // Drain everything the seed task schedules, then exit once
            // the loop goes quiet.
            loop {
                match rl.run(None) {
                    RunResult::Stopped | RunResult::Idle => break,
                    _ => {}
                }
            }
            RunLoop::clear_current();
        })?;
    Ok(())
}

/// Handle to an execution context. Cloning yields another handle to the
/// same context; handles compare equal when they refer to the same one.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .finish()
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
            && mem::discriminant(&self.inner.flavor) == mem::discriminant(&other.inner.flavor)
    }
}

impl Eq for ExecutionContext {}

impl ExecutionContext {
    /// Create a context of the given kind. Serial contexts spawn their
    /// loop thread here, so creation can fail.
    pub fn new(kind: ExecutionContextKind) -> Result<Self, ContextError> {
        match kind {
            ExecutionContextKind::Serial => {
                Ok(Self::from_flavor(Flavor::Serial(SerialCore::spawn()?)))
            }
            ExecutionContextKind::Parallel => Ok(Self::from_flavor(Flavor::Parallel)),
        }
    }

    fn from_flavor(flavor: Flavor) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: ContextId::new(),
                flavor,
                handlers: HandlerChain::new(),
            }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn kind(&self) -> ExecutionContextKind {
        match self.inner.flavor {
            Flavor::Parallel => ExecutionContextKind::Parallel,
            _ => ExecutionContextKind::Serial,
        }
    }

    /// A serial view of this context; a context that is already serial is
    /// its own serial view.
    pub fn serial(&self) -> ExecutionContext {
        self.clone()
    }

    /// The parallel context this one is associated with; [`global`] when
    /// there is no closer association.
    pub fn parallel(&self) -> ExecutionContext {
        match self.inner.flavor {
            Flavor::Parallel => self.clone(),
            _ => global(),
        }
    }

    /// The context the calling code runs under: the main context on the
    /// main thread, otherwise whatever context scheduled the running
    /// task, falling back to [`global`].
    pub fn current() -> ExecutionContext {
        if thread::current().name() == Some("main") {
            return main();
        }
        CURRENT_CONTEXT
            .with(|cell| cell.borrow().clone())
            .unwrap_or_else(global)
    }

    pub fn is_current(&self) -> bool {
        ExecutionContext::current() == *self
    }

    /// Wrap a task so it runs with this context installed as current.
    fn scoped(&self, task: SafeTask) -> SafeTask {
        let ctx = self.clone();
        Box::new(move || {
            let _scope = ContextScope::enter(&ctx);
            task();
        })
    }

    fn submit(&self, task: SafeTask) -> Result<(), ContextError> {
        match &self.inner.flavor {
            Flavor::Immediate => {
                task();
                Ok(())
            }
            Flavor::Serial(core) => {
                core.run_loop().add_task(task);
                Ok(())
            }
            Flavor::Parallel => spawn_parallel_thread(self.inner.id, LoopSeed::Task(task)),
            Flavor::Custom(executor) => {
                executor(task);
                Ok(())
            }
        }
    }

    fn submit_after(&self, delay: Duration, task: SafeTask) -> Result<(), ContextError> {
        match &self.inner.flavor {
            Flavor::Immediate => {
                thread::sleep(delay);
                task();
                Ok(())
            }
            Flavor::Serial(core) => {
                let timer = RunLoopTimer::new(delay, task);
                core.run_loop().add_timer(&timer);
                Ok(())
            }
            Flavor::Parallel => {
                spawn_parallel_thread(self.inner.id, LoopSeed::Timer(delay, task))
            }
            Flavor::Custom(executor) => {
                executor(Box::new(move || {
                    thread::sleep(delay);
                    task();
                }));
                Ok(())
            }
        }
    }

    /// Schedule a task for asynchronous execution on this context.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        if let Err(error) = self.submit(self.scoped(Box::new(task))) {
            self.handle_error(&(Box::new(error) as TaskError));
        }
    }

    /// Alias for [`ExecutionContext::spawn`], the basic dispatch
    /// operation.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        self.spawn(task);
    }

    /// Schedule a fallible task; an error it returns is routed through
    /// this context's error-handler chain.
    pub fn spawn_fallible(
        &self,
        task: impl FnOnce() -> Result<(), TaskError> + Send + 'static,
    ) {
        let ctx = self.clone();
        self.spawn(move || {
            if let Err(error) = task() {
                ctx.handle_error(&error);
            }
        });
    }

    /// Schedule a task to run on this context no earlier than `delay`
    /// from now.
    pub fn spawn_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        if let Err(error) = self.submit_after(delay, self.scoped(Box::new(task))) {
            self.handle_error(&(Box::new(error) as TaskError));
        }
    }

    /// Delayed variant of [`ExecutionContext::spawn_fallible`].
    pub fn spawn_after_fallible(
        &self,
        delay: Duration,
        task: impl FnOnce() -> Result<(), TaskError> + Send + 'static,
    ) {
        let ctx = self.clone();
        self.spawn_after(delay, move || {
            if let Err(error) = task() {
                ctx.handle_error(&error);
            }
        });
    }

    /// Run a task inline if this context is current (or immediate),
    /// otherwise schedule it.
    pub fn immediate_if_current(&self, task: impl FnOnce() + Send + 'static) {
        if matches!(self.inner.flavor, Flavor::Immediate) || self.is_current() {
            task();
        } else {
            self.execute(task);
        }
    }

    /// Run a fallible task on this context and block the caller until it
    /// completes, returning its result. An error is rethrown to the
    /// caller rather than routed through the handler chain.
    ///
    /// When the caller is already on this context the task runs inline.
    /// Otherwise the caller waits on a semaphore suited to its thread, so
    /// a loop-bound caller keeps its own loop turning while blocked.
    pub fn sync_fallible<R, F>(&self, task: F) -> Result<R, TaskError>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R, TaskError> + Send + 'static,
    {
        if matches!(self.inner.flavor, Flavor::Immediate) || self.is_current() {
            let _scope = ContextScope::enter(self);
            return task();
        }

        let semaphore = semaphore_for_current_thread(0);
        let slot: Arc<Mutex<Option<Result<R, TaskError>>>> = Arc::new(Mutex::new(None));

        let ctx = self.clone();
        let store = slot.clone();
        let release = semaphore.clone();
        self.submit(Box::new(move || {
            let _scope = ContextScope::enter(&ctx);
            let result = task();
            *store.lock() = Some(result);
            release.signal();
        }))?;

        semaphore.wait(None);
        let result = slot.lock().take();
        result.expect("bridge task signaled without storing a result")
    }

    /// Infallible form of [`ExecutionContext::sync_fallible`].
    pub fn sync<R, F>(&self, task: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        match self.sync_fallible(move || Ok(task())) {
            Ok(value) => value,
            Err(error) => panic!("synchronous submission failed: {}", error),
        }
    }

    /// Add an error handler ahead of the stock one. Handlers run newest
    /// registration closest to the stock handler; see
    /// [`crate::ErrorHandler`] for the protocol.
    pub fn register_error_handler(
        &self,
        handler: impl Fn(&TaskError) -> Result<bool, TaskError> + Send + Sync + 'static,
    ) {
        self.inner.handlers.register(Arc::new(handler));
    }

    /// Route an error through this context's handler chain.
    pub fn handle_error(&self, error: &TaskError) {
        self.inner.handlers.handle(error);
    }
}

static IMMEDIATE: Lazy<ExecutionContext> =
    Lazy::new(|| ExecutionContext::from_flavor(Flavor::Immediate));

static MAIN: Lazy<ExecutionContext> = Lazy::new(|| {
    ExecutionContext::from_flavor(Flavor::Serial(SerialCore::for_loop(RunLoop::main())))
});

static GLOBAL: Lazy<ExecutionContext> =
    Lazy::new(|| ExecutionContext::from_flavor(Flavor::Parallel));

/// The context that runs tasks inline on the submitting thread.
pub fn immediate() -> ExecutionContext {
    IMMEDIATE.clone()
}

/// The serial context bound to the process main loop. Its tasks only run
/// while [`main_proc`] (or the main loop itself) is running.
pub fn main() -> ExecutionContext {
    MAIN.clone()
}

/// The shared parallel context.
pub fn global() -> ExecutionContext {
    GLOBAL.clone()
}

/// Wrap a user-supplied executor in a context of its own.
pub fn execution_context(executor: impl Fn(SafeTask) + Send + Sync + 'static) -> ExecutionContext {
    ExecutionContext::from_flavor(Flavor::Custom(Arc::new(executor)))
}

/// Adopt the calling thread as the process main thread and run the main
/// loop forever. Must be called from the thread named "main"; exits the
/// process otherwise.
pub fn main_proc() -> ! {
    if thread::current().name() != Some("main") {
        eprintln!("main_proc must be called from the main thread");
        process::exit(1);
    }
    let rl = RunLoop::main();
    rl.make_current();
    rl.set_protected(true);
    CURRENT_CONTEXT.with(|cell| {
        *cell.borrow_mut() = Some(main());
    });
    loop {
        let _ = rl.run(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread::ThreadId;
    use std::time::Instant;

    fn wait_for(flag: &AtomicBool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !flag.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn test_immediate_runs_on_calling_thread() {
        let here = thread::current().id();
        let there: Arc<Mutex<Option<ThreadId>>> = Arc::new(Mutex::new(None));

        let slot = there.clone();
        immediate().spawn(move || {
            *slot.lock() = Some(thread::current().id());
        });
        assert_eq!(*there.lock(), Some(here));
    }

    #[test]
    fn test_serial_context_runs_off_thread() {
        let ctx = ExecutionContext::new(ExecutionContextKind::Serial).unwrap();
        let here = thread::current().id();
        assert_eq!(ctx.sync(move || thread::current().id() != here), true);
    }

    #[test]
    fn test_parallel_context_executes() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        global().spawn(move || {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(wait_for(&done, Duration::from_secs(2)));
    }

    #[test]
    fn test_custom_executor_receives_tasks() {
        let dispatched = Arc::new(AtomicUsize::new(0));
        let d = dispatched.clone();
        let ctx = execution_context(move |task| {
            d.fetch_add(1, Ordering::SeqCst);
            task();
        });

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        ctx.spawn(move || flag.store(true, Ordering::SeqCst));

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(dispatched.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_context_equality_is_identity() {
        let a = ExecutionContext::new(ExecutionContextKind::Parallel).unwrap();
        let b = ExecutionContext::new(ExecutionContextKind::Parallel).unwrap();
        assert_eq!(a, a.clone());
        assert!(a != b);
        assert!(global() == global());
        assert!(immediate() != global());
    }

    #[test]
    fn test_kind_of_flavors() {
        assert_eq!(immediate().kind(), ExecutionContextKind::Serial);
        assert_eq!(global().kind(), ExecutionContextKind::Parallel);
        let custom = execution_context(|task| task());
        assert_eq!(custom.kind(), ExecutionContextKind::Serial);
    }

    #[test]
    fn test_serial_and_parallel_views() {
        let ctx = ExecutionContext::new(ExecutionContextKind::Serial).unwrap();
        assert!(ctx.serial() == ctx);
        assert!(ctx.parallel() == global());
        assert!(global().parallel() == global());
    }

    #[test]
    fn test_task_sees_its_context_as_current() {
        let ctx = ExecutionContext::new(ExecutionContextKind::Serial).unwrap();
        let observed = ctx.clone();
        assert!(ctx.sync(move || observed.is_current()));
    }

    #[test]
    fn test_immediate_if_current_inlines_on_own_context() {
        let ctx = ExecutionContext::new(ExecutionContextKind::Serial).unwrap();
        let inlined = ctx.clone();
        // From inside one of its own tasks the context is current, so the
        // nested task must run before sync returns.
        let ran_inline = ctx.sync(move || {
            let flag = Arc::new(AtomicBool::new(false));
            let f = flag.clone();
            inlined.immediate_if_current(move || f.store(true, Ordering::SeqCst));
            flag.load(Ordering::SeqCst)
        });
        assert!(ran_inline);
    }
}
