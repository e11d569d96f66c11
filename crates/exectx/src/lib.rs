//! Serial and parallel execution contexts on a cooperative run loop.
//!
//! The building blocks layer bottom-up: a thread-safe FIFO [`TaskQueue`],
//! a [`RunLoop`] multiplexing sources, timers, and that queue on one
//! thread, [`Semaphore`] flavors that either park the caller or keep its
//! loop turning, and [`ExecutionContext`]s that place tasks on those
//! loops (serially, in parallel, inline, or through a custom executor)
//! with per-context error handling.
//!
//! ```no_run
//! use exectx::{global, ExecutionContext, ExecutionContextKind};
//!
//! let ctx = ExecutionContext::new(ExecutionContextKind::Serial).unwrap();
//! ctx.spawn(|| println!("runs on the context's loop thread"));
//!
//! // Block the caller until a result computed elsewhere comes back.
//! let answer = global().sync(|| 6 * 7);
//! assert_eq!(answer, 42);
//! ```

pub mod context;
pub mod error;
pub mod queue;
pub mod runloop;
pub mod sync;
mod task;

pub use context::{
    execution_context, global, immediate, main, main_proc, ContextId, ExecutionContext,
    ExecutionContextKind, Executor,
};
pub use error::{ContextError, ErrorHandler, TaskError};
pub use queue::TaskQueue;
pub use runloop::{
    LoopId, RunLoop, RunLoopMode, RunLoopSource, RunLoopTimer, RunResult, SourceId, TimerId,
};
pub use sync::{semaphore_for_current_thread, BlockingSemaphore, LoopSemaphore, Semaphore};
pub use task::{FallibleTask, SafeTask};
