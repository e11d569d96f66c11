//! Error types and the per-context error-handler chain

use parking_lot::RwLock;
use std::io;
use std::sync::Arc;

/// Error thrown by user-supplied work. An open set: anything that is
/// `Error + Send + Sync` can cross a context boundary.
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A single link in a context's error-handler chain.
///
/// Returns `Ok(true)` if the error was handled, `Ok(false)` to pass it to
/// the next handler, or `Err(e)` to replace it with a new error (which
/// restarts the chain).
pub type ErrorHandler = Arc<dyn Fn(&TaskError) -> Result<bool, TaskError> + Send + Sync>;

/// Errors raised by the contexts themselves rather than by user tasks.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// The OS refused to create a thread for a context or a submission.
    #[error("failed to spawn context thread: {0}")]
    ThreadSpawn(#[from] io::Error),

    /// A serial context's thread exited before handing its run loop back.
    #[error("context thread exited before handing its run loop back")]
    LoopHandshake,
}

/// A handler that throws on every level would otherwise recurse without
/// bound; past this depth the error is reported stock-style instead.
const MAX_HANDLER_DEPTH: usize = 8;

fn stock_handler() -> ErrorHandler {
    Arc::new(|error| {
        eprintln!("{} was thrown but not handled", error);
        Ok(true)
    })
}

/// Ordered list of error handlers attached to one execution context.
///
/// The last element is always the stock handler, which reports the error
/// and marks it handled, so the chain always terminates.
pub(crate) struct HandlerChain {
    handlers: RwLock<Vec<ErrorHandler>>,
}

impl HandlerChain {
    pub(crate) fn new() -> Self {
        Self {
            handlers: RwLock::new(vec![stock_handler()]),
        }
    }

    /// Insert a handler just before the stock handler.
    pub(crate) fn register(&self, handler: ErrorHandler) {
        let mut handlers = self.handlers.write();
        let last = handlers.len() - 1;
        handlers.insert(last, handler);
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Run the chain on `error`. A handler that returns `Ok(true)` stops
    /// the iteration; a handler that throws replaces the error and restarts
    /// the chain (bounded by `MAX_HANDLER_DEPTH`).
    pub(crate) fn handle(&self, error: &TaskError) {
        self.handle_at_depth(error, 0);
    }

    fn handle_at_depth(&self, error: &TaskError, depth: usize) {
        if depth >= MAX_HANDLER_DEPTH {
            eprintln!("{} was thrown but the handler chain recursed too deep", error);
            return;
        }

        // Snapshot so a handler can register new handlers without deadlocking.
        let snapshot: Vec<ErrorHandler> = self.handlers.read().clone();

        for handler in snapshot {
            match handler(error) {
                Ok(true) => break,
                Ok(false) => continue,
                Err(next) => {
                    self.handle_at_depth(&next, depth + 1);
                    break;
                }
            }
        }
    }
}
