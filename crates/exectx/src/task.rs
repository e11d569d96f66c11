//! Task shapes accepted by the scheduling core
//!
//! All task forms are normalized to [`SafeTask`] before they enter a run
//! loop's queue. Fallible tasks are adapted at the execution-context
//! boundary (caught and routed to the context's error-handler chain for
//! asynchronous submissions, rethrown for synchronous ones).

use crate::error::TaskError;

/// An infallible unit of work.
pub type SafeTask = Box<dyn FnOnce() + Send + 'static>;

/// A fallible unit of work.
pub type FallibleTask = Box<dyn FnOnce() -> Result<(), TaskError> + Send + 'static>;
