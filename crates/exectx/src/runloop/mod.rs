//! Run loop, sources, and timers

mod runloop;
mod source;
mod timer;

pub use runloop::{LoopId, RunLoop, RunLoopMode, RunResult};
pub use source::{RunLoopSource, SourceId};
pub use timer::{RunLoopTimer, TimerId};

pub(crate) use source::WAKE_SOURCE_PRIORITY;
