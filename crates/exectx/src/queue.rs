//! Thread-safe FIFO of pending tasks
//!
//! The queue carries no scheduling logic of its own; a run loop wires it to
//! a dedicated source and drains it when that source fires.

use crate::task::SafeTask;
use parking_lot::Mutex;
use std::ptr;

/// Intrusive singly-linked node holding one task.
struct TaskQueueElement {
    task: Option<SafeTask>,
    next: Option<Box<TaskQueueElement>>,
}

struct QueueState {
    head: Option<Box<TaskQueueElement>>,
    /// Raw back-pointer into the last node; only dereferenced under the lock.
    tail: *mut TaskQueueElement,
    len: usize,
}

// The raw tail pointer always aliases a node owned by `head`; access is
// serialized by the queue lock.
unsafe impl Send for QueueState {}

/// FIFO task queue with O(1) enqueue/dequeue under one queue-local lock.
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                head: None,
                tail: ptr::null_mut(),
                len: 0,
            }),
        }
    }

    /// Append a task. Returns true when the queue transitioned from empty
    /// to non-empty, which is the only moment the owning loop's queue
    /// source needs signaling.
    pub fn enqueue(&self, task: SafeTask) -> bool {
        let mut node = Box::new(TaskQueueElement {
            task: Some(task),
            next: None,
        });
        let raw: *mut TaskQueueElement = &mut *node;

        let mut state = self.state.lock();
        let was_empty = state.head.is_none();
        if state.tail.is_null() {
            state.head = Some(node);
        } else {
            unsafe {
                (*state.tail).next = Some(node);
            }
        }
        state.tail = raw;
        state.len += 1;
        was_empty
    }

    /// Remove the head task. The removed node's next-pointer is detached so
    /// it does not keep the remainder of the list alive.
    pub fn dequeue(&self) -> Option<SafeTask> {
        let mut state = self.state.lock();
        let mut node = state.head.take()?;
        state.head = node.next.take();
        if state.head.is_none() {
            state.tail = ptr::null_mut();
        }
        state.len -= 1;
        node.task.take()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().head.is_none()
    }

    pub fn len(&self) -> usize {
        self.state.lock().len
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
