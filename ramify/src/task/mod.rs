//! Task records and the handles that reference them.
//!
//! A task is one pool-allocated block: a [`header::TaskHeader`] followed by a
//! typed payload. Runnable tasks carry their functor (and, once finished,
//! their value) in a [`cell::TaskCell`]; aggregates carry a trailing array of
//! predecessor pointers. [`raw::RawTask`] navigates either shape through the
//! header's vtable, and [`Future`] is the ref-counted user handle.

use crate::policy::TaskPriority;

pub(crate) mod cell;
pub(crate) mod header;
pub(crate) mod raw;

mod future;
pub use self::future::Future;

/// What a task body decided: finish with a value, or go around again.
///
/// Returned by every task functor. `Done` stores the value and moves the task
/// into completion, waking its dependents. A respawn re-enters the scheduler
/// instead: the task will run again once the new dependence (if any) has
/// completed, at the priority recorded here.
pub enum Continuation<V> {
    Done(V),
    Respawn {
        dep: Option<Future<()>>,
        priority: TaskPriority,
    },
}

impl<V> Continuation<V> {
    /// Finish the task with `value`.
    pub fn done(value: V) -> Self {
        Continuation::Done(value)
    }

    /// Run again as soon as a worker is free, at `priority`.
    pub fn respawn(priority: TaskPriority) -> Self {
        Continuation::Respawn {
            dep: None,
            priority,
        }
    }

    /// Run again after `dep` completes, at `priority`.
    pub fn respawn_after<T>(dep: &Future<T>, priority: TaskPriority) -> Self {
        Continuation::Respawn {
            dep: Some(dep.token()),
            priority,
        }
    }
}
