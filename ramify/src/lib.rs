//! ramify: a fine-grained task-DAG scheduler.
//!
//! Application code expresses computations as *tasks*: bodies that may
//! depend on earlier tasks, aggregate many predecessors, respawn
//! themselves, and run either on a single worker or on a cooperating team
//! of workers. A [`Future`] is the handle to a task: it keeps the record
//! alive, serves as a dependence token for later spawns, and carries the
//! task's value once it completes.
//!
//! Task records live in a bounded memory pool owned by the scheduler; a
//! spawn that finds the pool exhausted returns a *null* future instead of
//! blocking or aborting. [`wait`] drives the scheduler to quiescence.
//!
//! ```
//! use ramify::{Builder, Continuation, TaskPriority, host_spawn, task_single, wait};
//!
//! let scheduler = Builder::new_serial().try_build().unwrap();
//!
//! let first = host_spawn(task_single(&scheduler, TaskPriority::Regular), |_| {
//!     Continuation::done(20)
//! });
//! let second = host_spawn(task_single(&first, TaskPriority::Regular), {
//!     let first = first.clone();
//!     move |_| Continuation::done(first.get() + 22)
//! });
//!
//! wait(&scheduler);
//! assert_eq!(second.get(), 42);
//! ```

mod policy;
mod queue;
mod scheduler;

pub mod pool;
pub mod range;

pub(crate) mod exec;
pub(crate) mod task;

pub use crate::exec::TaskExec;
pub use crate::policy::{SpawnAnchor, TaskKind, TaskPolicy, TaskPriority, task_single, task_team};
pub use crate::scheduler::{Builder, TaskScheduler};
pub use crate::task::{Continuation, Future};

/// Spawns a task from outside any task body.
///
/// The policy anchors the spawn onto a scheduler or an existing future (the
/// new task then runs only after that future's task completes) and selects
/// the execution kind and priority; see [`task_single`] and [`task_team`].
/// Returns the null future when the scheduler's pool is exhausted.
///
/// Bodies are `Fn + Sync`, not `FnMut`: a team task invokes the same functor
/// from every member of its team concurrently, so state that changes across
/// respawns belongs in captured atomics or locks.
///
/// On the serial flavor, spawning first drains ready tasks inline; user
/// task bodies may run during this call.
pub fn host_spawn<F, V>(policy: TaskPolicy<'_>, functor: F) -> Future<V>
where
    F: Fn(&mut TaskExec<'_>) -> Continuation<V> + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    scheduler::spawn(policy, functor)
}

/// Spawns a task from inside a task body. Semantics of [`host_spawn`].
pub fn task_spawn<F, V>(policy: TaskPolicy<'_>, functor: F) -> Future<V>
where
    F: Fn(&mut TaskExec<'_>) -> Continuation<V> + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    scheduler::spawn(policy, functor)
}

/// Returns a future that completes when every input future's task has
/// completed.
///
/// Null inputs are ignored; an empty slice yields the null future. To
/// aggregate futures of different value types, erase them with
/// [`Future::token`] first. Returns the null future when the pool is
/// exhausted.
pub fn when_all<V>(futures: &[Future<V>]) -> Future<()> {
    scheduler::when_all(futures)
}

/// Runs tasks until the scheduler is quiescent: no task ready and no task
/// executing.
///
/// On the threaded flavor this drives a pool of worker threads scoped to
/// this call; on the serial flavor everything runs inline on the calling
/// thread.
pub fn wait(scheduler: &TaskScheduler) {
    scheduler.wait();
}
