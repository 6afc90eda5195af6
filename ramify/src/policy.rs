use crate::queue::TaskQueue;
use crate::scheduler::TaskScheduler;
use crate::task::Future;
use crate::task::raw::RawTask;
use std::marker::PhantomData;

/// Priority class of a spawned task. Within a class, ordering is unspecified;
/// across classes, `High` runs before `Regular` before `Low` whenever both are
/// ready and a worker is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum TaskPriority {
    High = 0,
    #[default]
    Regular = 1,
    Low = 2,
}

pub(crate) const NUM_PRIORITIES: usize = 3;

/// How a task is executed once it is ready.
///
/// `Aggregate` is never requested directly; it is the kind of the synthetic
/// task produced by [`when_all`](crate::when_all).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskKind {
    /// Executed cooperatively by a whole team of workers in lockstep.
    Team = 0,
    /// Executed by exactly one worker.
    Single = 1,
    /// Completes when the last of its recorded predecessors completes.
    Aggregate = 2,
}

/// Number of ready-queue columns. Aggregates are handled inline by the
/// scheduler and never enqueued, so only `Team` and `Single` index the grid.
pub(crate) const NUM_RUNNABLE_KINDS: usize = 2;

/// Where a spawn attaches: a scheduler (no predecessor) or an existing future
/// (spawn after it, on the queue that owns it).
///
/// Built from `&TaskScheduler` or `&Future<V>` via `Into`, so both
/// `task_single(&scheduler, ..)` and `task_single(&future, ..)` read the same
/// way at call sites.
pub struct SpawnAnchor<'a> {
    pub(crate) queue: Option<*const TaskQueue>,
    pub(crate) dependence: Option<RawTask>,
    _lt: PhantomData<&'a ()>,
}

impl<'a> From<&'a TaskScheduler> for SpawnAnchor<'a> {
    fn from(scheduler: &'a TaskScheduler) -> Self {
        SpawnAnchor {
            queue: Some(scheduler.queue_ptr()),
            dependence: None,
            _lt: PhantomData,
        }
    }
}

impl<'a, V> From<&'a Future<V>> for SpawnAnchor<'a> {
    fn from(future: &'a Future<V>) -> Self {
        let dependence = future.raw();
        SpawnAnchor {
            // A null future anchors nothing; spawn will reject it.
            queue: dependence.map(|raw| raw.header().queue),
            dependence,
            _lt: PhantomData,
        }
    }
}

/// Options carried into a spawn: execution kind, priority, and the anchor the
/// new task hangs off.
pub struct TaskPolicy<'a> {
    pub(crate) anchor: SpawnAnchor<'a>,
    pub(crate) kind: TaskKind,
    pub(crate) priority: TaskPriority,
}

/// Spawn policy for a task executed by a single worker.
pub fn task_single<'a>(
    anchor: impl Into<SpawnAnchor<'a>>,
    priority: TaskPriority,
) -> TaskPolicy<'a> {
    TaskPolicy {
        anchor: anchor.into(),
        kind: TaskKind::Single,
        priority,
    }
}

/// Spawn policy for a task executed cooperatively by a team of workers.
pub fn task_team<'a>(anchor: impl Into<SpawnAnchor<'a>>, priority: TaskPriority) -> TaskPolicy<'a> {
    TaskPolicy {
        anchor: anchor.into(),
        kind: TaskKind::Team,
        priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_high_before_low() {
        assert!(TaskPriority::High < TaskPriority::Regular);
        assert!(TaskPriority::Regular < TaskPriority::Low);
        assert_eq!(TaskPriority::default(), TaskPriority::Regular);
    }

    #[test]
    fn ready_grid_dimensions_cover_runnable_kinds() {
        assert_eq!(TaskKind::Team as usize, 0);
        assert_eq!(TaskKind::Single as usize, 1);
        assert!((TaskKind::Aggregate as usize) >= NUM_RUNNABLE_KINDS);
        assert_eq!(NUM_PRIORITIES, 3);
    }
}
