//! Worker-side execution: the per-worker task context, the team barrier,
//! and the serial and threaded drivers behind `execute`.

use crate::queue::TaskQueue;
use crate::task::header::TaskHeader;
use crate::task::raw::Applied;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) mod serial;
pub(crate) mod team;

#[cfg(test)]
mod tests;

/// How a scheduler drives its queue to quiescence.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ExecFlavor {
    /// Everything runs inline on the calling thread; spawn drains ready
    /// tasks recursively.
    Serial,
    /// `workers` threads per `execute` call, grouped into teams of
    /// `team_size` sharing a barrier and `scratch_bytes` of scratch.
    Threaded {
        workers: usize,
        team_size: usize,
        scratch_bytes: usize,
    },
}

/// The view a task body gets of the worker running it.
///
/// Single tasks always see a team of one and a no-op barrier. Team tasks see
/// their member's rank within the team, the team's scratch buffer, and a
/// barrier spanning exactly the team; a worker outside the team is never
/// blocked on it.
pub struct TaskExec<'a> {
    group_rank: usize,
    team_rank: usize,
    team_size: usize,
    barrier: Option<&'a TeamBarrier>,
    /// This member's barrier phase; counts completed barrier episodes.
    sync_step: u64,
    scratch: *mut u8,
    scratch_len: usize,
}

impl<'a> TaskExec<'a> {
    /// Context for a lone worker: team of one, no scratch.
    pub(crate) fn solo() -> TaskExec<'static> {
        TaskExec {
            group_rank: 0,
            team_rank: 0,
            team_size: 1,
            barrier: None,
            sync_step: 0,
            scratch: std::ptr::null_mut(),
            scratch_len: 0,
        }
    }

    pub(crate) fn for_team(
        group_rank: usize,
        team_rank: usize,
        team_size: usize,
        barrier: &'a TeamBarrier,
        scratch: *mut u8,
        scratch_len: usize,
    ) -> TaskExec<'a> {
        TaskExec {
            group_rank,
            team_rank,
            team_size,
            barrier: Some(barrier),
            sync_step: 0,
            scratch,
            scratch_len,
        }
    }

    /// Which team of the worker pool this body runs in.
    pub fn group_rank(&self) -> usize {
        self.group_rank
    }

    /// This worker's rank within its team, in `0..team_size`.
    pub fn team_rank(&self) -> usize {
        self.team_rank
    }

    pub fn team_size(&self) -> usize {
        self.team_size
    }

    /// Whole-team rendezvous: every member enters before any member
    /// returns. A no-op for a team of one.
    pub fn team_barrier(&mut self) {
        if self.team_size > 1
            && let Some(barrier) = self.barrier
        {
            barrier.arrive(&mut self.sync_step);
        }
    }

    /// The team-shared scratch buffer, or null for a team of one.
    ///
    /// Mutable by team members only, with accesses ordered through
    /// [`team_barrier`](Self::team_barrier); 16-byte aligned.
    pub fn team_shared(&self) -> *mut u8 {
        self.scratch
    }

    pub fn team_shared_size(&self) -> usize {
        self.scratch_len
    }
}

/// Ticket barrier over a fixed team.
///
/// `sync_value` counts arrivals monotonically; the barrier's phase flips
/// every `size` arrivals. Each member tracks the phase it is waiting out in
/// its own `TaskExec`, so the counter is never reset and a straggler from
/// phase `n` cannot collide with an early arriver of phase `n + 1`.
pub(crate) struct TeamBarrier {
    size: usize,
    sync_value: AtomicU64,
}

impl TeamBarrier {
    pub(crate) fn new(size: usize) -> TeamBarrier {
        TeamBarrier {
            size,
            sync_value: AtomicU64::new(0),
        }
    }

    fn arrive(&self, sync_step: &mut u64) {
        *sync_step += 1;
        let target = *sync_step * self.size as u64;
        self.sync_value.fetch_add(1, Ordering::AcqRel);
        while self.sync_value.load(Ordering::Acquire) < target {
            std::hint::spin_loop();
        }
    }
}

/// Runs one popped task on this worker and, on the deciding member, routes
/// it onward.
///
/// Every member of a team calls this for a team task; members other than
/// rank 0 only run the body; the continuation decision, the completion (or
/// respawn re-entry) and the turn accounting are rank 0's alone, and no
/// member touches the record after its `apply` returns.
pub(crate) fn run_turn(queue: &TaskQueue, task: NonNull<TaskHeader>, exec: &mut TaskExec<'_>) {
    let apply = unsafe { task.as_ref() }
        .vtable
        .apply
        .expect("aggregate task can never be popped ready");

    // Safety: the task was popped ready exactly once; for team tasks the
    // cell's apply shim handles the members' concurrent entry.
    let applied = unsafe { apply(task, exec) };

    if exec.team_rank() != 0 {
        return;
    }

    match applied {
        Applied::Completed => queue.complete(task),
        Applied::Respawned => queue.schedule(task),
    }
    queue.finish_turn();
}
