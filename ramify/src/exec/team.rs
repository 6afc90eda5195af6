//! Threaded driver: a scoped worker pool grouped into fixed teams.
//!
//! Workers live only for the duration of one `execute` call, the way the
//! original backend opens a parallel region per wait. Each team acts in
//! lockstep: rank 0 pops, publishes the task through the team's broadcast
//! slot, and the round is closed by a second barrier before the slot is
//! reused. Team tasks run on every member; single tasks run on rank 0 alone
//! with a solo context.

use crate::exec::{TaskExec, TeamBarrier, run_turn};
use crate::policy::TaskKind;
use crate::queue::TaskQueue;
use crate::task::header::TaskHeader;
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::debug;

/// Broadcast-slot value: no ready task this round, spin and retry.
const IDLE: usize = 0;

/// Broadcast-slot value: the queue is quiescent, workers shut down.
const SHUTDOWN: usize = usize::MAX;

pub(crate) fn execute(queue: &TaskQueue, workers: usize, team_size: usize, scratch_bytes: usize) {
    debug_assert!(workers > 0 && workers % team_size == 0);
    let teams: Vec<TeamState> = (0..workers / team_size)
        .map(|_| TeamState::new(team_size, scratch_bytes))
        .collect();

    debug!(workers, team_size, "execute");

    thread::scope(|scope| {
        for worker in 0..workers {
            let team = &teams[worker / team_size];
            thread::Builder::new()
                .name(format!("ramify-worker-{worker}"))
                .spawn_scoped(scope, move || {
                    team_loop(
                        queue,
                        team,
                        worker / team_size,
                        worker % team_size,
                        team_size,
                    )
                })
                .expect("failed to spawn worker thread");
        }
    });

    debug_assert!(queue.quiescent());
    debug!("execute quiescent");
}

fn team_loop(
    queue: &TaskQueue,
    team: &TeamState,
    group_rank: usize,
    team_rank: usize,
    team_size: usize,
) {
    let mut exec = TaskExec::for_team(
        group_rank,
        team_rank,
        team_size,
        &team.barrier,
        team.scratch_ptr(),
        team.scratch_bytes,
    );

    loop {
        if team_rank == 0 {
            let word = match queue.pop_ready() {
                Some(task) => task.as_ptr() as usize,
                None if queue.quiescent() => SHUTDOWN,
                None => IDLE,
            };
            team.slot.store(word, Ordering::Release);
        }

        // Publish the slot to the whole team.
        exec.team_barrier();

        match team.slot.load(Ordering::Acquire) {
            SHUTDOWN => return,
            IDLE => {
                // Quiescence locally suspected; yield before re-checking the
                // global counter.
                thread::yield_now();
            }
            word => {
                let task = unsafe { NonNull::new_unchecked(word as *mut TaskHeader) };
                if unsafe { task.as_ref() }.kind == TaskKind::Team {
                    run_turn(queue, task, &mut exec);
                } else if team_rank == 0 {
                    // Single tasks see a team of one and a no-op barrier.
                    let mut solo = TaskExec::solo();
                    run_turn(queue, task, &mut solo);
                }
            }
        }

        // Close the round: nobody re-reads the slot after this, so rank 0 is
        // free to overwrite it next iteration.
        exec.team_barrier();
    }
}

struct TeamState {
    barrier: TeamBarrier,
    /// Task pointer broadcast from rank 0, or `IDLE` / `SHUTDOWN`.
    slot: AtomicUsize,
    /// Team-shared scratch, 16-byte aligned via the `u128` backing.
    scratch: Box<[UnsafeCell<u128>]>,
    scratch_bytes: usize,
}

// Safety: scratch is written only by members of the owning team, and every
// access is ordered by the team barrier.
unsafe impl Sync for TeamState {}

impl TeamState {
    fn new(team_size: usize, scratch_bytes: usize) -> TeamState {
        let words = scratch_bytes.div_ceil(size_of::<u128>());
        TeamState {
            barrier: TeamBarrier::new(team_size),
            slot: AtomicUsize::new(IDLE),
            scratch: (0..words).map(|_| UnsafeCell::new(0)).collect(),
            scratch_bytes,
        }
    }

    fn scratch_ptr(&self) -> *mut u8 {
        self.scratch.as_ptr() as *mut u8
    }
}
