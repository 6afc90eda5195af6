//! Range sugar over a team: split an index range across the members of the
//! team running the current task.
//!
//! Members take indices cyclically (`team_rank`, `team_rank + team_size`,
//! …), and the collective operations stage per-member partials in the
//! team-shared scratch between barriers. All of these are plain loops for a
//! team of one, so they are safe to call from single tasks too.
//!
//! Partials are staged by value in raw scratch, hence the `Copy` bounds.

use crate::exec::TaskExec;
use std::ops::Range;

/// The slice of `range` owned by this member: a cyclic stride over the team.
pub fn team_range(exec: &TaskExec<'_>, range: Range<usize>) -> impl Iterator<Item = usize> {
    let start = range.start + exec.team_rank();
    let step = exec.team_size();
    (start..range.end).step_by(step)
}

/// Calls `body(i)` for every `i` in `range`, spread across the team.
///
/// No barrier is implied: members return independently.
pub fn parallel_for<F>(exec: &TaskExec<'_>, range: Range<usize>, mut body: F)
where
    F: FnMut(usize),
{
    for i in team_range(exec, range) {
        body(i);
    }
}

/// Sum-reduces `body`'s contributions over `range` across the team.
///
/// Every member receives the reduced value.
pub fn parallel_reduce<T, F>(exec: &mut TaskExec<'_>, range: Range<usize>, init: T, body: F) -> T
where
    T: Copy + std::ops::AddAssign + Send,
    F: FnMut(usize, &mut T),
{
    parallel_reduce_join(exec, range, init, body, |into, from| *into += *from)
}

/// Reduces `body`'s contributions over `range` across the team with a
/// caller-supplied `join`.
///
/// Every member receives the reduced value.
pub fn parallel_reduce_join<T, F, J>(
    exec: &mut TaskExec<'_>,
    range: Range<usize>,
    init: T,
    mut body: F,
    join: J,
) -> T
where
    T: Copy + Send,
    F: FnMut(usize, &mut T),
    J: Fn(&mut T, &T),
{
    let mut local = init;
    for i in team_range(exec, range.clone()) {
        body(i, &mut local);
    }

    let team_size = exec.team_size();
    if team_size == 1 {
        return local;
    }

    let rank = exec.team_rank();
    let shared = shared_slots::<T>(exec);

    exec.team_barrier();
    unsafe { shared.add(rank).write(local) };
    exec.team_barrier();

    if rank == 0 {
        for member in 1..team_size {
            let partial = unsafe { shared.add(member).read() };
            unsafe {
                let slot = &mut *shared;
                join(slot, &partial);
            }
        }
    }
    exec.team_barrier();

    unsafe { shared.read() }
}

/// Inclusive-exclusive scan over `range` across the team.
///
/// `body(i, value, is_final)` is called twice per index: once with
/// `is_final == false` to accumulate the index's contribution into `value`,
/// and once with `is_final == true` where `value` holds the exclusive prefix
/// for `i`.
pub fn parallel_scan<T, F>(exec: &mut TaskExec<'_>, range: Range<usize>, mut body: F)
where
    T: Copy + Default + std::ops::AddAssign + Send,
    F: FnMut(usize, &mut T, bool),
{
    // First pass: each member totals its own indices.
    let mut accum = T::default();
    for i in team_range(exec, range.clone()) {
        let mut contribution = T::default();
        body(i, &mut contribution, false);
        accum += contribution;
    }

    let team_size = exec.team_size();
    let rank = exec.team_rank();

    if team_size > 1 {
        let shared = shared_slots::<T>(exec);

        // Per-rank slots are disjoint; only the read-back needs ordering.
        unsafe { shared.add(rank).write(accum) };
        exec.team_barrier();

        // Rank 0 scans the member totals in place.
        if rank == 0 {
            for member in 1..team_size {
                let prev = unsafe { shared.add(member - 1).read() };
                unsafe { (*shared.add(member)) += prev };
            }
        }
        exec.team_barrier();

        // A member's offset is the running total of the members before it.
        accum = if rank == 0 {
            T::default()
        } else {
            unsafe { shared.add(rank - 1).read() }
        };
    } else {
        accum = T::default();
    }

    // Second pass: replay with the inter-member offset folded in.
    for i in team_range(exec, range) {
        let mut contribution = T::default();
        body(i, &mut contribution, false);
        let mut prefix = accum;
        body(i, &mut prefix, true);
        accum += contribution;
    }
}

/// The team scratch viewed as one staging slot per member.
fn shared_slots<T: Copy>(exec: &TaskExec<'_>) -> *mut T {
    let needed = exec.team_size() * size_of::<T>();
    assert!(
        exec.team_shared_size() >= needed,
        "team scratch of {} bytes cannot stage {} bytes of partials",
        exec.team_shared_size(),
        needed,
    );
    let shared = exec.team_shared();
    assert!(shared.addr() % align_of::<T>() == 0, "team scratch misaligned");
    shared.cast::<T>()
}
