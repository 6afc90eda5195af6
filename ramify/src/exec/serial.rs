//! Inline driver for the serial flavor.

use crate::exec::{TaskExec, run_turn};
use crate::queue::TaskQueue;

/// Runs ready tasks on the calling thread until none remain.
///
/// With a single thread, an empty ready grid *is* quiescence. This is both
/// the serial `execute` and the recursive drain that spawn performs before
/// allocating: a task body that spawns re-enters here, so graph construction
/// can recurse through running tasks without exhausting the pool.
pub(crate) fn drain(queue: &TaskQueue) {
    let mut exec = TaskExec::solo();
    while let Some(task) = queue.pop_ready() {
        run_turn(queue, task, &mut exec);
    }
}
