#![allow(unsafe_op_in_unsafe_fn)]

//! Typed task cell layouts.
//!
//! It is critical for the header to be the first field: the whole record is
//! referenced both as `*mut TaskCell<F, V>` and as `*mut TaskHeader`.

use crate::exec::TaskExec;
use crate::queue::TaskQueue;
use crate::task::header::TaskHeader;
use crate::task::raw::{Applied, TaskVtable};
use crate::task::{Continuation, Future};
use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A runnable task record: the header followed by the functor-or-value stage.
#[repr(C)]
pub(crate) struct TaskCell<F, V> {
    pub(crate) header: TaskHeader,
    stage: UnsafeCell<Stage<F, V>>,
}

/// Either the functor (until the task finishes) or its value (afterwards).
///
/// The functor survives respawns: it stays in `Running` until the body
/// returns [`Continuation::Done`].
enum Stage<F, V> {
    Running(F),
    Finished(V),
}

impl<F, V> TaskCell<F, V>
where
    F: Fn(&mut TaskExec<'_>) -> Continuation<V> + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    pub(crate) fn new(header: TaskHeader, functor: F) -> TaskCell<F, V> {
        TaskCell {
            header,
            stage: UnsafeCell::new(Stage::Running(functor)),
        }
    }

    pub(crate) fn vtable() -> &'static TaskVtable {
        &TaskVtable {
            apply: Some(Self::apply),
            destroy: Self::destroy,
            read_value: Some(Self::read_value),
        }
    }

    /// Runs the functor on the calling worker.
    ///
    /// Every member of a team runs this concurrently against the same cell;
    /// the functor is only ever touched through a shared reference, and the
    /// barrier below keeps the rank-0 stage write out of that window. Only
    /// rank 0 acts on the continuation; the other members' return values
    /// are dropped and their `Applied` is ignored by the driver.
    ///
    /// # Safety
    ///
    /// `ptr` must head a live `TaskCell<F, V>` in the Executing state.
    unsafe fn apply(ptr: NonNull<TaskHeader>, exec: &mut TaskExec<'_>) -> Applied {
        let cell = ptr.cast::<TaskCell<F, V>>();
        let continuation = {
            let stage = &*cell.as_ref().stage.get();
            match stage {
                Stage::Running(functor) => functor(exec),
                Stage::Finished(_) => unreachable!("completed task applied again"),
            }
        };

        // All members are done reading the functor once everyone arrives.
        exec.team_barrier();

        if exec.team_rank() != 0 {
            return Applied::Completed;
        }

        let header = ptr.as_ref();
        match continuation {
            Continuation::Done(value) => {
                *cell.as_ref().stage.get() = Stage::Finished(value);
                Applied::Completed
            }
            Continuation::Respawn { dep, priority } => {
                header.priority.set(priority);
                if let Some(dep) = dep.and_then(Future::into_raw) {
                    // The future's reference unit moves into the slot.
                    header.set_dependence(dep.ptr());
                } else {
                    header.dep_count.store(0, Ordering::Relaxed);
                }
                Applied::Respawned
            }
        }
    }

    /// # Safety
    ///
    /// Must only be called by the final `drop_reference`, which owns the
    /// record outright.
    unsafe fn destroy(ptr: NonNull<TaskHeader>) {
        let queue: *const TaskQueue = ptr.as_ref().queue;
        let size = ptr.as_ref().alloc_size as usize;
        std::ptr::drop_in_place(ptr.cast::<TaskCell<F, V>>().as_ptr());
        (*queue).deallocate(ptr.cast(), size);
    }

    /// # Safety
    ///
    /// The task must be complete (value published by the completion swap) and
    /// `out` must be a `*mut V`.
    unsafe fn read_value(ptr: NonNull<TaskHeader>, out: *mut ()) {
        let cell = ptr.cast::<TaskCell<F, V>>();
        match &*cell.as_ref().stage.get() {
            Stage::Finished(value) => out.cast::<V>().write(value.clone()),
            Stage::Running(_) => unreachable!("value read before completion"),
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregates: a bare header trailed by `dep_count` predecessor pointers.

pub(crate) static AGGREGATE_VTABLE: TaskVtable = TaskVtable {
    apply: None,
    destroy: destroy_aggregate,
    read_value: None,
};

/// Layout of an aggregate record for `narg` predecessors, and the byte offset
/// of the pointer array past the header.
pub(crate) fn aggregate_layout(narg: usize) -> (Layout, usize) {
    let (layout, offset) = Layout::new::<TaskHeader>()
        .extend(Layout::array::<AtomicPtr<TaskHeader>>(narg).expect("aggregate layout overflow"))
        .expect("aggregate layout overflow");
    (layout.pad_to_align(), offset)
}

/// The trailing predecessor array of an aggregate.
///
/// # Safety
///
/// `ptr` must head a live aggregate record whose array slots have been
/// initialized.
pub(crate) unsafe fn aggregate_dependences<'a>(
    ptr: NonNull<TaskHeader>,
) -> &'a [AtomicPtr<TaskHeader>] {
    let narg = ptr.as_ref().dep_count.load(Ordering::Relaxed) as usize;
    let (_, offset) = aggregate_layout(narg);
    let base = ptr.as_ptr().cast::<u8>().add(offset).cast();
    std::slice::from_raw_parts(base, narg)
}

/// # Safety
///
/// Must only be called by the final `drop_reference`. The predecessor slots
/// were already cleared (and their references released) by `complete`.
unsafe fn destroy_aggregate(ptr: NonNull<TaskHeader>) {
    let queue: *const TaskQueue = ptr.as_ref().queue;
    let size = ptr.as_ref().alloc_size as usize;
    (*queue).deallocate(ptr.cast(), size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_array_starts_past_the_header() {
        let (layout, offset) = aggregate_layout(4);
        assert!(offset >= size_of::<TaskHeader>());
        assert!(layout.size() >= offset + 4 * size_of::<AtomicPtr<TaskHeader>>());
    }

    #[test]
    fn header_is_first_field_of_the_cell() {
        // The scheduler casts freely between cell and header pointers.
        assert_eq!(std::mem::offset_of!(TaskCell<fn(), u64>, header), 0);
    }
}
