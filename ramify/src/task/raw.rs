#![allow(unsafe_op_in_unsafe_fn)]

use crate::exec::TaskExec;
use crate::task::header::TaskHeader;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

/// Type-specific entry points of a task record. One static instance exists
/// per spawned functor/value pair, plus one shared by all aggregates.
pub(crate) struct TaskVtable {
    /// Runs the payload. `None` for aggregates, which have no body and
    /// complete when their last recorded predecessor does.
    pub(crate) apply: Option<unsafe fn(NonNull<TaskHeader>, &mut TaskExec<'_>) -> Applied>,

    /// Drops the typed payload and returns the block to the owning queue's
    /// pool. Called exactly once, when the reference count reaches zero.
    pub(crate) destroy: unsafe fn(NonNull<TaskHeader>),

    /// Clones the stored value into the out-pointer. `None` for aggregates.
    ///
    /// # Safety
    ///
    /// The out-pointer must be a `*mut V` for the exact value type of the
    /// cell; futures uphold this because a value-typed future is only ever
    /// created by the spawn that created the cell.
    pub(crate) read_value: Option<unsafe fn(NonNull<TaskHeader>, *mut ())>,
}

/// Outcome of one `apply` invocation, as observed by the driving worker.
pub(crate) enum Applied {
    Completed,
    Respawned,
}

/// Untyped handle to a task record.
///
/// Carries no reference count of its own; whoever holds a `RawTask` must be
/// covered by some counted reference (a future, the queue's hold, or a
/// dependence slot).
#[derive(Clone, Copy)]
pub(crate) struct RawTask {
    ptr: NonNull<TaskHeader>,
}

impl RawTask {
    pub(crate) fn new(ptr: NonNull<TaskHeader>) -> RawTask {
        RawTask { ptr }
    }

    pub(crate) fn ptr(&self) -> NonNull<TaskHeader> {
        self.ptr
    }

    pub(crate) fn header(&self) -> &TaskHeader {
        // Safety: a RawTask only exists while some counted reference keeps
        // the record alive.
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn ref_inc(&self) {
        self.header().ref_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reference_count(&self) -> u32 {
        self.header().ref_count.load(Ordering::Relaxed)
    }

    /// Releases one reference unit, destroying the record when it was the
    /// last one.
    pub(crate) fn drop_reference(self) {
        if self.header().ref_count.fetch_sub(1, Ordering::Release) == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            // Safety: the count reached zero, so this call owns the record.
            unsafe { (self.header().vtable.destroy)(self.ptr) };
        }
    }
}
