//! The untyped task record header.
//!
//! Every live task is a single pool block whose first field is a
//! [`TaskHeader`]; the typed payload (functor and value stage, or an
//! aggregate's predecessor array) trails it. The header carries the whole
//! scheduling state: the atomic reference count, the waiter-list head and the
//! overloaded intrusive `next` word.
//!
//! # Reference counting
//!
//! A task is born with a count of two: one unit for the future returned by
//! spawn, one held by the queue until the task completes. Every dependence
//! pointer stored in a task (the `next` slot of a runnable task, each entry
//! of an aggregate's array) carries one additional unit on the pointee until
//! the slot is cleared. The count reaching zero destroys the record and
//! returns its block to the pool.
//!
//! # The `wait` and `next` words
//!
//! `wait` heads the intrusive list of tasks waiting on *this* task. It holds
//! [`END_TAG`] while the list is empty and open, a task address while
//! non-empty, and [`LOCK_TAG`] once the task has entered completion. The
//! unconditional swap to `LOCK_TAG` is the linearization point of
//! completion, after which no waiter may attach.
//!
//! `next` is overloaded by state, with at most one role active at a time:
//! the dependence slot while the task is being constructed or respawned, the
//! chain link while parked in a predecessor's waiter list, and the stack
//! link while sitting in a ready queue.

use crate::policy::{TaskKind, TaskPriority};
use crate::queue::TaskQueue;
use crate::task::raw::TaskVtable;
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Waiter-list head value: completion in progress, no waiter may attach.
///
/// Never a valid block address: the pool aligns every block to at least 64
/// bytes, so the top two `usize` values are unaddressable.
pub(crate) const LOCK_TAG: usize = usize::MAX;

/// Waiter-list head value: empty list, still accepting waiters.
pub(crate) const END_TAG: usize = usize::MAX - 1;

/// Vacant `next` word.
pub(crate) const NIL: usize = 0;

#[repr(C)]
pub(crate) struct TaskHeader {
    /// Owning queue. Not an owning pointer; the queue outlives every task it
    /// allocated by contract.
    pub(crate) queue: *const TaskQueue,

    /// Type-specific entry points: `apply` (absent for aggregates) and
    /// `destroy`.
    pub(crate) vtable: &'static TaskVtable,

    /// Waiter-list head: `END_TAG`, `LOCK_TAG`, or a `*mut TaskHeader`.
    pub(crate) wait: AtomicUsize,

    /// Overloaded intrusive link; see the module docs.
    pub(crate) next: AtomicUsize,

    pub(crate) ref_count: AtomicU32,

    /// Outstanding predecessors before scheduling resolves them; for
    /// aggregates, the length of the trailing predecessor array.
    pub(crate) dep_count: AtomicU32,

    /// Exact byte size handed back to the pool on destruction.
    pub(crate) alloc_size: u32,

    pub(crate) kind: TaskKind,

    /// Updated in place on respawn, only ever by the thread that currently
    /// owns the task's execution.
    pub(crate) priority: Cell<TaskPriority>,
}

// Safety: the raw pointers are navigated only under the scheduling protocol;
// the `priority` cell is written solely during the constructing and
// executing phases, both of which are exclusive to one thread.
unsafe impl Send for TaskHeader {}
unsafe impl Sync for TaskHeader {}

impl TaskHeader {
    pub(crate) fn new(
        queue: *const TaskQueue,
        vtable: &'static TaskVtable,
        kind: TaskKind,
        priority: TaskPriority,
        alloc_size: u32,
    ) -> TaskHeader {
        TaskHeader {
            queue,
            vtable,
            wait: AtomicUsize::new(END_TAG),
            next: AtomicUsize::new(NIL),
            // +1 for the future handed to the spawner, +1 for the queue's
            // hold released in `complete`.
            ref_count: AtomicU32::new(2),
            dep_count: AtomicU32::new(0),
            alloc_size,
            kind,
            priority: Cell::new(priority),
        }
    }

    pub(crate) fn is_aggregate(&self) -> bool {
        self.kind == TaskKind::Aggregate
    }

    /// True once the completion swap has happened. An acquire load, so a
    /// `true` result also publishes the task's stored value.
    pub(crate) fn is_complete(&self) -> bool {
        self.wait.load(Ordering::Acquire) == LOCK_TAG
    }

    /// Attempts to splice `waiter` onto this task's waiter list.
    ///
    /// Fails, leaving `waiter` untouched by this list, when the head is
    /// observed as `LOCK_TAG`: the task is completing and the caller must
    /// route `waiter` to a ready queue instead.
    pub(crate) fn try_push_waiter(&self, waiter: NonNull<TaskHeader>) -> bool {
        let waiter_next = unsafe { &waiter.as_ref().next };
        let mut head = self.wait.load(Ordering::Acquire);
        loop {
            if head == LOCK_TAG {
                waiter_next.store(NIL, Ordering::Relaxed);
                return false;
            }
            debug_assert_ne!(waiter.as_ptr() as usize, head, "task waiting on itself");
            waiter_next.store(head, Ordering::Relaxed);
            match self.wait.compare_exchange_weak(
                head,
                waiter.as_ptr() as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => head = observed,
            }
        }
    }

    /// The completion linearization point: seals the waiter list and returns
    /// the captured chain head (`END_TAG` when no task was waiting). The
    /// chain is private to the caller afterwards.
    pub(crate) fn lock_waiters(&self) -> usize {
        let chain = self.wait.swap(LOCK_TAG, Ordering::AcqRel);
        debug_assert_ne!(chain, LOCK_TAG, "task completed twice");
        chain
    }

    /// Stores a dependence in the vacant `next` slot. The pointer must carry
    /// an owned reference unit, released later by whoever clears the slot.
    pub(crate) fn set_dependence(&self, dep: NonNull<TaskHeader>) {
        debug_assert_eq!(self.next.load(Ordering::Relaxed), NIL);
        self.dep_count.store(1, Ordering::Relaxed);
        self.next.store(dep.as_ptr() as usize, Ordering::Relaxed);
    }

    /// Takes the dependence out of the `next` slot, transferring its
    /// reference unit to the caller.
    pub(crate) fn take_dependence(&self) -> Option<NonNull<TaskHeader>> {
        NonNull::new(self.next.swap(NIL, Ordering::Acquire) as *mut TaskHeader)
    }
}
