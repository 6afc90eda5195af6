//! The scheduler core: ready queues and the schedule/complete protocol.
//!
//! One `TaskQueue` is shared by every worker of an execution. Ready tasks
//! sit in a priority-by-kind grid of intrusive LIFO stacks threaded through
//! the tasks' own `next` words; waiting tasks are parked in their
//! predecessor's waiter list. All mutation is lock-free CAS.
//!
//! Quiescence is tracked by a single counter covering tasks that are ready
//! or executing. Waiting tasks are excluded on purpose: a waiting task
//! always has a ready-or-executing predecessor responsible for waking it,
//! so the counter reaching zero means no task can ever run again.

use crate::exec::{self, ExecFlavor};
use crate::policy::{NUM_PRIORITIES, NUM_RUNNABLE_KINDS};
use crate::pool::MemoryPool;
use crate::task::cell::aggregate_dependences;
use crate::task::header::{END_TAG, LOCK_TAG, NIL, TaskHeader};
use crate::task::raw::RawTask;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::trace;

pub(crate) struct TaskQueue {
    /// Ready tasks, keyed by priority then kind. Aggregates are resolved
    /// inline by `schedule` and never appear here.
    ready: [[ReadyStack; NUM_RUNNABLE_KINDS]; NUM_PRIORITIES],

    /// Tasks currently ready or executing. Zero means quiescent.
    ready_count: AtomicU32,

    pool: MemoryPool,

    flavor: ExecFlavor,

    /// Live task records.
    count_alloc: AtomicU32,
    /// High-water mark of `count_alloc`.
    max_alloc: AtomicU32,
    /// Lifetime total of successful allocations.
    accum_alloc: AtomicU64,
}

impl TaskQueue {
    pub(crate) fn new(pool: MemoryPool, flavor: ExecFlavor) -> TaskQueue {
        TaskQueue {
            ready: std::array::from_fn(|_| std::array::from_fn(|_| ReadyStack::new())),
            ready_count: AtomicU32::new(0),
            pool,
            flavor,
            count_alloc: AtomicU32::new(0),
            max_alloc: AtomicU32::new(0),
            accum_alloc: AtomicU64::new(0),
        }
    }

    // ----- allocation ------------------------------------------------------

    /// Allocates one task record of `size` bytes, or `None` on exhaustion.
    pub(crate) fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let block = self.pool.allocate(size)?;
        let live = self.count_alloc.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_alloc.fetch_max(live, Ordering::Relaxed);
        self.accum_alloc.fetch_add(1, Ordering::Relaxed);
        Some(block)
    }

    pub(crate) fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        self.pool.deallocate(ptr, size);
        self.count_alloc.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn allocate_block_size(&self, size: usize) -> Option<usize> {
        self.pool.allocate_block_size(size)
    }

    // ----- reference hygiene ----------------------------------------------

    /// Rebinds `slot` to `value`, balancing reference counts: the new
    /// referent gains a unit before the old one loses its own, so
    /// self-assignment is harmless. Dropping the last unit destroys the
    /// record.
    pub(crate) fn assign(slot: &mut Option<RawTask>, value: Option<RawTask>) {
        if let Some(new) = value {
            new.ref_inc();
        }
        if let Some(old) = slot.take() {
            old.drop_reference();
        }
        *slot = value;
    }

    // ----- the scheduling protocol ----------------------------------------

    /// Enters a task into the scheduler.
    ///
    /// Called in exactly three states: freshly constructed (from a spawn),
    /// executing-respawn (from the driver after the body asked to go
    /// around), and just-woken (from a predecessor's `complete`). In every
    /// case the caller is the sole owner of the task's scheduling, so the
    /// reads of the dependence slot and priority below are unracing.
    pub(crate) fn schedule(&self, task: NonNull<TaskHeader>) {
        let header = unsafe { task.as_ref() };
        if header.is_aggregate() {
            self.schedule_aggregate(task);
            return;
        }

        let ready = match header.take_dependence() {
            None => true,
            Some(dep) => {
                let parked = unsafe { dep.as_ref() }.try_push_waiter(task);
                if !parked {
                    // The predecessor already completed; nothing outstanding.
                    header.dep_count.store(0, Ordering::Relaxed);
                }
                // The slot's reference unit is spent either way.
                RawTask::new(dep).drop_reference();
                !parked
            }
        };

        if ready {
            trace!(task = ?task.as_ptr(), "ready");
            self.push_ready(task);
        } else {
            trace!(task = ?task.as_ptr(), "waiting");
        }
    }

    /// Aggregate scheduling: park on the first incomplete predecessor, or
    /// complete outright when every splice attempt finds a sealed waiter
    /// list. Re-entered on every wake-up, re-scanning from the front.
    fn schedule_aggregate(&self, task: NonNull<TaskHeader>) {
        let deps = unsafe { aggregate_dependences(task) };
        for dep in deps {
            let Some(dep) = NonNull::new(dep.load(Ordering::Acquire)) else {
                continue;
            };
            if unsafe { dep.as_ref() }.try_push_waiter(task) {
                trace!(task = ?task.as_ptr(), on = ?dep.as_ptr(), "aggregate waiting");
                return;
            }
        }
        // Every recorded predecessor has completed.
        self.complete(task);
    }

    /// Completion: seal the waiter list, wake every waiter, release the
    /// queue's hold.
    pub(crate) fn complete(&self, task: NonNull<TaskHeader>) {
        let header = unsafe { task.as_ref() };
        trace!(task = ?task.as_ptr(), "complete");

        // Linearization point: from here on, schedule() routes would-be
        // waiters straight to the ready queues.
        let mut chain = header.lock_waiters();

        if header.is_aggregate() {
            // Release the references held by the captured predecessor array.
            for dep in unsafe { aggregate_dependences(task) } {
                if let Some(dep) = NonNull::new(dep.swap(std::ptr::null_mut(), Ordering::AcqRel)) {
                    RawTask::new(dep).drop_reference();
                }
            }
        }

        // The chain is private now; wake each captured waiter.
        while chain != END_TAG {
            debug_assert_ne!(chain, NIL);
            let waiter = unsafe { NonNull::new_unchecked(chain as *mut TaskHeader) };
            let waiter_header = unsafe { waiter.as_ref() };
            chain = waiter_header.next.swap(NIL, Ordering::Acquire);

            if !waiter_header.is_aggregate() {
                let outstanding = waiter_header.dep_count.fetch_sub(1, Ordering::AcqRel);
                debug_assert_eq!(outstanding, 1, "runnable task parked on several tasks");
            }
            self.schedule(waiter);
        }

        // The queue's own hold, taken at spawn, is released exactly once.
        RawTask::new(task).drop_reference();
    }

    // ----- ready queues ----------------------------------------------------

    fn push_ready(&self, task: NonNull<TaskHeader>) {
        let header = unsafe { task.as_ref() };
        let kind = header.kind as usize;
        let priority = header.priority.get() as usize;
        debug_assert!(kind < NUM_RUNNABLE_KINDS, "aggregate pushed ready");

        // Count before publishing so no observer can see the queue quiescent
        // while this task is in flight.
        self.ready_count.fetch_add(1, Ordering::AcqRel);
        self.ready[priority][kind].push(task);
    }

    /// Pops the highest-priority ready task, preferring team work over
    /// single work within a class.
    pub(crate) fn pop_ready(&self) -> Option<NonNull<TaskHeader>> {
        for row in &self.ready {
            for stack in row {
                if let Some(task) = stack.pop() {
                    return Some(task);
                }
            }
        }
        None
    }

    /// Ends a popped task's turn. Called after `complete` or the respawn
    /// re-`schedule`, so the counter never dips to zero while this task's
    /// successors are still unpublished.
    pub(crate) fn finish_turn(&self) {
        let prev = self.ready_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    pub(crate) fn quiescent(&self) -> bool {
        self.ready_count.load(Ordering::Acquire) == 0
    }

    // ----- execution -------------------------------------------------------

    /// Drives workers until quiescence: both ready columns empty and no
    /// task executing.
    pub(crate) fn execute(&self) {
        match self.flavor {
            ExecFlavor::Serial => exec::serial::drain(self),
            ExecFlavor::Threaded {
                workers,
                team_size,
                scratch_bytes,
            } => exec::team::execute(self, workers, team_size, scratch_bytes),
        }
    }

    /// On the serial flavor, drain ready tasks inline; a no-op otherwise.
    ///
    /// Spawn calls this before allocating, which lets a serial execution
    /// recycle completed records while a task graph is being built
    /// recursively, instead of deadlocking on a full pool.
    pub(crate) fn iff_single_thread_recursive_execute(&self) {
        if matches!(self.flavor, ExecFlavor::Serial) {
            exec::serial::drain(self);
        }
    }

    // ----- introspection ---------------------------------------------------

    pub(crate) fn allocation_capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub(crate) fn allocated_task_count(&self) -> u32 {
        self.count_alloc.load(Ordering::Relaxed)
    }

    pub(crate) fn allocated_task_count_max(&self) -> u32 {
        self.max_alloc.load(Ordering::Relaxed)
    }

    pub(crate) fn allocated_task_count_accum(&self) -> u64 {
        self.accum_alloc.load(Ordering::Relaxed)
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.allocated_task_count(),
            0,
            "task queue dropped while futures were still live"
        );
    }
}

/// An intrusive LIFO stack of ready tasks, linked through their `next`
/// words.
///
/// `pop` briefly parks `LOCK_TAG` in the head while it unlinks, which
/// serializes concurrent pops and makes the two-step unlink immune to ABA;
/// `push` spins those windows out. The lock never propagates into a task's
/// own state, so a pusher is delayed a few instructions at worst.
struct ReadyStack {
    head: AtomicUsize,
}

impl ReadyStack {
    fn new() -> ReadyStack {
        ReadyStack {
            head: AtomicUsize::new(END_TAG),
        }
    }

    fn push(&self, task: NonNull<TaskHeader>) {
        let task_next = unsafe { &task.as_ref().next };
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == LOCK_TAG {
                std::hint::spin_loop();
                head = self.head.load(Ordering::Acquire);
                continue;
            }
            task_next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                task.as_ptr() as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    fn pop(&self) -> Option<NonNull<TaskHeader>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == END_TAG {
                return None;
            }
            if head == LOCK_TAG {
                std::hint::spin_loop();
                head = self.head.load(Ordering::Acquire);
                continue;
            }
            match self
                .head
                .compare_exchange_weak(head, LOCK_TAG, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // The stack is ours until the store below.
                    let task = unsafe { NonNull::new_unchecked(head as *mut TaskHeader) };
                    let next = unsafe { task.as_ref() }.next.swap(NIL, Ordering::Relaxed);
                    self.head.store(next, Ordering::Release);
                    return Some(task);
                }
                Err(observed) => head = observed,
            }
        }
    }
}
