//! Scheduler construction and the typed spawn entry points.

use crate::exec::ExecFlavor;
use crate::policy::{TaskKind, TaskPolicy, TaskPriority};
use crate::pool::{DEFAULT_LOG2_SUPERBLOCK, MemoryPool};
use crate::queue::TaskQueue;
use crate::task::cell::{AGGREGATE_VTABLE, TaskCell, aggregate_layout};
use crate::task::header::TaskHeader;
use crate::task::raw::RawTask;
use crate::task::{Continuation, Future};
use anyhow::{Result, ensure};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use tracing::debug;

/// Default pool capacity: 1 MiB of task records.
const DEFAULT_CAPACITY_BYTES: usize = 1 << 20;

/// Default team-shared scratch per team.
const DEFAULT_TEAM_SCRATCH_BYTES: usize = 2048;

#[derive(Debug, Clone, Copy)]
enum Kind {
    Serial,
    Threaded,
}

/// Configures and builds a [`TaskScheduler`].
///
/// Two flavors exist. The *serial* flavor runs every task inline on the
/// thread calling [`wait`](crate::wait), and drains ready tasks recursively
/// inside spawn, see [`host_spawn`](crate::host_spawn). The *threaded*
/// flavor spins up `worker_threads` workers per wait, grouped into teams of
/// `team_size`.
#[derive(Debug)]
pub struct Builder {
    kind: Kind,
    worker_threads: Option<usize>,
    team_size: usize,
    capacity_bytes: usize,
    log2_superblock: u32,
    team_scratch_bytes: usize,
}

impl Builder {
    fn new(kind: Kind) -> Builder {
        Builder {
            kind,
            worker_threads: None,
            team_size: 1,
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            log2_superblock: DEFAULT_LOG2_SUPERBLOCK,
            team_scratch_bytes: DEFAULT_TEAM_SCRATCH_BYTES,
        }
    }

    /// Returns a new builder with the serial flavor selected.
    pub fn new_serial() -> Builder {
        Builder::new(Kind::Serial)
    }

    /// Returns a new builder with the threaded flavor selected.
    pub fn new_threaded() -> Builder {
        Builder::new(Kind::Threaded)
    }

    /// Sets the number of worker threads driving each wait.
    ///
    /// Defaults to one worker per CPU core. Ignored by the serial flavor.
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the team size for team tasks. Must divide the worker count
    /// exactly. Defaults to 1.
    pub fn team_size(mut self, val: usize) -> Self {
        assert!(val > 0, "team size cannot be set to 0");
        self.team_size = val;
        self
    }

    /// Sets the memory-pool capacity in bytes; every task record lives in
    /// this pool and spawns fail with a null future once it is exhausted.
    pub fn capacity_bytes(mut self, val: usize) -> Self {
        self.capacity_bytes = val;
        self
    }

    /// Sets the pool's superblock exponent; blocks larger than
    /// `1 << log2_superblock` bytes are unallocatable.
    pub fn log2_superblock(mut self, val: u32) -> Self {
        self.log2_superblock = val;
        self
    }

    /// Sets the per-team scratch-buffer size visible through
    /// [`TaskExec::team_shared`](crate::TaskExec::team_shared).
    pub fn team_scratch_bytes(mut self, val: usize) -> Self {
        self.team_scratch_bytes = val;
        self
    }

    /// Creates the configured scheduler, validating the worker and pool
    /// shape.
    pub fn try_build(self) -> Result<TaskScheduler> {
        let flavor = match self.kind {
            Kind::Serial => ExecFlavor::Serial,
            Kind::Threaded => {
                let workers = match self.worker_threads {
                    Some(n) => n,
                    None => std::thread::available_parallelism()?.get(),
                };
                ensure!(
                    workers.is_multiple_of(self.team_size),
                    "team size {} does not divide the worker count {}",
                    self.team_size,
                    workers
                );
                ExecFlavor::Threaded {
                    workers,
                    team_size: self.team_size,
                    scratch_bytes: self.team_scratch_bytes,
                }
            }
        };

        let pool = MemoryPool::try_new(self.capacity_bytes, self.log2_superblock)?;
        debug!(?flavor, capacity = pool.capacity(), "scheduler built");

        Ok(TaskScheduler {
            queue: Arc::new(TaskQueue::new(pool, flavor)),
        })
    }
}

/// Shared handle to one task queue and its memory pool.
///
/// Cheap to clone; all clones drive the same queue. Tasks must not outlive
/// the queue they were allocated from: drop (or complete and drop) every
/// [`Future`] before the last scheduler clone goes away.
#[derive(Clone)]
pub struct TaskScheduler {
    queue: Arc<TaskQueue>,
}

impl TaskScheduler {
    pub(crate) fn queue_ptr(&self) -> *const TaskQueue {
        Arc::as_ptr(&self.queue)
    }

    /// Runs the queue to quiescence; see [`wait`](crate::wait).
    pub fn wait(&self) {
        self.queue.execute();
    }

    // ----- allocation-size queries ----------------------------------------

    /// The pool block size a spawn of `functor` would occupy, or `None` when
    /// the record cannot fit a superblock.
    pub fn spawn_allocation_size<F, V>(&self, _functor: &F) -> Option<usize>
    where
        F: Fn(&mut crate::exec::TaskExec<'_>) -> Continuation<V> + Send + Sync + 'static,
        V: Clone + Send + 'static,
    {
        self.queue.allocate_block_size(size_of::<TaskCell<F, V>>())
    }

    /// The pool block size a `when_all` over `narg` futures would occupy.
    pub fn when_all_allocation_size(&self, narg: usize) -> Option<usize> {
        self.queue.allocate_block_size(aggregate_layout(narg).0.size())
    }

    // ----- introspection ---------------------------------------------------

    /// Total bytes owned by the scheduler's memory pool.
    pub fn allocation_capacity(&self) -> usize {
        self.queue.allocation_capacity()
    }

    /// Task records currently live (spawned and not yet destroyed).
    pub fn allocated_task_count(&self) -> u32 {
        self.queue.allocated_task_count()
    }

    /// High-water mark of [`allocated_task_count`](Self::allocated_task_count).
    pub fn allocated_task_count_max(&self) -> u32 {
        self.queue.allocated_task_count_max()
    }

    /// Lifetime total of successful spawns.
    pub fn allocated_task_count_accum(&self) -> u64 {
        self.queue.allocated_task_count_accum()
    }
}

// ----- spawn and when_all ---------------------------------------------------

/// The spawn workhorse behind [`host_spawn`](crate::host_spawn) and
/// [`task_spawn`](crate::task_spawn).
pub(crate) fn spawn<F, V>(policy: TaskPolicy<'_>, functor: F) -> Future<V>
where
    F: Fn(&mut crate::exec::TaskExec<'_>) -> Continuation<V> + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    let TaskPolicy {
        anchor,
        kind,
        priority,
    } = policy;
    debug_assert_ne!(kind, TaskKind::Aggregate);

    let Some(queue_ptr) = anchor.queue else {
        panic!("spawn without a scheduler or a non-null future to anchor onto");
    };
    // Safety: the anchor borrows the scheduler or a future whose task holds
    // the queue alive.
    let queue = unsafe { &*queue_ptr };

    // Give the serial flavor an opportunity to clear ready tasks before
    // allocating; queued user tasks may run inline here.
    queue.iff_single_thread_recursive_execute();

    let size = size_of::<TaskCell<F, V>>();
    let Some(block) = queue.allocate(size) else {
        return Future::null();
    };

    let header = TaskHeader::new(
        queue_ptr,
        TaskCell::<F, V>::vtable(),
        kind,
        priority,
        size as u32,
    );
    let cell = block.cast::<TaskCell<F, V>>();
    unsafe { cell.as_ptr().write(TaskCell::new(header, functor)) };

    let raw = RawTask::new(cell.cast::<TaskHeader>());
    if let Some(dep) = anchor.dependence {
        // The slot's reference unit, released when schedule clears it.
        dep.ref_inc();
        raw.header().set_dependence(dep.ptr());
    }

    queue.schedule(raw.ptr());
    // The task may execute or complete at any moment from here on.
    Future::from_raw(raw)
}

/// The aggregate constructor behind [`when_all`](crate::when_all).
pub(crate) fn when_all<V>(futures: &[Future<V>]) -> Future<()> {
    if futures.is_empty() {
        return Future::null();
    }
    let Some(queue_ptr) = futures
        .iter()
        .find_map(Future::raw)
        .map(|raw| raw.header().queue)
    else {
        panic!("when_all without a non-null future to anchor onto");
    };
    let queue = unsafe { &*queue_ptr };

    let narg = futures.len();
    let (layout, offset) = aggregate_layout(narg);
    let Some(block) = queue.allocate(layout.size()) else {
        return Future::null();
    };

    let header = TaskHeader::new(
        queue_ptr,
        &AGGREGATE_VTABLE,
        TaskKind::Aggregate,
        TaskPriority::Regular,
        layout.size() as u32,
    );
    unsafe { block.cast::<TaskHeader>().as_ptr().write(header) };

    let raw = RawTask::new(block.cast::<TaskHeader>());
    raw.header().dep_count.store(narg as u32, Ordering::Relaxed);

    // Capture the predecessors, each carrying a reference unit so the inputs
    // may be dropped the moment this call returns.
    let slots = unsafe {
        block
            .as_ptr()
            .add(offset)
            .cast::<AtomicPtr<TaskHeader>>()
    };
    for (i, future) in futures.iter().enumerate() {
        let dep = match future.raw() {
            Some(dep) => {
                dep.ref_inc();
                dep.ptr().as_ptr()
            }
            None => std::ptr::null_mut(),
        };
        unsafe { slots.add(i).write(AtomicPtr::new(dep)) };
    }

    queue.schedule(raw.ptr());
    // This aggregate may be resolved at any moment from here on.
    Future::from_raw(raw)
}
