use crate::queue::TaskQueue;
use crate::task::raw::RawTask;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;

/// A reference-counted handle to a task, doubling as a dependence token.
///
/// A `Future` is produced by a spawn or by [`when_all`](crate::when_all) and
/// keeps its task record alive for as long as any handle exists. Cloning and
/// dropping go through the queue's assign primitive so every copy carries
/// exactly one reference unit; moves transfer the unit without touching the
/// counter.
///
/// The default value is the *null* future: it references nothing, anchors
/// nothing, and [`get`](Future::get) on it aborts. Spawns report pool
/// exhaustion by returning a null future.
pub struct Future<V = ()> {
    raw: Option<RawTask>,
    _value: PhantomData<V>,
}

impl<V> Future<V> {
    /// The null future.
    pub fn null() -> Future<V> {
        Future {
            raw: None,
            _value: PhantomData,
        }
    }

    pub(crate) fn from_raw(raw: RawTask) -> Future<V> {
        Future {
            raw: Some(raw),
            _value: PhantomData,
        }
    }

    /// Borrows the underlying record without touching the count.
    pub(crate) fn raw(&self) -> Option<RawTask> {
        self.raw
    }

    /// Transfers this handle's reference unit to the caller.
    pub(crate) fn into_raw(self) -> Option<RawTask> {
        let raw = self.raw;
        std::mem::forget(self);
        raw
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_none()
    }

    /// Number of live references to the task: one per future plus the
    /// queue's own hold while the task has not completed. Zero for the null
    /// future.
    pub fn reference_count(&self) -> u32 {
        self.raw.map_or(0, |raw| raw.reference_count())
    }

    /// This task, viewed as a bare dependence token.
    ///
    /// The token shares the reference count and completion state but carries
    /// no value; use it to aggregate futures of different value types or to
    /// hand a dependence to
    /// [`Continuation::respawn_after`](crate::Continuation::respawn_after).
    pub fn token(&self) -> Future<()> {
        if let Some(raw) = self.raw {
            raw.ref_inc();
            Future::from_raw(raw)
        } else {
            Future::null()
        }
    }

    /// Reads the task's value.
    ///
    /// Valid only once the task has completed: after a [`wait`](crate::wait)
    /// that covered it, or from a body that recorded it as a dependence.
    ///
    /// # Panics
    ///
    /// Panics if the future is null or the task has not completed.
    pub fn get(&self) -> V
    where
        V: Clone,
    {
        let Some(raw) = self.raw else {
            panic!("Future::get on a null future");
        };
        assert!(
            raw.header().is_complete(),
            "Future::get before the task completed"
        );

        if size_of::<V>() == 0 {
            // Dependence tokens and aggregate futures carry no bytes; their
            // sole inhabitant is materialized directly.
            return unsafe { MaybeUninit::<V>::zeroed().assume_init() };
        }

        let read = raw
            .header()
            .vtable
            .read_value
            .expect("value-typed future over an aggregate task");
        let mut out = MaybeUninit::<V>::uninit();
        // Safety: the record was created by a spawn parameterized over this
        // exact `V`, and `is_complete` above acquired the published value.
        unsafe {
            read(raw.ptr(), out.as_mut_ptr().cast());
            out.assume_init()
        }
    }
}

impl<V> Default for Future<V> {
    fn default() -> Self {
        Future::null()
    }
}

impl<V> Clone for Future<V> {
    fn clone(&self) -> Self {
        let mut slot = None;
        TaskQueue::assign(&mut slot, self.raw);
        Future {
            raw: slot,
            _value: PhantomData,
        }
    }
}

impl<V> Drop for Future<V> {
    fn drop(&mut self) {
        TaskQueue::assign(&mut self.raw, None);
    }
}

impl<V> fmt::Debug for Future<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw {
            Some(raw) => write!(f, "Future({:p})", raw.ptr()),
            None => write!(f, "Future(null)"),
        }
    }
}

// Safety: the handle moves the value out with `get` (requiring `V: Send` at
// spawn) and shares `&V` across readers only when `V: Sync`.
unsafe impl<V: Send> Send for Future<V> {}
unsafe impl<V: Send + Sync> Sync for Future<V> {}
