//! Generic object pool (component C5), used here for packet recycling.
//!
//! ## Design
//!
//! A single `Mutex<PoolState<T>>` guards a cache of idle entities plus an
//! outstanding count; a `Condvar` wakes waiters when an entity is released or
//! the outstanding limit is raised. This is the same slot-dispatch shape used
//! elsewhere in this codebase for bounded concurrent resources — here
//! generalized from a fixed worker-thread pool to an on-demand recycler: a
//! pool entity's lifetime is "checked out, used, returned", not "owns a
//! dedicated OS thread".
//!
//! ## Thread safety
//!
//! `T` must be `Send` to cross from whichever thread released it back to
//! whichever thread next acquires it. No unsafe code.
//!
//! ## Outstanding limit
//!
//! An optional ceiling on concurrently checked-out entities. `acquire`
//! blocks (respecting an optional deadline) until the count drops back under
//! the limit; with no limit configured, a pool never blocks and always
//! either reuses a cached entity or constructs a fresh one.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::EngineError;

struct PoolState<T> {
    cached: VecDeque<T>,
    outstanding: usize,
    next_id: usize,
    torn_down: bool,
    limit: Option<usize>,
}

struct PoolInner<T> {
    state: Mutex<PoolState<T>>,
    not_at_limit: Condvar,
    idle: Condvar,
    init: Box<dyn Fn(usize) -> T + Send + Sync>,
    finalize: Box<dyn Fn(&mut T) + Send + Sync>,
}

/// A recycler for `T`, handing out [`PooledEntity`] guards that return their
/// value to the cache (after running the finalize hook) when dropped.
pub struct ObjectPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        ObjectPool { inner: self.inner.clone() }
    }
}

impl<T: Send + 'static> ObjectPool<T> {
    /// Builds an unbounded pool. `init(id)` constructs a fresh entity (`id`
    /// is a monotonically increasing, pool-local sequence number, useful for
    /// naming); `finalize(&mut entity)` runs once an entity is released,
    /// before it becomes available for reuse.
    pub fn new(
        init: impl Fn(usize) -> T + Send + Sync + 'static,
        finalize: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        ObjectPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    cached: VecDeque::new(),
                    outstanding: 0,
                    next_id: 0,
                    torn_down: false,
                    limit: None,
                }),
                not_at_limit: Condvar::new(),
                idle: Condvar::new(),
                init: Box::new(init),
                finalize: Box::new(finalize),
            }),
        }
    }

    /// Caps the number of entities concurrently checked out. `acquire` on a
    /// pool already at its limit blocks until a release brings the count
    /// back down.
    pub fn with_limit(self, limit: usize) -> Self {
        self.set_outstanding_limit(limit);
        self
    }

    /// Component-C5 `SetOutstandingLimit(n)`: reconfigures the concurrency
    /// ceiling at any point in the pool's life, not just before it is
    /// shared. `acquire` calls already blocked on the old limit are woken to
    /// re-check against the new one. A limit of `0` means no entity may ever
    /// be concurrently outstanding, so every `acquire` blocks (or times out,
    /// for `try_acquire_timeout`) until the limit is raised again.
    pub fn set_outstanding_limit(&self, limit: usize) {
        self.lock().limit = Some(limit);
        self.inner.not_at_limit.notify_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState<T>> {
        self.inner.state.lock().expect("object pool lock poisoned")
    }

    /// Checks out an entity, blocking indefinitely if the outstanding limit
    /// is currently reached.
    pub fn acquire(&self) -> Result<PooledEntity<T>, EngineError> {
        self.acquire_with_deadline(None)
    }

    /// Checks out an entity, failing with [`EngineError::NotRunning`] if the
    /// outstanding limit is still reached after `timeout` elapses.
    pub fn try_acquire_timeout(&self, timeout: Duration) -> Result<PooledEntity<T>, EngineError> {
        self.acquire_with_deadline(Some(Instant::now() + timeout))
    }

    fn acquire_with_deadline(
        &self,
        deadline: Option<Instant>,
    ) -> Result<PooledEntity<T>, EngineError> {
        let mut state = self.lock();
        loop {
            if state.torn_down {
                return Err(EngineError::NotRunning);
            }
            let at_limit = state.limit.is_some_and(|limit| state.outstanding >= limit);
            if !at_limit {
                break;
            }
            state = match deadline {
                None => self.inner.not_at_limit.wait(state).expect("object pool condvar poisoned"),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(EngineError::NotRunning);
                    }
                    let (guard, timed_out) = self
                        .inner
                        .not_at_limit
                        .wait_timeout(state, remaining)
                        .expect("object pool condvar poisoned");
                    if timed_out.timed_out() && guard.limit.is_some_and(|l| guard.outstanding >= l) {
                        return Err(EngineError::NotRunning);
                    }
                    guard
                }
            };
        }

        let value = match state.cached.pop_front() {
            Some(value) => value,
            None => {
                let id = state.next_id;
                state.next_id += 1;
                (self.inner.init)(id)
            }
        };
        state.outstanding += 1;

        Ok(PooledEntity { pool: self.clone(), value: Some(value) })
    }

    /// Number of entities currently checked out.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Number of idle entities available for immediate reuse.
    pub fn cached(&self) -> usize {
        self.lock().cached.len()
    }

    /// Drops every idle cached entity, e.g. in response to memory pressure.
    /// Entities currently checked out are unaffected.
    pub fn clear_cached_entities(&self) {
        self.lock().cached.clear();
    }

    /// Blocks until every checked-out entity has been released, then tears
    /// the pool down: subsequent `acquire` calls fail with
    /// [`EngineError::NotRunning`].
    pub fn rundown(&self) {
        debug!("object pool rundown: waiting for outstanding entities to drain");
        let mut state = self.lock();
        while state.outstanding > 0 {
            state = self.inner.idle.wait(state).expect("object pool condvar poisoned");
        }
        state.torn_down = true;
        state.cached.clear();
        debug!("object pool rundown complete");
    }

    fn release(&self, mut value: T) {
        let mut state = self.lock();
        (self.inner.finalize)(&mut value);
        state.outstanding -= 1;
        if !state.torn_down {
            state.cached.push_back(value);
        }
        if state.outstanding == 0 {
            self.inner.idle.notify_all();
        }
        self.inner.not_at_limit.notify_one();
    }
}

/// RAII guard for one checked-out pool entity. Returns the value to the pool
/// (after running the finalize hook) on drop.
pub struct PooledEntity<T: Send + 'static> {
    pool: ObjectPool<T>,
    value: Option<T>,
}

impl<T: Send + 'static> std::ops::Deref for PooledEntity<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled entity value taken before drop")
    }
}

impl<T: Send + 'static> std::ops::DerefMut for PooledEntity<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled entity value taken before drop")
    }
}

impl<T: Send + 'static> Drop for PooledEntity<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(value);
        }
    }
}
