// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded worker pool: concurrent dispatch with admission control,
//! a stuck-worker watchdog, and a batch join policy.
//!
//! The pool is agnostic to what a work item is. The launch engine hands
//! it one request per node; anything `Send` with a work function works.

use crate::error::LaunchError;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Ceiling on concurrently running workers
    pub max_threads: usize,
    /// Admission waits re-check (and run the watchdog) at this interval
    pub admission_tick: Duration,
    /// Active workers older than this are reported by the watchdog
    pub stuck_after: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_threads: 10,
            admission_tick: Duration::from_secs(1),
            stuck_after: Duration::from_secs(10),
        }
    }
}

/// Terminal result of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    New,
    Active,
    Done,
    Failed,
    Joined,
}

struct Slot {
    state: SlotState,
    started: Option<Instant>,
    handle: Option<JoinHandle<()>>,
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    cond: Condvar,
}

struct PoolInner {
    active: usize,
    joinable: usize,
    failed: usize,
    slots: Vec<Slot>,
    /// Stuck observations, for the watchdog's report
    stuck_seen: usize,
}

/// What `dispatch` did with the request array.
pub struct DispatchReport<T> {
    /// Workers spawned (and joined)
    pub admitted: usize,
    /// Workers that returned [`WorkerOutcome::Failed`]
    pub failed: usize,
    /// Items never admitted because the stop condition fired first,
    /// paired with their position in the input array
    pub skipped: Vec<(usize, T)>,
}

/// Bounded concurrent dispatcher.
pub struct WorkerPool {
    cfg: PoolConfig,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(cfg: PoolConfig) -> Self {
        let shared = Arc::new(PoolShared {
            inner: Mutex::new(PoolInner {
                active: 0,
                joinable: 0,
                failed: 0,
                slots: Vec::new(),
                stuck_seen: 0,
            }),
            cond: Condvar::new(),
        });
        Self { cfg, shared }
    }

    /// Dispatch one worker per item, never exceeding `max_threads`
    /// concurrently, and join every spawned worker before returning.
    ///
    /// `should_stop` is polled at each admission; once it reports true,
    /// the remaining items are returned unlaunched in the report. A
    /// thread-spawn failure is unrecoverable and aborts the dispatch
    /// with [`LaunchError::FatalInternal`] after draining live workers.
    pub fn dispatch<T, F>(
        &self,
        items: Vec<T>,
        work: F,
        should_stop: impl Fn() -> bool,
    ) -> Result<DispatchReport<T>, LaunchError>
    where
        T: Send + 'static,
        F: Fn(T) -> WorkerOutcome + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let mut admitted = 0usize;
        let mut skipped = Vec::new();

        {
            let mut inner = self.shared.inner.lock();
            inner.slots = items
                .iter()
                .map(|_| Slot { state: SlotState::New, started: None, handle: None })
                .collect();
        }

        let mut iter = items.into_iter().enumerate();
        for (index, item) in iter.by_ref() {
            if should_stop() {
                skipped.push((index, item));
                break;
            }

            let mut inner = self.shared.inner.lock();
            let mut stopped = false;
            while inner.active >= self.cfg.max_threads {
                self.wait_on_active(&mut inner);
                if should_stop() {
                    stopped = true;
                    break;
                }
            }
            if stopped {
                drop(inner);
                skipped.push((index, item));
                break;
            }

            if inner.joinable >= (self.cfg.max_threads / 2).max(1) {
                Self::join_finished(&mut inner);
            }

            inner.active += 1;
            drop(inner);

            match self.spawn_worker(index, item, Arc::clone(&work)) {
                Ok(handle) => {
                    let mut inner = self.shared.inner.lock();
                    inner.slots[index].handle = Some(handle);
                    admitted += 1;
                }
                Err(err) => {
                    self.shared.inner.lock().active -= 1;
                    self.drain();
                    tracing::error!(error = %err, "worker thread spawn failed");
                    return Err(LaunchError::FatalInternal(format!(
                        "worker thread spawn failed: {}",
                        err
                    )));
                }
            }
        }

        // anything left after a stop is skipped, not dispatched
        skipped.extend(iter);

        self.drain();

        let inner = self.shared.inner.lock();
        Ok(DispatchReport { admitted, failed: inner.failed, skipped })
    }

    /// Workers that returned `Failed` so far.
    pub fn fail_count(&self) -> usize {
        self.shared.inner.lock().failed
    }

    /// Stuck-worker observations made by the watchdog.
    pub fn stuck_observations(&self) -> usize {
        self.shared.inner.lock().stuck_seen
    }

    fn spawn_worker<T, F>(
        &self,
        index: usize,
        item: T,
        work: Arc<F>,
    ) -> std::io::Result<JoinHandle<()>>
    where
        T: Send + 'static,
        F: Fn(T) -> WorkerOutcome + Send + Sync + 'static,
    {
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new().name(format!("launch-{}", index)).spawn(move || {
            {
                let mut inner = shared.inner.lock();
                inner.slots[index].state = SlotState::Active;
                inner.slots[index].started = Some(Instant::now());
            }

            let outcome = work(item);

            let mut inner = shared.inner.lock();
            inner.slots[index].state = match outcome {
                WorkerOutcome::Done => SlotState::Done,
                WorkerOutcome::Failed => {
                    inner.failed += 1;
                    SlotState::Failed
                }
            };
            inner.active -= 1;
            inner.joinable += 1;
            shared.cond.notify_all();
        })
    }

    /// One bounded admission wait. A timed-out wait runs the watchdog
    /// scan over the active slots.
    fn wait_on_active(&self, inner: &mut MutexGuard<'_, PoolInner>) {
        let deadline = Instant::now() + self.cfg.admission_tick;
        if self.shared.cond.wait_until(inner, deadline).timed_out() {
            Self::scan_stuck(inner, self.cfg.stuck_after);
        }
    }

    /// Join completed-but-not-joined workers, reclaiming their slots.
    ///
    /// Joining with the lock held is safe: a slot only becomes `Done` or
    /// `Failed` in the worker's final statement, so the join waits at
    /// most for a thread epilogue.
    fn join_finished(inner: &mut PoolInner) {
        let mut handles = Vec::new();
        for slot in inner.slots.iter_mut() {
            if matches!(slot.state, SlotState::Done | SlotState::Failed) {
                if let Some(handle) = slot.handle.take() {
                    slot.state = SlotState::Joined;
                    inner.joinable -= 1;
                    handles.push(handle);
                }
            }
        }
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }

    /// Wait for every active worker, then join all finished slots.
    fn drain(&self) {
        let mut inner = self.shared.inner.lock();
        while inner.active > 0 {
            self.wait_on_active(&mut inner);
        }
        Self::join_finished(&mut inner);
    }

    fn scan_stuck(inner: &mut PoolInner, stuck_after: Duration) {
        let now = Instant::now();
        for (i, slot) in inner.slots.iter().enumerate() {
            if slot.state == SlotState::Active {
                if let Some(started) = slot.started {
                    if now.duration_since(started) >= stuck_after {
                        inner.stuck_seen += 1;
                        tracing::warn!(
                            worker = i,
                            elapsed_secs = now.duration_since(started).as_secs(),
                            "launch worker not responding; reply path remains authoritative"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
