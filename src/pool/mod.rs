use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::decoders::{Decoder, DecodingState};

mod future;

pub use future::{StateFuture, TaskEvent, TaskId};

/// Scheduling class of a decode task. Higher classes are always served
/// first; within a class the pool is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Background,
    Normal,
    Important,
}

const PRIORITY_CLASSES: usize = 3;
const POOL_MIN_THREADS: usize = 2;
const POOL_MAX_THREADS: usize = 16;

/// Bound on the shutdown drain; tasks still running afterwards are logged
/// as leaks and not awaited.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct Queued {
    future: StateFuture,
    decoder: Arc<Decoder>,
}

struct PoolState {
    queues: [VecDeque<Queued>; PRIORITY_CLASSES],
    alive_workers: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
    cond: Condvar,
    exited: Condvar,
    shutdown: AtomicBool,
    running: Mutex<HashMap<TaskId, StateFuture>>,
}

impl PoolInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, StateFuture>> {
        match self.running.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Worker pool executing decode tasks in priority order. One pool serves
/// the whole application; decoders enqueue themselves through
/// [`Decoder::decode_async`].
pub struct DecodePool {
    inner: Arc<PoolInner>,
}

impl Default for DecodePool {
    fn default() -> Self {
        Self::with_threads(num_cpus::get().clamp(POOL_MIN_THREADS, POOL_MAX_THREADS))
    }
}

impl DecodePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threads(threads: usize) -> Self {
        let threads = threads.max(POOL_MIN_THREADS);
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                queues: Default::default(),
                alive_workers: threads,
            }),
            cond: Condvar::new(),
            exited: Condvar::new(),
            shutdown: AtomicBool::new(false),
            running: Mutex::new(HashMap::new()),
        });
        for i in 0..threads {
            let worker = inner.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("decode-{i}"))
                .spawn(move || worker_loop(worker));
            if let Err(e) = spawned {
                error!("failed to spawn decode worker {i}: {e}");
                let mut state = inner.lock_state();
                state.alive_workers -= 1;
            }
        }
        Self { inner }
    }

    /// Queues a task. After shutdown the future resolves Cancelled right
    /// away.
    pub(crate) fn enqueue(&self, decoder: Arc<Decoder>, future: StateFuture, priority: Priority) {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            future.finish(DecodingState::Cancelled);
            return;
        }
        {
            let mut state = self.inner.lock_state();
            state.queues[priority as usize].push_back(Queued { future, decoder });
        }
        self.inner.cond.notify_one();
    }

    /// Removes a task that has not started yet and synthesizes its
    /// completion. Returns false once the task is running (or done); the
    /// cancel flag is the only recourse then.
    pub fn try_take(&self, future: &StateFuture) -> bool {
        let taken = {
            let mut state = self.inner.lock_state();
            let mut taken = None;
            for queue in state.queues.iter_mut() {
                if let Some(pos) = queue.iter().position(|t| t.future.id() == future.id()) {
                    taken = queue.remove(pos);
                    break;
                }
            }
            taken
        };
        match taken {
            Some(task) => {
                task.future.finish(DecodingState::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn queued_len(&self) -> usize {
        let state = self.inner.lock_state();
        state.queues.iter().map(VecDeque::len).sum()
    }

    /// Drains the pool: queued tasks resolve Cancelled, running tasks get
    /// the cancel flag, workers are awaited up to `timeout`. Stragglers are
    /// logged and left behind.
    pub fn shutdown(&self, timeout: Duration) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<Queued> = {
            let mut state = self.inner.lock_state();
            state.queues.iter_mut().flat_map(std::mem::take).collect()
        };
        for task in drained {
            task.future.finish(DecodingState::Cancelled);
        }
        for fut in self.inner.lock_running().values() {
            fut.cancel();
        }
        self.inner.cond.notify_all();

        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock_state();
        while state.alive_workers > 0 {
            let now = Instant::now();
            if now >= deadline {
                error!(
                    workers = state.alive_workers,
                    "decode pool drain timed out, leaking still-running tasks"
                );
                return;
            }
            let (g, _) = match self.inner.exited.wait_timeout(state, deadline - now) {
                Ok(r) => r,
                Err(poisoned) => poisoned.into_inner(),
            };
            state = g;
        }
    }
}

impl Drop for DecodePool {
    fn drop(&mut self) {
        self.shutdown(SHUTDOWN_TIMEOUT);
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let task = {
            let mut state = inner.lock_state();
            loop {
                if let Some(task) = pop_task(&mut state) {
                    break Some(task);
                }
                if inner.shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                state = match inner.cond.wait(state) {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        };
        let Some(task) = task else {
            break;
        };

        inner
            .lock_running()
            .insert(task.future.id(), task.future.clone());
        task.future.mark_started();
        let state = task.decoder.run(&task.future);
        task.future.finish(state);
        if inner.lock_running().remove(&task.future.id()).is_none() {
            warn!("finished task was not in the running registry");
        }
    }

    let mut state = inner.lock_state();
    state.alive_workers -= 1;
    inner.exited.notify_all();
}

fn pop_task(state: &mut PoolState) -> Option<Queued> {
    for queue in state.queues.iter_mut().rev() {
        if let Some(task) = queue.pop_front() {
            return Some(task);
        }
    }
    None
}
