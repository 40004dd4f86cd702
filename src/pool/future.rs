use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::decoders::DecodingState;
use crate::events::EventBus;

/// Stable handle of one scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Started,
    Progress { percent: u8, text: String },
    Finished(DecodingState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Running,
    Finished(DecodingState),
}

struct Progress {
    percent: u8,
    text: String,
    last_publish: Option<Instant>,
}

type FinishHook = Box<dyn FnOnce(DecodingState) + Send>;

struct Shared {
    phase: Mutex<Phase>,
    cond: Condvar,
    cancel: AtomicBool,
    progress: Mutex<Progress>,
    events: EventBus<TaskEvent>,
    finish_hooks: Mutex<Vec<FinishHook>>,
}

/// Watcher-style future of a decode (or directory discovery) resolving to a
/// terminal [`DecodingState`]. Cheap to clone; consumers wait, poll or
/// subscribe, producers drive it through the `pub(crate)` completion API.
#[derive(Clone)]
pub struct StateFuture {
    id: TaskId,
    shared: Arc<Shared>,
}

/// Minimum interval between published progress events.
const PROGRESS_COALESCE: Duration = Duration::from_millis(50);

impl StateFuture {
    pub(crate) fn new() -> Self {
        Self {
            id: TaskId::next(),
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Queued),
                cond: Condvar::new(),
                cancel: AtomicBool::new(false),
                progress: Mutex::new(Progress {
                    percent: 0,
                    text: String::new(),
                    last_publish: None,
                }),
                events: EventBus::new(),
                finish_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn events(&self) -> &EventBus<TaskEvent> {
        &self.shared.events
    }

    pub fn is_started(&self) -> bool {
        !matches!(*self.lock_phase(), Phase::Queued)
    }

    pub fn is_finished(&self) -> bool {
        matches!(*self.lock_phase(), Phase::Finished(_))
    }

    pub fn try_result(&self) -> Option<DecodingState> {
        match *self.lock_phase() {
            Phase::Finished(state) => Some(state),
            _ => None,
        }
    }

    /// Blocks until the future is terminal.
    pub fn wait(&self) -> DecodingState {
        let mut phase = self.lock_phase();
        loop {
            if let Phase::Finished(state) = *phase {
                return state;
            }
            phase = match self.shared.cond.wait(phase) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<DecodingState> {
        let deadline = Instant::now() + timeout;
        let mut phase = self.lock_phase();
        loop {
            if let Phase::Finished(state) = *phase {
                return Some(state);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (g, _) = match self.shared.cond.wait_timeout(phase, deadline - now) {
                Ok(r) => r,
                Err(poisoned) => poisoned.into_inner(),
            };
            phase = g;
        }
    }

    /// Requests cooperative cancellation. The future still terminates
    /// through the regular completion path.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> (u8, String) {
        let p = self.lock_progress();
        (p.percent, p.text.clone())
    }

    fn lock_phase(&self) -> std::sync::MutexGuard<'_, Phase> {
        match self.shared.phase.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        match self.shared.progress.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn mark_started(&self) {
        {
            let mut phase = self.lock_phase();
            if *phase != Phase::Queued {
                return;
            }
            *phase = Phase::Running;
        }
        self.shared.events.publish(TaskEvent::Started);
    }

    /// Stores the latest progress and publishes it, coalesced to at most
    /// one event per 50 ms; a 100% report always goes out.
    pub(crate) fn set_progress(&self, percent: u8, text: &str) {
        let publish = {
            let mut p = self.lock_progress();
            if p.percent == percent && p.text == text {
                false
            } else {
                p.percent = percent;
                if p.text != text {
                    p.text = text.to_string();
                }
                let due = p
                    .last_publish
                    .map(|t| t.elapsed() >= PROGRESS_COALESCE)
                    .unwrap_or(true);
                if due || percent >= 100 {
                    p.last_publish = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
        };
        if publish {
            let (percent, text) = self.progress();
            self.shared
                .events
                .publish(TaskEvent::Progress { percent, text });
        }
    }

    /// Runs `hook` once the future is terminal (immediately when it
    /// already is), on whichever thread resolves it.
    pub(crate) fn on_finished(&self, hook: impl FnOnce(DecodingState) + Send + 'static) {
        let immediate = {
            let phase = self.lock_phase();
            match *phase {
                Phase::Finished(state) => Some(state),
                _ => {
                    let mut hooks = match self.shared.finish_hooks.lock() {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    hooks.push(Box::new(hook));
                    return;
                }
            }
        };
        if let Some(state) = immediate {
            hook(state);
        }
    }

    /// Resolves the future. Idempotent; the first terminal state wins.
    pub(crate) fn finish(&self, state: DecodingState) {
        {
            let mut phase = self.lock_phase();
            if matches!(*phase, Phase::Finished(_)) {
                return;
            }
            *phase = Phase::Finished(state);
            self.shared.cond.notify_all();
        }
        self.shared.events.publish(TaskEvent::Finished(state));
        let hooks = {
            let mut hooks = match self.shared.finish_hooks.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_the_terminal_state() {
        let fut = StateFuture::new();
        let waiter = fut.clone();
        let handle = thread::spawn(move || waiter.wait());
        fut.mark_started();
        fut.finish(DecodingState::FullImage);
        assert_eq!(handle.join().unwrap(), DecodingState::FullImage);
        assert!(fut.is_finished());
    }

    #[test]
    fn finish_is_idempotent() {
        let fut = StateFuture::new();
        fut.finish(DecodingState::Cancelled);
        fut.finish(DecodingState::FullImage);
        assert_eq!(fut.try_result(), Some(DecodingState::Cancelled));
    }

    #[test]
    fn events_carry_lifecycle() {
        let fut = StateFuture::new();
        let rx = fut.events().subscribe();
        fut.mark_started();
        fut.set_progress(100, "done");
        fut.finish(DecodingState::Metadata);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events[0], TaskEvent::Started);
        assert!(matches!(events[1], TaskEvent::Progress { percent: 100, .. }));
        assert_eq!(events[2], TaskEvent::Finished(DecodingState::Metadata));
    }

    #[test]
    fn progress_is_coalesced() {
        let fut = StateFuture::new();
        let rx = fut.events().subscribe();
        for pct in 0..50u8 {
            fut.set_progress(pct, "working");
        }
        // far fewer events than reports, latest value still queryable
        assert!(rx.try_iter().count() < 10);
        assert_eq!(fut.progress().0, 49);
    }

    #[test]
    fn wait_timeout_expires() {
        let fut = StateFuture::new();
        assert_eq!(fut.wait_timeout(Duration::from_millis(20)), None);
        fut.finish(DecodingState::Error);
        assert_eq!(
            fut.wait_timeout(Duration::from_millis(20)),
            Some(DecodingState::Error)
        );
    }
}
