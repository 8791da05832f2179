//! Per-agent event scheduler.
//!
//! A single cooperative worker task owns a min-heap of `(deadline, seq)`
//! keyed events and an unbounded inbox that any thread may push to. The
//! worker sleeps until the head event is due or a new command arrives,
//! whichever comes first, so inserting an earlier deadline wakes it up
//! immediately. Handlers run on the worker and must not block.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A deferred action executed on the scheduler worker.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a pending event; cancellation is idempotent and is a no-op once
/// the event has fired.
#[derive(Debug, Clone)]
pub struct EventHandle {
    seq: u64,
    cancelled: Arc<AtomicBool>,
}

impl EventHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

struct Event {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    timer_id: Option<String>,
    action: Action,
    callbacks: Vec<Action>,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline).then(self.seq.cmp(&other.seq))
    }
}

enum Command {
    Insert(Event),
    RemoveTimer(String),
    Shutdown,
}

/// The per-agent scheduler. Cheap to share behind an `Arc`; all public
/// operations enqueue onto the worker's inbox and never touch the queue
/// directly.
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Command>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    seq: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            seq: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker task. Events scheduled before `start` are buffered
    /// in the inbox and picked up once the worker runs. Idempotent.
    pub fn start(&self) {
        if let Some(rx) = self.rx.lock().take() {
            *self.worker.lock() = Some(tokio::spawn(worker_loop(rx)));
        }
    }

    /// Schedules `action` to run `delay` from now. Insertion always
    /// succeeds; a zero delay means "as soon as the worker observes it".
    pub fn schedule(&self, delay: Duration, action: impl FnOnce() + Send + 'static) -> EventHandle {
        self.schedule_with_callbacks(delay, action, Vec::new())
    }

    /// Like [`schedule`](Self::schedule), with extra callbacks that run in
    /// insertion order after the main action.
    pub fn schedule_with_callbacks(
        &self,
        delay: Duration,
        action: impl FnOnce() + Send + 'static,
        callbacks: Vec<Action>,
    ) -> EventHandle {
        self.insert(delay, None, Box::new(action), callbacks)
    }

    /// Schedules a named, self-removing event that logs `message` when it
    /// fires. Creating a timer with an id already in use replaces (and
    /// cancels) the previous one.
    pub fn create_timer(&self, id: impl Into<String>, timeout: Duration, message: impl Into<String>) {
        let id = id.into();
        let message = message.into();
        let log_id = id.clone();
        self.insert(
            timeout,
            Some(id),
            Box::new(move || info!(timer = %log_id, "{message}")),
            Vec::new(),
        );
    }

    /// Cancels a named timer. Removing an unknown or already-fired timer is
    /// a no-op.
    pub fn remove_timer(&self, id: &str) {
        let _ = self.tx.send(Command::RemoveTimer(id.to_string()));
    }

    /// Pushes the shutdown sentinel: the worker cancels all named timers,
    /// drops the queue and exits. Idempotent.
    pub fn stop(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    /// Stops the worker and waits for it to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    fn insert(
        &self,
        delay: Duration,
        timer_id: Option<String>,
        action: Action,
        callbacks: Vec<Action>,
    ) -> EventHandle {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = EventHandle { seq, cancelled: cancelled.clone() };
        let event = Event {
            deadline: Instant::now() + delay,
            seq,
            cancelled,
            timer_id,
            action,
            callbacks,
        };
        if self.tx.send(Command::Insert(event)).is_err() {
            debug!(seq, "scheduler stopped; dropping scheduled action");
        }
        handle
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker_loop(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut heap: BinaryHeap<Reverse<Event>> = BinaryHeap::new();
    let mut timers: HashMap<String, Arc<AtomicBool>> = HashMap::new();

    loop {
        let next_deadline = heap.peek().map(|Reverse(event)| event.deadline);
        let command = match next_deadline {
            None => match rx.recv().await {
                Some(command) => command,
                None => break,
            },
            Some(deadline) if deadline <= Instant::now() => {
                if let Some(Reverse(event)) = heap.pop() {
                    fire(event, &mut timers);
                }
                continue;
            }
            Some(deadline) => {
                tokio::select! {
                    command = rx.recv() => match command {
                        Some(command) => command,
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline) => continue,
                }
            }
        };

        match command {
            Command::Insert(event) => {
                if let Some(id) = &event.timer_id {
                    if let Some(previous) = timers.insert(id.clone(), event.cancelled.clone()) {
                        previous.store(true, Ordering::SeqCst);
                    }
                }
                heap.push(Reverse(event));
            }
            Command::RemoveTimer(id) => {
                if let Some(flag) = timers.remove(&id) {
                    flag.store(true, Ordering::SeqCst);
                    debug!(timer = %id, "timer removed");
                }
            }
            Command::Shutdown => {
                for (_, flag) in timers.drain() {
                    flag.store(true, Ordering::SeqCst);
                }
                heap.clear();
                break;
            }
        }
    }
    debug!("scheduler worker stopped");
}

fn fire(event: Event, timers: &mut HashMap<String, Arc<AtomicBool>>) {
    let Event { seq, cancelled, timer_id, action, callbacks, .. } = event;
    if let Some(id) = &timer_id {
        timers.remove(id);
    }
    if cancelled.load(Ordering::SeqCst) {
        debug!(seq, "skipping cancelled event");
        return;
    }
    if catch_unwind(AssertUnwindSafe(action)).is_err() {
        warn!(seq, "scheduled action panicked");
    }
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(callback)).is_err() {
            warn!(seq, "event callback panicked");
        }
    }
}
