//! Timer service. The executor owns *which* timers exist; this module owns
//! *when* they run. Deadlines are monotonic nanoseconds from a `Clock`, so
//! the threaded scheduler and the hand-cranked test scheduler are
//! interchangeable.

use ballast::time::{Clock, ManualClock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

const SLOT_PENDING: u8 = 0;
const SLOT_FIRED: u8 = 1;
const SLOT_CANCELLED: u8 = 2;

type Task = Box<dyn FnOnce() + Send>;

/// Handle to a scheduled task. Cancellation is idempotent; `cancel` reports
/// whether it won the race against the timer firing.
#[derive(Clone)]
pub struct CancelHandle {
    slot: Arc<AtomicU8>,
}

impl CancelHandle {
    #[inline]
    fn new() -> CancelHandle {
        CancelHandle {
            slot: Arc::new(AtomicU8::new(SLOT_PENDING)),
        }
    }

    /// Returns true iff the task had not yet fired (or been cancelled).
    #[inline]
    pub fn cancel(&self) -> bool {
        self.slot
            .compare_exchange(
                SLOT_PENDING,
                SLOT_CANCELLED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// True once the task has either fired or been cancelled.
    #[inline]
    pub fn is_settled(&self) -> bool {
        self.slot.load(Ordering::SeqCst) != SLOT_PENDING
    }

    /// Claims the right to run the task. Only the scheduler calls this.
    #[inline]
    fn claim(&self) -> bool {
        self.slot
            .compare_exchange(SLOT_PENDING, SLOT_FIRED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

pub trait Scheduler: Send + Sync {
    /// Schedules `task` to run once the clock passes `deadline_nanos`.
    fn schedule_at_nanos(&self, deadline_nanos: u64, task: Task) -> CancelHandle;
}

struct Entry {
    deadline: u64,
    seq: u64,
    handle: CancelHandle,
    task: Task,
}

impl Eq for Entry {}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Ord for Entry {
    /// Reversed so the binary heap pops the earliest deadline first.
    fn cmp(&self, other: &Entry) -> CmpOrdering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Production scheduler: one worker thread draining a deadline heap.
pub struct ThreadScheduler {
    inner: Arc<SchedulerInner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

struct SchedulerInner {
    clock: Arc<dyn Clock>,
    queue: Mutex<BinaryHeap<Entry>>,
    signal: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
}

impl ThreadScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> ThreadScheduler {
        let inner = Arc::new(SchedulerInner {
            clock,
            queue: Mutex::new(BinaryHeap::new()),
            signal: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });

        let worker_inner = inner.clone();
        let worker = thread::Builder::new()
            .name("genisys-sched".into())
            .spawn(move || Self::run(worker_inner))
            .expect("Failed to spawn scheduler thread");

        ThreadScheduler {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Cancels everything still pending and joins the worker. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.signal.notify_all();

        if let Some(worker) = self.worker.lock().expect("Scheduler poisoned").take() {
            drop(worker.join());
        }

        let mut queue = self.inner.queue.lock().expect("Scheduler poisoned");
        for entry in queue.drain() {
            entry.handle.cancel();
        }
    }

    fn run(inner: Arc<SchedulerInner>) {
        let mut queue = inner.queue.lock().expect("Scheduler poisoned");

        loop {
            if inner.shutdown.load(Ordering::SeqCst) {
                return;
            }

            let now = inner.clock.now_nanos();

            match queue.peek() {
                Some(entry) if entry.deadline <= now => {
                    let entry = queue.pop().expect("Peeked entry must pop");

                    // Run outside the lock so tasks can schedule more work.
                    drop(queue);
                    if entry.handle.claim() {
                        (entry.task)();
                    }
                    queue = inner.queue.lock().expect("Scheduler poisoned");
                }
                Some(entry) => {
                    let wait = Duration::from_nanos(entry.deadline - now);
                    let (guard, _) = inner
                        .signal
                        .wait_timeout(queue, wait)
                        .expect("Scheduler poisoned");
                    queue = guard;
                }
                None => {
                    queue = inner.signal.wait(queue).expect("Scheduler poisoned");
                }
            }
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_at_nanos(&self, deadline_nanos: u64, task: Task) -> CancelHandle {
        let handle = CancelHandle::new();

        let entry = Entry {
            deadline: deadline_nanos,
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
            handle: handle.clone(),
            task,
        };

        self.inner
            .queue
            .lock()
            .expect("Scheduler poisoned")
            .push(entry);
        self.inner.signal.notify_all();

        handle
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Deterministic scheduler driving simulated time. Tasks run inline on the
/// thread that advances the clock, in deadline order, with the clock set to
/// each task's deadline as it runs.
pub struct ManualScheduler {
    clock: Arc<ManualClock>,
    pending: Mutex<Vec<Entry>>,
    seq: AtomicU64,
}

impl ManualScheduler {
    #[inline]
    pub fn new(clock: Arc<ManualClock>) -> ManualScheduler {
        ManualScheduler {
            clock,
            pending: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Moves simulated time forward, firing everything that falls due.
    pub fn advance(&self, delta: Duration) {
        let target = self.clock.now_nanos() + delta.as_nanos() as u64;
        self.advance_to(target);
    }

    /// Moves simulated time to an absolute point, firing due tasks in
    /// deadline order. Tasks may schedule further work; newly due tasks run
    /// in the same sweep.
    pub fn advance_to(&self, target: u64) {
        loop {
            let next = {
                let mut pending = self.pending.lock().expect("Manual scheduler poisoned");

                let due = pending
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.deadline <= target)
                    .min_by_key(|(_, entry)| (entry.deadline, entry.seq))
                    .map(|(index, _)| index);

                due.map(|index| pending.remove(index))
            };

            match next {
                Some(entry) => {
                    if entry.deadline > self.clock.now_nanos() {
                        self.clock.set(entry.deadline);
                    }
                    if entry.handle.claim() {
                        (entry.task)();
                    }
                }
                None => break,
            }
        }

        if target > self.clock.now_nanos() {
            self.clock.set(target);
        }

        self.prune();
    }

    /// Runs tasks already due at the current simulated time.
    #[inline]
    pub fn run_due(&self) {
        self.advance_to(self.clock.now_nanos());
    }

    /// Number of unsettled scheduled tasks.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .expect("Manual scheduler poisoned")
            .iter()
            .filter(|entry| !entry.handle.is_settled())
            .count()
    }

    fn prune(&self) {
        self.pending
            .lock()
            .expect("Manual scheduler poisoned")
            .retain(|entry| !entry.handle.is_settled());
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_at_nanos(&self, deadline_nanos: u64, task: Task) -> CancelHandle {
        let handle = CancelHandle::new();

        let entry = Entry {
            deadline: deadline_nanos,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            handle: handle.clone(),
            task,
        };

        self.pending
            .lock()
            .expect("Manual scheduler poisoned")
            .push(entry);

        handle
    }
}
