//! Deterministic single-threaded event loop driving the sequencer.
//!
//! - Queue model: microtasks (deferred calls), macrotasks (fired timers)
//! - Timer heap with stable ordering guarantees
//! - Named deferral seam so tests can step the loop deterministically
//!
//! # Invariants
//!
//! - **Single macrotask:** at most one macrotask executes per tick
//! - **Microtask fixpoint:** after any macrotask, microtasks drain to empty
//! - **Stable timers:** timers with equal deadlines fire in increasing seq order
//! - **No reentrancy:** task bodies run with the loop state released, so a
//!   task may schedule more work without re-entering a half-finished update
//! - **Total order:** all observable scheduling is ordered by seq

use crate::completion::{self, Completion};
use crate::queue::WaiterKey;
use crate::sequence::SeqId;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::task::{Context, Poll};
use std::thread::{self, Thread};
use std::time::Duration;

/// Monotonically increasing sequence counter for deterministic ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(u64);

impl Seq {
    /// Create the initial sequence value.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Get the next sequence value, incrementing the counter.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// A timer entry in the timer heap.
#[derive(Debug, Clone)]
pub struct TimerEntry {
    /// Timer ID for cancellation.
    pub timer_id: u64,
    /// Absolute deadline in milliseconds.
    pub deadline_ms: u64,
    /// Sequence number for stable ordering.
    pub seq: Seq,
}

impl TimerEntry {
    /// Create a new timer entry.
    #[must_use]
    pub const fn new(timer_id: u64, deadline_ms: u64, seq: Seq) -> Self {
        Self {
            timer_id,
            deadline_ms,
            seq,
        }
    }
}

// Order by (deadline_ms, seq) ascending - min-heap needs reversed comparison.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap: smaller deadline/seq = higher priority
        match other.deadline_ms.cmp(&self.deadline_ms) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

/// What a scheduled task is for. Used for tracing and test assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Release an admitted batch of waiters.
    Dispatch { batch: usize },
    /// Deliver a deferred `late` classification.
    Deliver { id: SeqId },
    /// Delay escalation for a waiter at the head of the queue.
    Escalate { waiter: WaiterKey },
    /// A `sleep` completion.
    Sleep,
    /// Any other caller-supplied work.
    Call,
}

/// A runnable unit of work.
pub struct Task {
    /// Sequence number for deterministic ordering.
    pub seq: Seq,
    /// What the task is for.
    pub kind: TaskKind,
    run: Box<dyn FnOnce()>,
}

impl Task {
    fn new(seq: Seq, kind: TaskKind, run: Box<dyn FnOnce()>) -> Self {
        Self { seq, kind, run }
    }

    /// Execute the task body.
    pub fn run(self) {
        (self.run)();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("seq", &self.seq)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

// Order by seq ascending.
impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq.cmp(&other.seq)
    }
}

/// A monotonic clock source for the scheduler.
pub trait Clock: Send + Sync {
    /// Get the current time in milliseconds since epoch.
    fn now_ms(&self) -> u64;

    /// Block until `deadline_ms` has passed.
    fn park_until(&self, deadline_ms: u64) {
        let wait = deadline_ms.saturating_sub(self.now_ms());
        if wait > 0 {
            thread::sleep(Duration::from_millis(wait));
        }
    }
}

impl<C: Clock> Clock for Arc<C> {
    fn now_ms(&self) -> u64 {
        self.as_ref().now_ms()
    }

    fn park_until(&self, deadline_ms: u64) {
        self.as_ref().park_until(deadline_ms);
    }
}

/// Real wall clock implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        u64::try_from(millis).unwrap_or(u64::MAX)
    }
}

/// A deterministic clock for testing. Parking jumps straight to the deadline.
#[derive(Debug)]
pub struct DeterministicClock {
    current_ms: std::sync::atomic::AtomicU64,
}

impl DeterministicClock {
    /// Create a new deterministic clock starting at the given time.
    #[must_use]
    pub const fn new(start_ms: u64) -> Self {
        Self {
            current_ms: std::sync::atomic::AtomicU64::new(start_ms),
        }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, ms: u64) {
        self.current_ms
            .fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for DeterministicClock {
    fn now_ms(&self) -> u64 {
        self.current_ms.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn park_until(&self, deadline_ms: u64) {
        self.current_ms
            .fetch_max(deadline_ms, std::sync::atomic::Ordering::SeqCst);
    }
}

struct PendingTimer {
    kind: TaskKind,
    run: Box<dyn FnOnce()>,
}

/// The deterministic event loop scheduler state.
pub struct Scheduler<C: Clock = WallClock> {
    /// Monotone sequence counter.
    seq: Seq,
    /// Deferred calls, FIFO.
    microtasks: VecDeque<Task>,
    /// Macrotask queue (Min-Heap via Reverse, ordered by seq).
    macrotask_queue: BinaryHeap<Reverse<Task>>,
    /// Timer heap (min-heap by deadline_ms, seq).
    timer_heap: BinaryHeap<TimerEntry>,
    /// Bodies of live timers; heap entries without one were cancelled.
    timers: HashMap<u64, PendingTimer>,
    /// Next timer ID.
    next_timer_id: u64,
    /// Clock source.
    clock: C,
}

impl Scheduler<WallClock> {
    /// Create a new scheduler with the default wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(WallClock)
    }
}

impl Default for Scheduler<WallClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Scheduler<C> {
    /// Create a new scheduler with a custom clock.
    #[must_use]
    pub fn with_clock(clock: C) -> Self {
        Self {
            seq: Seq::zero(),
            microtasks: VecDeque::new(),
            macrotask_queue: BinaryHeap::new(),
            timer_heap: BinaryHeap::new(),
            timers: HashMap::new(),
            next_timer_id: 1,
            clock,
        }
    }

    /// Get the next sequence number and increment the counter.
    const fn next_seq(&mut self) -> Seq {
        let current = self.seq;
        self.seq = self.seq.next();
        current
    }

    /// Get the current time from the clock.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// The clock driving this scheduler.
    #[must_use]
    pub const fn clock(&self) -> &C {
        &self.clock
    }

    /// Check if there are pending tasks.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.microtasks.is_empty() || !self.macrotask_queue.is_empty() || !self.timers.is_empty()
    }

    /// Get the number of live (not cancelled, not fired) timers.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Queue `run` behind every microtask already queued.
    pub fn defer(&mut self, kind: TaskKind, run: Box<dyn FnOnce()>) -> Seq {
        let seq = self.next_seq();
        tracing::trace!(
            event = "scheduler.microtask.enqueue",
            ?kind,
            %seq,
            "Microtask enqueued"
        );
        self.microtasks.push_back(Task::new(seq, kind, run));
        seq
    }

    /// Schedule a timer to fire after `delay_ms`.
    ///
    /// Returns the timer ID for cancellation.
    pub fn set_timeout(&mut self, delay_ms: u64, kind: TaskKind, run: Box<dyn FnOnce()>) -> u64 {
        let timer_id = self.next_timer_id;
        self.next_timer_id += 1;
        let deadline_ms = self.clock.now_ms().saturating_add(delay_ms);
        let seq = self.next_seq();

        self.timer_heap
            .push(TimerEntry::new(timer_id, deadline_ms, seq));
        self.timers.insert(timer_id, PendingTimer { kind, run });

        tracing::trace!(
            event = "scheduler.timer.set",
            timer_id,
            delay_ms,
            deadline_ms,
            %seq,
            "Timer scheduled"
        );

        timer_id
    }

    /// Cancel a timer by ID.
    ///
    /// Returns true if the timer was live and is now cancelled.
    pub fn clear_timeout(&mut self, timer_id: u64) -> bool {
        // The heap entry stays; it is skipped when popped.
        let cancelled = self.timers.remove(&timer_id).is_some();

        tracing::trace!(
            event = "scheduler.timer.cancel",
            timer_id,
            cancelled,
            "Timer cancelled"
        );

        cancelled
    }

    /// Move due timers from the timer heap to the macrotask queue.
    fn move_due_timers(&mut self) {
        let now = self.clock.now_ms();

        while let Some(entry) = self.timer_heap.peek() {
            if entry.deadline_ms > now {
                break;
            }

            let Some(entry) = self.timer_heap.pop() else {
                break;
            };

            let Some(timer) = self.timers.remove(&entry.timer_id) else {
                tracing::trace!(
                    event = "scheduler.timer.skip_cancelled",
                    timer_id = entry.timer_id,
                    "Skipped cancelled timer"
                );
                continue;
            };

            // Preserve (deadline, timer-seq) order while assigning a fresh
            // macrotask seq so queue ordering remains globally monotone.
            let task_seq = self.next_seq();
            self.macrotask_queue
                .push(Reverse(Task::new(task_seq, timer.kind, timer.run)));

            tracing::trace!(
                event = "scheduler.timer.fire",
                timer_id = entry.timer_id,
                deadline_ms = entry.deadline_ms,
                now_ms = now,
                timer_seq = %entry.seq,
                macrotask_seq = %task_seq,
                "Timer fired"
            );
        }
    }

    /// Pop the oldest microtask, if any.
    pub fn pop_microtask(&mut self) -> Option<Task> {
        self.microtasks.pop_front()
    }

    /// Take one macrotask off the queue, moving due timers first.
    ///
    /// The caller runs the task and then drains microtasks.
    pub fn tick(&mut self) -> Option<Task> {
        self.move_due_timers();

        let task = self.macrotask_queue.pop().map(|Reverse(t)| t);

        if let Some(ref task) = task {
            tracing::debug!(
                event = "scheduler.tick.execute",
                seq = %task.seq,
                kind = ?task.kind,
                "Executing macrotask"
            );
        } else {
            tracing::trace!(event = "scheduler.tick.idle", "No macrotask to execute");
        }

        task
    }

    /// Get the deadline of the next live timer, if any.
    #[must_use]
    pub fn next_timer_deadline(&self) -> Option<u64> {
        self.timer_heap
            .iter()
            .filter(|entry| self.timers.contains_key(&entry.timer_id))
            .map(|entry| entry.deadline_ms)
            .min()
    }
}

impl<C: Clock> fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("seq", &self.seq)
            .field("microtask_count", &self.microtasks.len())
            .field("macrotask_count", &self.macrotask_queue.len())
            .field("timer_count", &self.timers.len())
            .field("next_timer_id", &self.next_timer_id)
            .finish_non_exhaustive()
    }
}

/// Shared handle to a [`Scheduler`] that knows how to run it.
///
/// Every borrow of the scheduler ends before a task body runs.
pub struct EventLoop<C: Clock = WallClock> {
    inner: Rc<RefCell<Scheduler<C>>>,
}

impl<C: Clock> Clone for EventLoop<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl EventLoop<WallClock> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(WallClock)
    }
}

impl Default for EventLoop<WallClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> EventLoop<C> {
    #[must_use]
    pub fn with_clock(clock: C) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Scheduler::with_clock(clock))),
        }
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.inner.borrow().now_ms()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.inner.borrow().has_pending()
    }

    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.inner.borrow().timer_count()
    }

    #[must_use]
    pub fn next_timer_deadline(&self) -> Option<u64> {
        self.inner.borrow().next_timer_deadline()
    }

    /// Post `run` to the end of the microtask queue.
    pub fn defer(&self, kind: TaskKind, run: impl FnOnce() + 'static) -> Seq {
        self.inner.borrow_mut().defer(kind, Box::new(run))
    }

    pub fn set_timeout(&self, delay_ms: u64, kind: TaskKind, run: impl FnOnce() + 'static) -> u64 {
        self.inner
            .borrow_mut()
            .set_timeout(delay_ms, kind, Box::new(run))
    }

    pub fn clear_timeout(&self, timer_id: u64) -> bool {
        self.inner.borrow_mut().clear_timeout(timer_id)
    }

    /// A completion settled once `delay_ms` has elapsed on this loop.
    pub fn sleep(&self, delay_ms: u64) -> Completion<()> {
        let (settle, completion) = completion::pair();
        self.set_timeout(delay_ms, TaskKind::Sleep, move || {
            settle.settle(());
        });
        completion
    }

    /// Drain microtasks to empty. Returns how many ran.
    pub fn run_microtasks(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.inner.borrow_mut().pop_microtask();
            let Some(task) = next else {
                break;
            };
            task.run();
            ran += 1;
        }
        ran
    }

    /// Run one tick: one due macrotask followed by the microtask fixpoint.
    ///
    /// Returns the kind of the macrotask that ran, if any.
    pub fn tick(&self) -> Option<TaskKind> {
        let next = self.inner.borrow_mut().tick();
        let task = next?;
        let kind = task.kind;
        task.run();
        self.run_microtasks();
        Some(kind)
    }

    /// Run everything runnable without moving the clock. Returns tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = self.run_microtasks();
        loop {
            let next = self.inner.borrow_mut().tick();
            let Some(task) = next else {
                break;
            };
            task.run();
            ran += 1 + self.run_microtasks();
        }
        ran
    }

    /// Run until no work or timers remain, parking the clock between timers.
    pub fn run_to_completion(&self) -> usize {
        let mut ran = self.run_until_idle();
        loop {
            let deadline = self.next_timer_deadline();
            let Some(deadline) = deadline else {
                break;
            };
            self.inner.borrow().clock().park_until(deadline);
            ran += self.run_until_idle();
        }
        ran
    }

    /// Drive `future` to completion, running this loop's work between polls.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let notify = Arc::new(ThreadNotify {
            thread: thread::current(),
            woken: AtomicBool::new(false),
        });
        let waker = futures::task::waker(Arc::clone(&notify));
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);

        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }
            if self.run_until_idle() > 0 {
                continue;
            }
            if notify.woken.swap(false, std::sync::atomic::Ordering::SeqCst) {
                continue;
            }
            let deadline = self.next_timer_deadline();
            if let Some(deadline) = deadline {
                self.inner.borrow().clock().park_until(deadline);
                continue;
            }
            tracing::trace!(event = "scheduler.block_on.park", "Waiting for external wake");
            thread::park();
        }
    }
}

impl<C: Clock> fmt::Debug for EventLoop<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(sched) => f.debug_tuple("EventLoop").field(&*sched).finish(),
            Err(_) => f.write_str("EventLoop(<running>)"),
        }
    }
}

struct ThreadNotify {
    thread: Thread,
    woken: AtomicBool,
}

impl futures::task::ArcWake for ThreadNotify {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self
            .woken
            .store(true, std::sync::atomic::Ordering::SeqCst);
        arc_self.thread.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn noop() -> Box<dyn FnOnce()> {
        Box::new(|| {})
    }

    fn tagged(log: &Rc<RefCell<Vec<String>>>, tag: &str) -> impl FnOnce() + 'static {
        let log = Rc::clone(log);
        let tag = tag.to_string();
        move || log.borrow_mut().push(tag)
    }

    #[test]
    fn seq_ordering() {
        let a = Seq::zero();
        let b = a.next();
        let c = b.next();

        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.value(), 0);
        assert_eq!(b.value(), 1);
        assert_eq!(c.value(), 2);
    }

    #[test]
    fn timer_ordering() {
        // Earlier deadline = higher priority (lower in min-heap)
        let t1 = TimerEntry::new(1, 100, Seq(0));
        let t2 = TimerEntry::new(2, 200, Seq(1));

        assert!(t1 > t2); // Reversed for min-heap

        // Same deadline, earlier seq = higher priority
        let t3 = TimerEntry::new(3, 100, Seq(5));
        let t4 = TimerEntry::new(4, 100, Seq(10));

        assert!(t3 > t4); // Reversed for min-heap
    }

    #[test]
    fn deterministic_clock() {
        let clock = DeterministicClock::new(1000);
        assert_eq!(clock.now_ms(), 1000);

        clock.advance(500);
        assert_eq!(clock.now_ms(), 1500);
    }

    #[test]
    fn deterministic_clock_park_jumps_forward_only() {
        let clock = DeterministicClock::new(100);
        clock.park_until(250);
        assert_eq!(clock.now_ms(), 250);
        clock.park_until(10);
        assert_eq!(clock.now_ms(), 250);
    }

    #[test]
    fn scheduler_basic_timer() {
        let clock = DeterministicClock::new(0);
        let mut sched = Scheduler::with_clock(clock);

        let timer_id = sched.set_timeout(100, TaskKind::Call, noop());
        assert_eq!(timer_id, 1);
        assert_eq!(sched.timer_count(), 1);

        // Tick before deadline - nothing happens
        assert!(sched.tick().is_none());

        sched.clock.advance(150);
        let task = sched.tick().expect("timer due");
        assert_eq!(task.kind, TaskKind::Call);
        assert_eq!(sched.timer_count(), 0);
    }

    #[test]
    fn scheduler_timer_ordering() {
        let event_loop = EventLoop::with_clock(DeterministicClock::new(0));
        let log = Rc::new(RefCell::new(Vec::new()));

        // Set timers in reverse order
        event_loop.set_timeout(300, TaskKind::Call, tagged(&log, "t3"));
        event_loop.set_timeout(100, TaskKind::Call, tagged(&log, "t1"));
        event_loop.set_timeout(200, TaskKind::Call, tagged(&log, "t2"));

        event_loop.inner.borrow().clock().advance(400);
        event_loop.run_until_idle();

        assert_eq!(*log.borrow(), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn scheduler_same_deadline_seq_ordering() {
        let event_loop = EventLoop::with_clock(DeterministicClock::new(0));
        let log = Rc::new(RefCell::new(Vec::new()));

        event_loop.set_timeout(100, TaskKind::Call, tagged(&log, "a"));
        event_loop.set_timeout(100, TaskKind::Call, tagged(&log, "b"));
        event_loop.set_timeout(100, TaskKind::Call, tagged(&log, "c"));

        event_loop.inner.borrow().clock().advance(150);
        event_loop.run_until_idle();

        // Must fire in order they were created (by seq)
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn scheduler_cancel_timer() {
        let event_loop = EventLoop::with_clock(DeterministicClock::new(0));
        let log = Rc::new(RefCell::new(Vec::new()));

        let t1 = event_loop.set_timeout(100, TaskKind::Call, tagged(&log, "t1"));
        event_loop.set_timeout(200, TaskKind::Call, tagged(&log, "t2"));

        assert!(event_loop.clear_timeout(t1));

        event_loop.inner.borrow().clock().advance(250);
        event_loop.run_until_idle();

        assert_eq!(*log.borrow(), vec!["t2"]);
        assert!(!event_loop.has_pending());
    }

    #[test]
    fn clear_timeout_unknown_returns_false() {
        let mut sched = Scheduler::with_clock(DeterministicClock::new(0));
        assert!(!sched.clear_timeout(999));
    }

    #[test]
    fn clear_timeout_double_cancel_returns_false() {
        let mut sched = Scheduler::with_clock(DeterministicClock::new(0));
        let t = sched.set_timeout(100, TaskKind::Call, noop());
        assert!(sched.clear_timeout(t));
        assert!(!sched.clear_timeout(t));
    }

    #[test]
    fn clear_timeout_after_fire_returns_false() {
        let event_loop = EventLoop::with_clock(DeterministicClock::new(0));
        let t = event_loop.set_timeout(0, TaskKind::Call, || {});
        event_loop.run_until_idle();
        assert!(!event_loop.clear_timeout(t));
    }

    #[test]
    fn microtasks_run_fifo() {
        let event_loop = EventLoop::with_clock(DeterministicClock::new(0));
        let log = Rc::new(RefCell::new(Vec::new()));

        event_loop.defer(TaskKind::Call, tagged(&log, "a"));
        event_loop.defer(TaskKind::Call, tagged(&log, "b"));
        assert!(log.borrow().is_empty(), "deferral must not run synchronously");

        assert_eq!(event_loop.run_microtasks(), 2);
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn microtask_scheduled_from_microtask_runs_after_queued_ones() {
        let event_loop = EventLoop::with_clock(DeterministicClock::new(0));
        let log = Rc::new(RefCell::new(Vec::new()));

        {
            let inner_loop = event_loop.clone();
            let inner_log = Rc::clone(&log);
            event_loop.defer(TaskKind::Call, move || {
                inner_log.borrow_mut().push("a".to_string());
                inner_loop.defer(TaskKind::Call, tagged(&inner_log, "c"));
            });
        }
        event_loop.defer(TaskKind::Call, tagged(&log, "b"));

        event_loop.run_microtasks();
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn microtasks_drain_after_each_macrotask() {
        let event_loop = EventLoop::with_clock(DeterministicClock::new(0));
        let log = Rc::new(RefCell::new(Vec::new()));

        for tag in ["t1", "t2"] {
            let inner_loop = event_loop.clone();
            let inner_log = Rc::clone(&log);
            event_loop.set_timeout(10, TaskKind::Call, move || {
                inner_log.borrow_mut().push(tag.to_string());
                inner_loop.defer(TaskKind::Call, tagged(&inner_log, &format!("{tag}-micro")));
            });
        }

        event_loop.inner.borrow().clock().advance(10);
        assert_eq!(event_loop.tick(), Some(TaskKind::Call));
        assert_eq!(*log.borrow(), vec!["t1", "t1-micro"]);

        assert_eq!(event_loop.tick(), Some(TaskKind::Call));
        assert_eq!(*log.borrow(), vec!["t1", "t1-micro", "t2", "t2-micro"]);
        assert_eq!(event_loop.tick(), None);
    }

    #[test]
    fn scheduler_invariant_single_macrotask_per_tick() {
        let mut sched = Scheduler::with_clock(DeterministicClock::new(0));
        sched.set_timeout(0, TaskKind::Call, noop());
        sched.set_timeout(0, TaskKind::Call, noop());
        sched.set_timeout(0, TaskKind::Call, noop());

        assert!(sched.tick().is_some());
        assert_eq!(sched.macrotask_queue.len(), 2);

        assert!(sched.tick().is_some());
        assert_eq!(sched.macrotask_queue.len(), 1);

        assert!(sched.tick().is_some());
        assert!(sched.macrotask_queue.is_empty());

        assert!(sched.tick().is_none());
    }

    #[test]
    fn scheduler_next_timer_deadline() {
        let mut sched = Scheduler::with_clock(DeterministicClock::new(0));

        assert!(sched.next_timer_deadline().is_none());

        sched.set_timeout(200, TaskKind::Call, noop());
        sched.set_timeout(100, TaskKind::Call, noop());
        sched.set_timeout(300, TaskKind::Call, noop());

        assert_eq!(sched.next_timer_deadline(), Some(100));

        sched.clock.advance(150);
        assert!(sched.tick().is_some());
        assert_eq!(sched.next_timer_deadline(), Some(200));
    }

    #[test]
    fn scheduler_next_timer_skips_cancelled_timers() {
        let mut sched = Scheduler::with_clock(DeterministicClock::new(0));

        let t1 = sched.set_timeout(100, TaskKind::Call, noop());
        let _t2 = sched.set_timeout(200, TaskKind::Call, noop());

        assert!(sched.clear_timeout(t1));
        assert_eq!(sched.next_timer_deadline(), Some(200));
    }

    #[test]
    fn run_to_completion_parks_through_future_timers() {
        let clock = Arc::new(DeterministicClock::new(0));
        let event_loop = EventLoop::with_clock(Arc::clone(&clock));
        let log = Rc::new(RefCell::new(Vec::new()));

        event_loop.set_timeout(500, TaskKind::Call, tagged(&log, "late"));
        event_loop.set_timeout(20, TaskKind::Call, tagged(&log, "early"));

        assert_eq!(event_loop.run_until_idle(), 0);
        assert_eq!(event_loop.run_to_completion(), 2);
        assert_eq!(*log.borrow(), vec!["early", "late"]);
        assert_eq!(clock.now_ms(), 500);
    }

    #[test]
    fn sleep_completes_on_deadline() {
        let clock = Arc::new(DeterministicClock::new(0));
        let event_loop = EventLoop::with_clock(Arc::clone(&clock));

        let nap = event_loop.sleep(30);
        event_loop.run_until_idle();
        assert!(!nap.is_settled());

        clock.advance(30);
        event_loop.run_until_idle();
        assert!(nap.is_settled());
    }

    #[test]
    fn block_on_drives_timers_and_microtasks() {
        let clock = Arc::new(DeterministicClock::new(0));
        let event_loop = EventLoop::with_clock(Arc::clone(&clock));

        let nap = event_loop.sleep(75);
        let out = event_loop.block_on(async move {
            nap.await.expect("sleep settles");
            42
        });

        assert_eq!(out, 42);
        assert_eq!(clock.now_ms(), 75);
    }

    #[test]
    fn scheduler_debug_format() {
        let sched = Scheduler::with_clock(DeterministicClock::new(0));
        let debug = format!("{sched:?}");
        assert!(debug.contains("Scheduler"));
        assert!(debug.contains("seq"));
    }

    #[test]
    fn arc_clock_delegation() {
        let clock = Arc::new(DeterministicClock::new(42));
        assert_eq!(Clock::now_ms(&clock), 42);
        clock.advance(10);
        assert_eq!(Clock::now_ms(&clock), 52);
        Clock::park_until(&clock, 60);
        assert_eq!(clock.now_ms(), 60);
    }

    #[test]
    fn wall_clock_returns_positive_ms() {
        let clock = WallClock;
        let now = clock.now_ms();
        assert!(now > 0, "WallClock should return a positive timestamp");
    }

    #[test]
    fn task_equality_uses_seq_only() {
        let a = Task::new(Seq(1), TaskKind::Call, noop());
        let b = Task::new(Seq(1), TaskKind::Sleep, noop());
        assert_eq!(a, b);
    }

    #[derive(Debug, Clone)]
    struct XorShift64 {
        state: u64,
    }

    impl XorShift64 {
        const fn new(seed: u64) -> Self {
            // Avoid the all-zero state so the stream doesn't get stuck.
            let seed = seed ^ 0x9E37_79B9_7F4A_7C15;
            Self { state: seed }
        }

        fn next_u64(&mut self) -> u64 {
            let mut x = self.state;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.state = x;
            x
        }

        fn next_range_u64(&mut self, upper_exclusive: u64) -> u64 {
            if upper_exclusive == 0 {
                return 0;
            }
            self.next_u64() % upper_exclusive
        }

        fn next_usize(&mut self, upper_exclusive: usize) -> usize {
            let upper = u64::try_from(upper_exclusive).expect("usize fits in u64");
            let value = self.next_range_u64(upper);
            usize::try_from(value).expect("value < upper_exclusive")
        }
    }

    fn run_seeded_script(seed: u64) -> Vec<String> {
        let clock = Arc::new(DeterministicClock::new(0));
        let event_loop = EventLoop::with_clock(Arc::clone(&clock));
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut rng = XorShift64::new(seed);
        let mut timers = Vec::new();

        for step in 0..256u64 {
            match rng.next_range_u64(5) {
                0 => {
                    let delay_ms = rng.next_range_u64(250);
                    let tag = format!("timer-{step}");
                    timers.push(event_loop.set_timeout(delay_ms, TaskKind::Call, tagged(&log, &tag)));
                }
                1 => {
                    if !timers.is_empty() {
                        let idx = rng.next_usize(timers.len());
                        let _cancelled = event_loop.clear_timeout(timers[idx]);
                    }
                }
                2 => {
                    let tag = format!("micro-{step}");
                    event_loop.defer(TaskKind::Call, tagged(&log, &tag));
                }
                3 => clock.advance(rng.next_range_u64(50)),
                _ => {}
            }

            if rng.next_range_u64(3) == 0 {
                event_loop.tick();
            }
        }

        event_loop.run_to_completion();
        log.take()
    }

    #[test]
    fn scheduler_seeded_trace_is_deterministic() {
        for seed in [0_u64, 1, 2, 3, 0xDEAD_BEEF] {
            let a = run_seeded_script(seed);
            let b = run_seeded_script(seed);
            assert_eq!(a, b, "trace mismatch for seed={seed}");
        }
    }
}
