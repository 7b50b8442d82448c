//! Admission queue: pending resolve requests ordered by circular distance
//! from the cursor, plus the density-ratio admission algorithm.
//!
//! # Admission
//!
//! [`AdmissionQueue::plan`] walks the sorted waiters and, at every distinct
//! id, compares the ids seen since the last commit (`present`) against the
//! ids in that span with no waiter (`absent`). A run commits when it is
//! dense (`absent == 0`) or when `present / absent` exceeds the configured
//! ratio. Committed spans, gaps included, are how far the cursor moves.
//!
//! The plan is a pure function of the queue contents and the cursor, so the
//! order in which waiters arrived never changes which prefix is released.

use crate::classify::{Classification, ResultKind};
use crate::sequence::SeqId;
use std::collections::VecDeque;
use std::fmt;

/// Callback invoked exactly once with the classification of a resolve call.
pub type OnDone = Box<dyn FnOnce(Classification)>;

/// Identity of one queued waiter, unique for the life of a sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaiterKey(u64);

impl WaiterKey {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for WaiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "waiter:{}", self.0)
    }
}

/// One pending resolve request.
pub struct Waiter {
    key: WaiterKey,
    id: SeqId,
    on_done: OnDone,
    /// Escalation timer armed while this waiter heads the queue.
    timer: Option<u64>,
}

impl Waiter {
    pub fn new(key: WaiterKey, id: SeqId, on_done: impl FnOnce(Classification) + 'static) -> Self {
        Self {
            key,
            id,
            on_done: Box::new(on_done),
            timer: None,
        }
    }

    #[must_use]
    pub const fn key(&self) -> WaiterKey {
        self.key
    }

    #[must_use]
    pub const fn id(&self) -> SeqId {
        self.id
    }

    #[must_use]
    pub const fn timer(&self) -> Option<u64> {
        self.timer
    }

    pub const fn set_timer(&mut self, timer_id: u64) {
        self.timer = Some(timer_id);
    }

    pub const fn take_timer(&mut self) -> Option<u64> {
        self.timer.take()
    }

    /// Deliver the classification, consuming the waiter.
    pub fn complete(self, kind: ResultKind) {
        (self.on_done)(Classification::new(self.id, kind));
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`AdmissionQueue::plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdmissionPlan {
    /// How far the cursor moves, skipped gaps included.
    pub advanced: u64,
    /// Number of leading waiters released.
    pub ready: usize,
}

impl AdmissionPlan {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.advanced == 0
    }
}

/// Waiters released by [`AdmissionQueue::admit`].
#[derive(Debug, Default)]
pub struct Admission {
    pub advanced: u64,
    pub ready: Vec<Waiter>,
}

#[derive(Debug, Default)]
pub struct AdmissionQueue {
    waiters: VecDeque<Waiter>,
}

impl AdmissionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    #[must_use]
    pub fn head(&self) -> Option<&Waiter> {
        self.waiters.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut Waiter> {
        self.waiters.front_mut()
    }

    #[must_use]
    pub fn contains(&self, key: WaiterKey) -> bool {
        self.waiters.iter().any(|w| w.key == key)
    }

    pub fn get_mut(&mut self, key: WaiterKey) -> Option<&mut Waiter> {
        self.waiters.iter_mut().find(|w| w.key == key)
    }

    /// Remove and return every waiter queued in front of `key`, in order.
    pub fn take_ahead_of(&mut self, key: WaiterKey) -> Vec<Waiter> {
        let index = self
            .waiters
            .iter()
            .position(|w| w.key == key)
            .unwrap_or(0);
        self.waiters.drain(..index).collect()
    }

    /// Queued ids in queue order, duplicates included.
    #[must_use]
    pub fn ids(&self) -> Vec<SeqId> {
        self.waiters.iter().map(Waiter::id).collect()
    }

    /// Insert keeping ascending distance from `cursor`.
    ///
    /// Duplicates land after existing waiters with the same id. Returns the
    /// index the waiter was placed at.
    pub fn insert(&mut self, waiter: Waiter, cursor: SeqId) -> usize {
        let key = cursor.offset_to(waiter.id);
        let index = self
            .waiters
            .iter()
            .rposition(|w| cursor.offset_to(w.id) <= key)
            .map_or(0, |i| i + 1);

        self.waiters.insert(index, waiter);
        index
    }

    /// Compute the density-ratio admission split without mutating the queue.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn plan(&self, cursor: SeqId, max_blocked: f64) -> AdmissionPlan {
        // Offset from the cursor at which the current uncommitted run starts.
        let mut start: i64 = 0;
        let mut present: u64 = 0;
        let mut ready = 0;
        let mut prev: Option<SeqId> = None;

        for (index, waiter) in self.waiters.iter().enumerate() {
            if prev == Some(waiter.id) {
                // A duplicate of an id committed at the previous slot goes
                // out with it; otherwise it stays with its run.
                if ready == index {
                    ready += 1;
                }
                continue;
            }
            prev = Some(waiter.id);
            present += 1;

            let offset = cursor.offset_to(waiter.id);
            debug_assert!(offset >= start, "queued id behind the cursor");
            let span = (offset - start + 1).unsigned_abs();
            let absent = span.saturating_sub(present);

            if absent == 0 || present as f64 / absent as f64 > max_blocked {
                start = offset + 1;
                present = 0;
                ready = index + 1;
            }
        }

        AdmissionPlan {
            advanced: start.unsigned_abs(),
            ready,
        }
    }

    /// Apply [`plan`](Self::plan), draining the released prefix.
    pub fn admit(&mut self, cursor: SeqId, max_blocked: f64) -> Admission {
        let plan = self.plan(cursor, max_blocked);
        let ready = self.waiters.drain(..plan.ready).collect();

        Admission {
            advanced: plan.advanced,
            ready,
        }
    }
}

/// Deliver `queued` to every released waiter, in order.
pub fn dispatch(ready: Vec<Waiter>) -> usize {
    let mut count = 0;
    for waiter in ready {
        waiter.complete(ResultKind::Queued);
        count += 1;
    }
    count
}
