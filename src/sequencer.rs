//! The sequencing coordinator.
//!
//! A [`Sequencer`] issues ids with [`register`](Sequencer::register) and
//! later classifies each resolve call for one of them:
//!
//! - `immediate`: the id is the cursor and nothing is waiting or in flight
//! - `queued`: buffered, then released by an admission commit
//! - `late`: the id was outside `[last, next)` when resolved
//!
//! Queued releases always run from a deferred microtask on the sequencer's
//! [`EventLoop`], never inside the call that produced them, so a callback
//! may resolve again without observing a half-applied cursor update.
//!
//! With `max_delay_ms` set, the waiter heading the queue carries a one-shot
//! timer. When it fires while that waiter is still queued, the cursor jumps
//! to its id, anything queued in front of it is released with it, and the
//! missing ids in between are abandoned.

use crate::classify::Classification;
use crate::completion::{self, Completion};
use crate::error::Result;
use crate::queue::{self, AdmissionQueue, Waiter, WaiterKey};
use crate::scheduler::{Clock, EventLoop, TaskKind, WallClock};
use crate::sequence::SeqId;
use crate::settings::{SequencerConfig, SequencerSettings};
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

struct State {
    settings: SequencerSettings,
    /// Next id `register` hands out.
    next: SeqId,
    /// Next id expected to complete in order.
    last: SeqId,
    queue: AdmissionQueue,
    /// Waiters admitted but not yet dispatched.
    scheduled: usize,
    next_key: WaiterKey,
}

impl State {
    const fn take_key(&mut self) -> WaiterKey {
        let key = self.next_key;
        self.next_key = key.next();
        key
    }
}

struct Inner<C: Clock> {
    state: RefCell<State>,
    event_loop: EventLoop<C>,
}

/// Handle to one coordinator. Clones share the same cursor and queue.
pub struct Sequencer<C: Clock = WallClock> {
    inner: Rc<Inner<C>>,
}

impl<C: Clock> Clone for Sequencer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<C: Clock + 'static> Sequencer<C> {
    #[must_use]
    pub fn new(event_loop: EventLoop<C>, settings: SequencerSettings) -> Self {
        tracing::debug!(
            event = "sequencer.create",
            next = %settings.next,
            max_blocked = settings.max_blocked,
            max_delay_ms = ?settings.max_delay_ms,
            "Sequencer created"
        );

        Self {
            inner: Rc::new(Inner {
                state: RefCell::new(State {
                    settings,
                    next: settings.next,
                    last: settings.next,
                    queue: AdmissionQueue::new(),
                    scheduled: 0,
                    next_key: WaiterKey::new(0),
                }),
                event_loop,
            }),
        }
    }

    pub fn from_config(event_loop: EventLoop<C>, config: SequencerConfig) -> Result<Self> {
        Ok(Self::new(event_loop, config.normalize()?))
    }

    /// The loop this sequencer defers work onto.
    #[must_use]
    pub fn event_loop(&self) -> &EventLoop<C> {
        &self.inner.event_loop
    }

    #[must_use]
    pub fn settings(&self) -> SequencerSettings {
        self.inner.state.borrow().settings
    }

    /// Next id expected to complete in order.
    #[must_use]
    pub fn cursor(&self) -> SeqId {
        self.inner.state.borrow().last
    }

    /// Next id `register` will hand out.
    #[must_use]
    pub fn next_id(&self) -> SeqId {
        self.inner.state.borrow().next
    }

    /// Waiters still blocked in the admission queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.state.borrow().queue.len()
    }

    /// Waiters admitted whose dispatch has not run yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.state.borrow().scheduled
    }

    /// Issue the next sequence id.
    pub fn register(&self) -> SeqId {
        let mut state = self.inner.state.borrow_mut();
        let id = state.next;
        state.next = id.next();
        tracing::trace!(event = "sequencer.register", %id, "Sequence id issued");
        id
    }

    /// Classify a resolve for `id` and hand the result to `on_done`.
    ///
    /// `on_done` runs synchronously for `immediate` results and for `late`
    /// results when no dispatch is in flight; otherwise it runs from a
    /// microtask on the event loop.
    pub fn schedule(&self, id: SeqId, on_done: impl FnOnce(Classification) + 'static) {
        let mut state = self.inner.state.borrow_mut();
        let offset = state.last.offset_to(id);
        let window = state.last.offset_to(state.next);

        if offset < 0 || offset >= window {
            let in_flight = state.scheduled;
            drop(state);
            tracing::debug!(
                event = "sequencer.resolve.late",
                %id,
                offset,
                window,
                in_flight,
                "Resolve outside the pending window"
            );
            let result = Classification::late(id);
            if in_flight == 0 {
                on_done(result);
            } else {
                self.inner
                    .event_loop
                    .defer(TaskKind::Deliver { id }, move || on_done(result));
            }
            return;
        }

        if offset == 0 && state.queue.is_empty() && state.scheduled == 0 {
            state.last = id.next();
            drop(state);
            tracing::trace!(event = "sequencer.resolve.immediate", %id, "Resolved in order");
            on_done(Classification::immediate(id));
            return;
        }

        let key = state.take_key();
        let cursor = state.last;
        let index = state.queue.insert(Waiter::new(key, id, on_done), cursor);
        tracing::trace!(
            event = "sequencer.resolve.queued",
            %id,
            %key,
            index,
            pending = state.queue.len(),
            "Resolve buffered"
        );

        self.admit(&mut state);
    }

    /// [`schedule`](Self::schedule) with the result delivered through a completion.
    pub fn resolve(&self, id: SeqId) -> Completion<Classification> {
        let (settle, completion) = completion::pair();
        self.schedule(id, move |result| {
            settle.settle(result);
        });
        completion
    }

    /// Issue a fresh id and resolve it in one step.
    pub fn immediate(&self) -> Completion<Classification> {
        let id = self.register();
        self.resolve(id)
    }

    /// Reserve a slot now; values passed through it later come out in slot order.
    #[must_use]
    pub fn align(&self) -> Align<C> {
        Align {
            sequencer: self.clone(),
            id: self.register(),
        }
    }

    /// Run `task` independently, then release its output in the order this
    /// call was made.
    pub fn assign<F: Future>(&self, task: F) -> impl Future<Output = Result<F::Output>> + use<F, C> {
        let slot = self.align();
        async move {
            let value = task.await;
            slot.settle(value).await
        }
    }

    /// Partition the queue, move the cursor, and defer the released batch.
    fn admit(&self, state: &mut State) {
        self.commit(state, Vec::new());
    }

    /// Like [`admit`](Self::admit), with `forced` waiters released ahead of
    /// whatever the partition frees.
    fn commit(&self, state: &mut State, forced: Vec<Waiter>) {
        let admission = state.queue.admit(state.last, state.settings.max_blocked);
        let mut ready = forced;
        ready.extend(admission.ready);

        if !ready.is_empty() {
            let from = state.last;
            state.last = state.last.advance(admission.advanced);
            for waiter in &mut ready {
                if let Some(timer_id) = waiter.take_timer() {
                    self.inner.event_loop.clear_timeout(timer_id);
                }
            }

            let batch = ready.len();
            state.scheduled += batch;
            tracing::debug!(
                event = "sequencer.admission.commit",
                %from,
                to = %state.last,
                advanced = admission.advanced,
                batch,
                pending = state.queue.len(),
                "Admission commit"
            );

            let weak = Rc::downgrade(&self.inner);
            self.inner
                .event_loop
                .defer(TaskKind::Dispatch { batch }, move || {
                    let count = queue::dispatch(ready);
                    if let Some(inner) = weak.upgrade() {
                        let mut state = inner.state.borrow_mut();
                        state.scheduled = state.scheduled.saturating_sub(count);
                    }
                });
        }

        self.arm_head(state);
    }

    /// Give the queue head an escalation timer if it has none.
    fn arm_head(&self, state: &mut State) {
        let Some(delay_ms) = state.settings.max_delay_ms else {
            return;
        };
        let Some(head) = state.queue.head_mut() else {
            return;
        };
        if head.timer().is_some() {
            return;
        }

        let key = head.key();
        let weak: Weak<Inner<C>> = Rc::downgrade(&self.inner);
        let timer_id =
            self.inner
                .event_loop
                .set_timeout(delay_ms, TaskKind::Escalate { waiter: key }, move || {
                    if let Some(inner) = weak.upgrade() {
                        Self { inner }.escalate(key);
                    }
                });
        head.set_timer(timer_id);
        tracing::trace!(
            event = "sequencer.escalation.arm",
            %key,
            id = %head.id(),
            timer_id,
            delay_ms,
            "Escalation timer armed"
        );
    }

    /// Timer body: force the cursor to the waiter's id if `key` is still queued.
    ///
    /// Waiters queued in front of it go out in the same batch; only the
    /// missing ids in between are abandoned.
    fn escalate(&self, key: WaiterKey) {
        let mut state = self.inner.state.borrow_mut();
        let Some(waiter) = state.queue.get_mut(key) else {
            tracing::trace!(
                event = "sequencer.escalation.stale",
                %key,
                "Escalation for a dispatched waiter"
            );
            return;
        };
        waiter.take_timer();
        let target = waiter.id();

        let ahead = state.queue.take_ahead_of(key);
        let from = state.last;
        state.last = target;
        tracing::debug!(
            event = "sequencer.escalation.fire",
            %key,
            %from,
            to = %target,
            released_ahead = ahead.len(),
            skipped = from.offset_to(target),
            "Cursor forced past missing ids"
        );

        self.commit(&mut state, ahead);
    }
}

impl<C: Clock> fmt::Debug for Sequencer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.state.try_borrow() {
            Ok(state) => f
                .debug_struct("Sequencer")
                .field("next", &format_args!("{}", state.next))
                .field("last", &format_args!("{}", state.last))
                .field("pending", &state.queue.len())
                .field("scheduled", &state.scheduled)
                .finish_non_exhaustive(),
            Err(_) => f.write_str("Sequencer(<busy>)"),
        }
    }
}

/// A reserved slot from [`Sequencer::align`].
#[must_use = "an unsettled slot blocks every later id"]
pub struct Align<C: Clock = WallClock> {
    sequencer: Sequencer<C>,
    id: SeqId,
}

impl<C: Clock + 'static> Align<C> {
    #[must_use]
    pub const fn id(&self) -> SeqId {
        self.id
    }

    /// Resolve the slot now and yield `value` once the slot is released.
    pub fn settle<T>(self, value: T) -> impl Future<Output = Result<T>> {
        let completion = self.sequencer.resolve(self.id);
        async move {
            completion.await?;
            Ok(value)
        }
    }
}

impl<C: Clock> fmt::Debug for Align<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Align").field("id", &self.id).finish()
    }
}
