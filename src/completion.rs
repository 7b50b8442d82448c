//! Settle-later values handed back to callers.
//!
//! [`pair`] links a [`Settle`] (write once) with a [`Completion`] (read many).
//! Every clone of a completion observes the same settled value.

use crate::error::{Error, Result};
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Create a linked settle/observe pair.
#[must_use]
pub fn pair<T: Clone>() -> (Settle<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (Settle { tx }, Completion { rx: rx.shared() })
}

/// A completion that is already settled with `value`.
#[must_use]
pub fn settled<T: Clone>(value: T) -> Completion<T> {
    let (settle, completion) = pair();
    settle.settle(value);
    completion
}

/// Write side of a completion.
pub struct Settle<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Settle<T> {
    /// Settle the linked completion. Returns `false` if every observer is gone.
    pub fn settle(self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }

    /// Whether all observers were dropped.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_canceled()
    }
}

impl<T> fmt::Debug for Settle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settle")
            .field("abandoned", &self.tx.is_canceled())
            .finish()
    }
}

/// Read side of a completion.
#[must_use = "completions do nothing unless polled or peeked"]
pub struct Completion<T: Clone> {
    rx: Shared<oneshot::Receiver<T>>,
}

impl<T: Clone> Completion<T> {
    /// The settled value, if settling already happened.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        // Polling a clone with a no-op waker moves a sent value into the
        // shared slot without consuming this handle.
        self.rx.clone().now_or_never().and_then(|res| res.ok())
    }

    /// Whether this completion has produced its value.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.peek().is_some()
    }
}

impl<T: Clone> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T: Clone> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx
            .poll_unpin(cx)
            .map(|res| res.map_err(|_canceled| Error::Abandoned))
    }
}

impl<T: Clone> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("settled", &self.is_settled())
            .finish()
    }
}
