//! Sequencing admission coordinator.
//!
//! Work items take a ticket with [`Sequencer::register`] when they start and
//! report back with [`Sequencer::resolve`] when they finish, in any order.
//! The sequencer hands results back in ticket order, buffering early
//! finishers until the ids in front of them arrive. Density-ratio admission
//! and an optional delay bound keep a lost ticket from stalling everything
//! behind it.
//!
//! ```
//! use seqgate::{EventLoop, ResultKind, Sequencer, SequencerSettings};
//!
//! let event_loop = EventLoop::new();
//! let seq = Sequencer::new(event_loop.clone(), SequencerSettings::default());
//!
//! let a = seq.register();
//! let b = seq.register();
//! let second = seq.resolve(b);
//! let first = seq.resolve(a);
//!
//! event_loop.run_until_idle();
//! assert_eq!(first.peek().map(|c| c.kind), Some(ResultKind::Queued));
//! assert_eq!(second.peek().map(|c| c.kind), Some(ResultKind::Queued));
//! ```
#![forbid(unsafe_code)]

pub mod classify;
pub mod completion;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod sequence;
pub mod sequencer;
pub mod settings;

pub use classify::{Classification, ResultKind};
pub use completion::Completion;
pub use error::{Error, Result};
pub use scheduler::{Clock, DeterministicClock, EventLoop, TaskKind, WallClock};
pub use sequence::{SEQ_SPACE, SeqId};
pub use sequencer::{Align, Sequencer};
pub use settings::{SequencerConfig, SequencerSettings};
