//! Classification results reported for every resolve call.

use crate::sequence::SeqId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a resolve call was honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    /// Released the instant it was requested; the cursor moved by one.
    Immediate,
    /// Released after buffering, as part of an admission commit.
    Queued,
    /// Outside the pending window; released without moving the cursor.
    Late,
}

impl ResultKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Queued => "queued",
            Self::Late => "late",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Classification {
    pub id: SeqId,
    pub kind: ResultKind,
}

impl Classification {
    #[must_use]
    pub const fn new(id: SeqId, kind: ResultKind) -> Self {
        Self { id, kind }
    }

    #[must_use]
    pub const fn immediate(id: SeqId) -> Self {
        Self::new(id, ResultKind::Immediate)
    }

    #[must_use]
    pub const fn queued(id: SeqId) -> Self {
        Self::new(id, ResultKind::Queued)
    }

    #[must_use]
    pub const fn late(id: SeqId) -> Self {
        Self::new(id, ResultKind::Late)
    }

    /// `true` unless the id fell outside the window.
    #[must_use]
    pub const fn in_order(&self) -> bool {
        !matches!(self.kind, ResultKind::Late)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.kind)
    }
}
