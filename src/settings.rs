//! Sequencer configuration: raw options and their normalized settings.
//!
//! Sources, lowest precedence first: defaults, a JSON document, environment
//! variables. Callers (the `seqsim` binary) layer explicit flags on top with
//! [`SequencerConfig::merge`].

use crate::error::{Error, Result};
use crate::sequence::{SEQ_SPACE, SeqId};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_NEXT: &str = "SEQGATE_NEXT";
pub const ENV_MAX_BLOCKED: &str = "SEQGATE_MAX_BLOCKED";
pub const ENV_MAX_DELAY_MS: &str = "SEQGATE_MAX_DELAY_MS";

/// Raw, possibly partial options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SequencerConfig {
    /// First id `register` returns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<i64>,
    /// `present / absent` bound above which admission stops waiting for gaps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_blocked: Option<f64>,
    /// Longest a blocked head waiter may wait before the cursor is forced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<i64>,
}

impl SequencerConfig {
    #[must_use]
    pub const fn with_next(mut self, next: i64) -> Self {
        self.next = Some(next);
        self
    }

    #[must_use]
    pub const fn with_max_blocked(mut self, ratio: f64) -> Self {
        self.max_blocked = Some(ratio);
        self
    }

    #[must_use]
    pub const fn with_max_delay_ms(mut self, delay_ms: i64) -> Self {
        self.max_delay_ms = Some(delay_ms);
        self
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
        Self::from_json_str(&text)
    }

    /// Read overrides from `SEQGATE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let next = lookup(ENV_NEXT)
            .map(|raw| parse_env::<i64>(ENV_NEXT, &raw))
            .transpose()?;
        let max_blocked = lookup(ENV_MAX_BLOCKED)
            .map(|raw| parse_env::<f64>(ENV_MAX_BLOCKED, &raw))
            .transpose()?;
        let max_delay_ms = lookup(ENV_MAX_DELAY_MS)
            .map(|raw| parse_env::<i64>(ENV_MAX_DELAY_MS, &raw))
            .transpose()?;

        Ok(Self {
            next,
            max_blocked,
            max_delay_ms,
        })
    }

    /// Layer `other` on top of `self`; set fields in `other` win.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            next: other.next.or(self.next),
            max_blocked: other.max_blocked.or(self.max_blocked),
            max_delay_ms: other.max_delay_ms.or(self.max_delay_ms),
        }
    }

    /// Clamp and default every option.
    pub fn normalize(self) -> Result<SequencerSettings> {
        let max_blocked = match self.max_blocked {
            Some(ratio) if ratio.is_nan() => {
                return Err(Error::config("maxBlocked must be a number, got NaN"));
            }
            Some(ratio) => ratio.max(0.0),
            None => f64::INFINITY,
        };

        Ok(SequencerSettings {
            next: normalize_next(self.next.unwrap_or(0)),
            max_blocked,
            max_delay_ms: self.max_delay_ms.map(|ms| ms.max(0).unsigned_abs()),
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| Error::config(format!("{key}={raw:?}: {err}")))
}

/// `max(next % SEQ_SPACE, 0)`: negative starts clamp to zero.
fn normalize_next(next: i64) -> SeqId {
    SeqId::new(next.max(0).unsigned_abs() % SEQ_SPACE)
}

/// Normalized options a [`Sequencer`](crate::Sequencer) runs with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequencerSettings {
    pub next: SeqId,
    /// `f64::INFINITY` commits only perfectly dense runs.
    pub max_blocked: f64,
    /// `None` disables delay escalation.
    pub max_delay_ms: Option<u64>,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            next: SeqId::zero(),
            max_blocked: f64::INFINITY,
            max_delay_ms: None,
        }
    }
}

impl TryFrom<SequencerConfig> for SequencerSettings {
    type Error = Error;

    fn try_from(config: SequencerConfig) -> Result<Self> {
        config.normalize()
    }
}
