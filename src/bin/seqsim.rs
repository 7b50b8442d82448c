#![forbid(unsafe_code)]

//! CLI binary: replay a script of sequencer operations on a deterministic clock.
//!
//! ```text
//! cargo run --bin seqsim -- --script demo.json --max-blocked 1 --max-delay-ms 100
//! ```
//!
//! A script is a JSON array of steps:
//!
//! ```text
//! [
//!   { "op": "register" },
//!   { "op": "register" },
//!   { "op": "resolve", "id": 1 },
//!   { "op": "advance", "ms": 150 },
//!   { "op": "resolve", "id": 0 },
//!   { "op": "run" }
//! ]
//! ```
//!
//! Every issued id and every delivered classification is printed as one
//! JSON line on stdout.

use std::cell::Cell;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use seqgate::{
    Classification, DeterministicClock, EventLoop, SeqId, Sequencer, SequencerConfig,
};
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "seqsim")]
#[command(about = "Replay sequencer operations and print the delivery trace")]
struct Args {
    /// Path to the JSON script. Reads stdin when omitted.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Path to a JSON sequencer config (`next`, `maxBlocked`, `maxDelayMs`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// First id to issue.
    #[arg(long, allow_negative_numbers = true)]
    next: Option<i64>,

    /// Density ratio above which admission stops waiting for gaps.
    #[arg(long)]
    max_blocked: Option<f64>,

    /// Delay bound for a blocked queue head, in milliseconds.
    #[arg(long)]
    max_delay_ms: Option<i64>,

    /// Clock value the simulation starts at.
    #[arg(long, default_value_t = 0)]
    start_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase", deny_unknown_fields)]
enum Step {
    Register,
    Resolve { id: SeqId },
    Immediate,
    Advance { ms: u64 },
    Run,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let steps = load_script(args.script.as_ref())?;

    let clock = Arc::new(DeterministicClock::new(args.start_ms));
    let event_loop = EventLoop::with_clock(Arc::clone(&clock));
    let sequencer =
        Sequencer::from_config(event_loop.clone(), config).context("normalizing sequencer config")?;
    tracing::debug!(event = "seqsim.start", steps = steps.len(), settings = ?sequencer.settings());

    let current = Rc::new(Cell::new(0_usize));
    for (index, step) in steps.into_iter().enumerate() {
        current.set(index);
        match step {
            Step::Register => {
                let id = sequencer.register();
                print_line(&json!({ "event": "register", "step": index, "id": id }));
            }
            Step::Resolve { id } => {
                sequencer.schedule(id, deliver(&event_loop, &current));
            }
            Step::Immediate => {
                let id = sequencer.register();
                print_line(&json!({ "event": "register", "step": index, "id": id }));
                sequencer.schedule(id, deliver(&event_loop, &current));
            }
            Step::Advance { ms } => {
                clock.advance(ms);
                event_loop.run_until_idle();
            }
            Step::Run => {
                event_loop.run_until_idle();
            }
        }
    }

    event_loop.run_to_completion();
    print_line(&json!({
        "event": "summary",
        "now_ms": event_loop.now_ms(),
        "cursor": sequencer.cursor(),
        "next": sequencer.next_id(),
        "pending": sequencer.pending(),
    }));

    Ok(())
}

fn load_config(args: &Args) -> Result<SequencerConfig> {
    let file = args
        .config
        .as_ref()
        .map(|path| {
            SequencerConfig::from_path(path)
                .with_context(|| format!("reading sequencer config from {}", path.display()))
        })
        .transpose()?
        .unwrap_or_default();
    let env = SequencerConfig::from_env().context("reading SEQGATE_* environment")?;
    let flags = SequencerConfig {
        next: args.next,
        max_blocked: args.max_blocked,
        max_delay_ms: args.max_delay_ms,
    };

    Ok(file.merge(env).merge(flags))
}

fn load_script(path: Option<&PathBuf>) -> Result<Vec<Step>> {
    let text = match path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("reading script from {}", path.display()))?,
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("reading script from stdin")?;
            text
        }
    };
    serde_json::from_str(&text).context("parsing script")
}

fn deliver(
    event_loop: &EventLoop<Arc<DeterministicClock>>,
    current: &Rc<Cell<usize>>,
) -> impl FnOnce(Classification) + 'static {
    let event_loop = event_loop.clone();
    let current = Rc::clone(current);
    move |result| {
        print_line(&json!({
            "event": "deliver",
            "step": current.get(),
            "at_ms": event_loop.now_ms(),
            "id": result.id,
            "kind": result.kind,
        }));
    }
}

fn print_line(value: &serde_json::Value) {
    println!("{value}");
}
