//! Verifies io_uring ring resizing under load.
//!
//! Runs the baseline, positional-read and stream-read scenarios across every
//! setup mode and dispatch mode, and exits with the outer runner's convention:
//! 0 pass, 1 fail, 77 skip.
//!
//! # Usage
//!
//! ```bash
//! # Everything, positional reads skipped (no device)
//! resize-rings
//!
//! # Include positional reads from a block device
//! resize-rings --device /dev/nvme0n1
//!
//! # One cell, verbose
//! RUST_LOG=debug resize-rings --mode sqpoll --dispatch non-blocking
//! ```
//!
//! `RING_RESIZE_DEVICE`, `RING_RESIZE_BUFFERED`, `RING_RESIZE_FAN_OUT`,
//! `RING_RESIZE_READ_MIB` and `RING_RESIZE_STREAM_WRITES` set the same knobs;
//! flags win.

use std::path::PathBuf;

use clap::Parser;
use ring_resize::config::{ConfigError, SuiteConfig};
use ring_resize::constants::EXIT_FAIL;
use ring_resize::io::uring::UringEngine;
use ring_resize::io::{Dispatch, RingEngine, RingMode};
use ring_resize::scenario::ScenarioKind;
use ring_resize::suite;

#[derive(Parser)]
#[command(name = "resize-rings")]
#[command(about = "Verify that io_uring ring resizing never loses or misattributes completions")]
#[command(version)]
struct Cli {
    /// Setup modes to run (repeatable; default: all).
    #[arg(long, value_enum)]
    mode: Vec<ModeArg>,

    /// Dispatch modes to run (repeatable; default: all).
    #[arg(long, value_enum)]
    dispatch: Vec<DispatchArg>,

    /// Scenarios to run (repeatable; default: all).
    #[arg(long, value_enum)]
    scenario: Vec<ScenarioArg>,

    /// Random-access source for positional reads.
    #[arg(long)]
    device: Option<PathBuf>,

    /// Open the device without O_DIRECT.
    #[arg(long)]
    buffered: bool,

    /// Maximum reads per round.
    #[arg(long)]
    fan_out: Option<u32>,

    /// MiB the positional scenario reads.
    #[arg(long)]
    read_mib: Option<u32>,

    /// Writes the stimulus actor issues in the stream scenario.
    #[arg(long)]
    stream_writes: Option<u32>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ModeArg {
    Default,
    Sqpoll,
    SingleIssuerDeferTaskrun,
}

impl From<ModeArg> for RingMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Default => RingMode::Default,
            ModeArg::Sqpoll => RingMode::SqPoll,
            ModeArg::SingleIssuerDeferTaskrun => RingMode::SingleIssuerDeferTaskrun,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum DispatchArg {
    Immediate,
    NonBlocking,
}

impl From<DispatchArg> for Dispatch {
    fn from(arg: DispatchArg) -> Self {
        match arg {
            DispatchArg::Immediate => Dispatch::Immediate,
            DispatchArg::NonBlocking => Dispatch::NonBlocking,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ScenarioArg {
    Basic,
    PositionalReads,
    StreamReads,
}

impl From<ScenarioArg> for ScenarioKind {
    fn from(arg: ScenarioArg) -> Self {
        match arg {
            ScenarioArg::Basic => ScenarioKind::Basic,
            ScenarioArg::PositionalReads => ScenarioKind::PositionalReads,
            ScenarioArg::StreamReads => ScenarioKind::StreamReads,
        }
    }
}

impl Cli {
    fn apply(self, config: &mut SuiteConfig) {
        if !self.mode.is_empty() {
            config.modes = self.mode.into_iter().map(Into::into).collect();
        }
        if !self.dispatch.is_empty() {
            config.dispatches = self.dispatch.into_iter().map(Into::into).collect();
        }
        if !self.scenario.is_empty() {
            config.scenarios = self.scenario.into_iter().map(Into::into).collect();
        }
        if self.device.is_some() {
            config.device = self.device;
        }
        if self.buffered {
            config.buffered = true;
        }
        if let Some(n) = self.fan_out {
            config.fan_out = n;
        }
        if let Some(mib) = self.read_mib {
            config.read_budget_bytes = u64::from(mib) * 1024 * 1024;
        }
        if let Some(n) = self.stream_writes {
            config.stimulus.writes = n;
        }
    }

    /// Layers the flags over `base` and checks the result.
    fn configure(self, mut base: SuiteConfig) -> Result<SuiteConfig, ConfigError> {
        self.apply(&mut base);
        base.check()?;
        Ok(base)
    }
}

fn main() {
    env_logger::init();

    let config = match Cli::parse().configure(SuiteConfig::from_env()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("resize-rings: {e}");
            std::process::exit(EXIT_FAIL);
        }
    };

    let report = suite::run(&config, UringEngine::setup);

    println!("{report}");
    for (cell, err) in report.failures() {
        eprintln!("FAIL {} / {}: {err}", cell.mode, cell.dispatch);
    }
    std::process::exit(report.exit_code());
}
