//! Run configuration.
//!
//! Layering: [`SuiteConfig::default`] carries the protocol constants,
//! [`SuiteConfig::from_env`] applies `RING_RESIZE_*` overrides, and the binary
//! applies command-line flags last. [`SuiteConfig::check`] runs once the layers
//! are merged; [`SuiteConfig::validate`] is its panicking form for callers that
//! built the configuration themselves.

use std::path::PathBuf;

use log::warn;
use thiserror::Error;

use crate::capacity::CapacitySchedule;
use crate::constants::{
    BASIC_CQ_ENTRIES, BASIC_SQ_ENTRIES, FAN_OUT_DEFAULT, PRELUDE_CQ_ENTRIES, PRELUDE_SQ_ENTRIES,
    READ_BUDGET_BYTES, READ_OFFSET_STRIDE, RECORD_LEN, RESIZE_STRIDE, SETUP_CQ_ENTRIES,
    SETUP_SQ_ENTRIES, SQ_ENTRIES_MAX,
};
use crate::io::{Dispatch, RingMode, RingSize};
use crate::scenario::ScenarioKind;
use crate::stimulus::StimulusConfig;

pub const ENV_DEVICE: &str = "RING_RESIZE_DEVICE";
pub const ENV_BUFFERED: &str = "RING_RESIZE_BUFFERED";
pub const ENV_FAN_OUT: &str = "RING_RESIZE_FAN_OUT";
pub const ENV_READ_MIB: &str = "RING_RESIZE_READ_MIB";
pub const ENV_STREAM_WRITES: &str = "RING_RESIZE_STREAM_WRITES";

/// A setting the protocol cannot run with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub &'static str);

fn ensure(ok: bool, what: &'static str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError(what))
    }
}

#[derive(Debug, Clone)]
pub struct SuiteConfig {
    /// Setup modes to run, in order.
    pub modes: Vec<RingMode>,
    pub dispatches: Vec<Dispatch>,
    pub scenarios: Vec<ScenarioKind>,

    /// Upper bound on ops placed per round.
    pub fan_out: u32,
    /// Completions between in-drain resizes.
    pub resize_stride: u32,
    pub schedule: CapacitySchedule,

    pub setup_size: RingSize,
    /// Size bulk scenarios grow to before their first round.
    pub prelude_size: RingSize,
    /// Size the baseline scenario resizes to between its two ops.
    pub basic_size: RingSize,

    /// Bytes per read.
    pub record_len: u32,
    pub read_offset_stride: u64,
    /// Bytes the positional scenario accounts for, one record per completion.
    pub read_budget_bytes: u64,
    pub stimulus: StimulusConfig,

    /// Random-access source for positional reads.
    pub device: Option<PathBuf>,
    /// Open `device` without `O_DIRECT`.
    pub buffered: bool,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            modes: RingMode::ALL.to_vec(),
            dispatches: Dispatch::ALL.to_vec(),
            scenarios: ScenarioKind::ALL.to_vec(),
            fan_out: FAN_OUT_DEFAULT,
            resize_stride: RESIZE_STRIDE,
            schedule: CapacitySchedule::cycle_default(),
            setup_size: RingSize::new(SETUP_SQ_ENTRIES, SETUP_CQ_ENTRIES),
            prelude_size: RingSize::new(PRELUDE_SQ_ENTRIES, PRELUDE_CQ_ENTRIES),
            basic_size: RingSize::new(BASIC_SQ_ENTRIES, BASIC_CQ_ENTRIES),
            record_len: RECORD_LEN,
            read_offset_stride: READ_OFFSET_STRIDE,
            read_budget_bytes: READ_BUDGET_BYTES,
            stimulus: StimulusConfig::default(),
            device: None,
            buffered: false,
        }
    }
}

impl SuiteConfig {
    /// Defaults with `RING_RESIZE_*` overrides from the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Applies overrides looked up through `var`. Unparsable values are logged
    /// and ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = var(ENV_DEVICE).filter(|p| !p.is_empty()) {
            self.device = Some(PathBuf::from(path));
        }
        if let Some(value) = var(ENV_BUFFERED) {
            self.buffered = matches!(value.as_str(), "1" | "true" | "yes");
        }
        if let Some(n) = parse_u32(&var, ENV_FAN_OUT) {
            self.fan_out = n;
        }
        if let Some(mib) = parse_u32(&var, ENV_READ_MIB) {
            self.read_budget_bytes = u64::from(mib) * 1024 * 1024;
        }
        if let Some(n) = parse_u32(&var, ENV_STREAM_WRITES) {
            self.stimulus.writes = n;
        }
    }

    /// Checks every user-tunable setting.
    ///
    /// # Panics
    ///
    /// Panics on an invalid ring size; those are not exposed to users.
    pub fn check(&self) -> Result<(), ConfigError> {
        ensure(!self.modes.is_empty(), "no setup modes selected")?;
        ensure(!self.dispatches.is_empty(), "no dispatch modes selected")?;
        ensure(!self.scenarios.is_empty(), "no scenarios selected")?;

        ensure(self.fan_out > 0, "fan-out must be positive")?;
        ensure(self.fan_out <= SQ_ENTRIES_MAX, "fan-out above kernel maximum")?;
        ensure(self.resize_stride > 0, "resize stride must be positive")?;

        self.setup_size.validate();
        self.prelude_size.validate();
        self.basic_size.validate();

        ensure(self.record_len > 0, "record length must be positive")?;
        ensure(
            self.read_offset_stride >= u64::from(self.record_len),
            "positional reads must not overlap",
        )?;
        ensure(
            self.read_budget_bytes >= u64::from(self.record_len),
            "read budget must cover at least one record",
        )?;

        ensure(self.stimulus.writes > 0, "stimulus must write at least once")?;
        ensure(
            self.stimulus.writes > self.fan_out,
            "stream writes must exceed one full round",
        )
    }

    /// # Panics
    ///
    /// Panics on any setting the protocol cannot run with.
    pub fn validate(&self) {
        if let Err(e) = self.check() {
            panic!("{e}");
        }
        self.stimulus.validate();
    }

    /// Completions the positional scenario drains.
    pub fn positional_ops(&self) -> u64 {
        self.read_budget_bytes.div_ceil(u64::from(self.record_len))
    }

    /// Reads the stream scenario issues: every write but one round's worth, so
    /// the reader never outruns the producer.
    pub fn stream_ops(&self) -> u64 {
        u64::from(self.stimulus.writes - self.fan_out)
    }
}

fn parse_u32<F>(var: &F, name: &str) -> Option<u32>
where
    F: Fn(&str) -> Option<String>,
{
    let value = var(name)?;
    match value.trim().parse() {
        Ok(n) => Some(n),
        Err(e) => {
            warn!("ignoring {name}={value:?}: {e}");
            None
        }
    }
}
