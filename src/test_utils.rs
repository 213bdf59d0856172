use std::time::Duration;

use crate::config::SuiteConfig;
use crate::stimulus::StimulusConfig;

pub fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
}

pub fn proptest_cases(default: u32) -> u32 {
    env_u32("PROPTEST_CASES").unwrap_or(default)
}

/// A configuration small enough to run every scenario against the simulated
/// engine in milliseconds. Rounds still shrink below fan-out and every drain
/// crosses at least one in-drain resize.
pub fn small_config() -> SuiteConfig {
    SuiteConfig {
        fan_out: 32,
        record_len: 512,
        read_offset_stride: 1024,
        read_budget_bytes: 300 * 512,
        stimulus: StimulusConfig {
            writes: 200,
            write_len: 512,
            interval: Duration::ZERO,
            warmup: Duration::ZERO,
        },
        buffered: true,
        ..SuiteConfig::default()
    }
}
