//! Runs against the kernel. Each test returns early only when the kernel or the
//! sandbox rejects io_uring setup or ring resizing outright.

use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::ptr::NonNull;

use ring_resize::config::SuiteConfig;
use ring_resize::error::{Outcome, Verdict};
use ring_resize::io::uring::UringEngine;
use ring_resize::io::{
    Cqe, Dispatch, Operation, RingEngine, RingMode, RingParams, RingSize, Submission,
    is_unsupported,
};
use ring_resize::scenario::ScenarioKind;
use ring_resize::suite;
use ring_resize::test_utils::small_config;

fn unavailable(err: &io::Error) -> bool {
    is_unsupported(err) || err.raw_os_error() == Some(libc::EPERM)
}

fn ring(mode: RingMode) -> Option<UringEngine> {
    let params = RingParams {
        size: RingSize::new(8, 16),
        mode,
    };
    match UringEngine::setup(params) {
        Ok(ring) => Some(ring),
        Err(e) if unavailable(&e) => None,
        Err(e) => panic!("ring setup in {mode}: {e}"),
    }
}

fn with_device(mut config: SuiteConfig) -> (SuiteConfig, tempfile::NamedTempFile) {
    let device = tempfile::NamedTempFile::new().unwrap();
    device
        .as_file()
        .set_len(config.positional_ops() * config.read_offset_stride)
        .unwrap();
    config.device = Some(device.path().to_path_buf());
    (config, device)
}

fn nop(user_data: u64) -> Submission {
    Submission {
        op: Operation::Nop,
        dispatch: Dispatch::Immediate,
        user_data,
    }
}

#[test]
fn live_suite_passes_or_skips() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (config, _device) = with_device(small_config());
    let report = suite::run(&config, UringEngine::setup);
    println!("{report}");
    assert_ne!(report.verdict(), Verdict::Fail, "{report}");
}

#[test]
fn live_ring_reports_its_size() {
    let Some(ring) = ring(RingMode::Default) else {
        return;
    };
    assert_eq!(ring.size(), RingSize::new(8, 16));
    assert_eq!(ring.mode(), RingMode::Default);
}

#[test]
fn completions_survive_resize_with_read_in_flight() {
    let (reader, mut writer) = io::pipe().unwrap();
    let mut buf = vec![0u8; 64];
    let Some(mut ring) = ring(RingMode::SingleIssuerDeferTaskrun) else {
        return;
    };

    // The pipe is empty, so the read stays in flight across the resize.
    let read = Submission {
        op: Operation::Read {
            fd: reader.as_raw_fd(),
            buf: NonNull::new(buf.as_mut_ptr()).unwrap(),
            len: buf.len() as u32,
            offset: 0,
        },
        dispatch: Dispatch::Immediate,
        user_data: 7,
    };
    // SAFETY: `buf` and `reader` outlive the ring, which is dropped first.
    unsafe {
        ring.try_push(&read).unwrap();
        ring.try_push(&nop(8)).unwrap();
    }
    assert_eq!(ring.flush().unwrap(), 2);

    match ring.resize(RingSize::new(32, 64)) {
        Err(e) if is_unsupported(&e) => return,
        other => other.unwrap(),
    }
    assert_eq!(ring.size(), RingSize::new(32, 64));

    writer.write_all(b"resized").unwrap();
    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(ring.wait_cqe().unwrap());
        ring.cqe_seen();
    }
    seen.sort_by_key(|cqe| cqe.user_data);
    assert_eq!(
        seen,
        vec![
            Cqe {
                user_data: 7,
                result: 7
            },
            Cqe {
                user_data: 8,
                result: 0
            },
        ]
    );
    assert_eq!(&buf[..7], b"resized");

    // The re-mapped rings keep working.
    // SAFETY: NOPs carry no buffers.
    unsafe { ring.try_push(&nop(9)).unwrap() };
    assert_eq!(ring.flush().unwrap(), 1);
    assert_eq!(ring.wait_cqe().unwrap().user_data, 9);
    ring.cqe_seen();
}

#[test]
fn defer_taskrun_mode_passes_every_scenario() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut config, _device) = with_device(small_config());
    config.modes = vec![RingMode::SingleIssuerDeferTaskrun];
    let report = suite::run(&config, UringEngine::setup);
    println!("{report}");

    for cell in &report.cells {
        if cell.setup.as_ref().is_some_and(Outcome::is_skip) {
            continue;
        }
        let basic = &cell.scenarios[0];
        assert_eq!(basic.kind, ScenarioKind::Basic);
        if basic.outcome.is_skip() {
            // Kernel without ring resizing.
            continue;
        }

        assert_eq!(cell.scenarios.len(), ScenarioKind::ALL.len(), "{cell}");
        for scenario in &cell.scenarios {
            assert!(scenario.outcome.is_pass(), "{cell}");
            let totals = scenario.report.as_ref().unwrap();
            assert!(totals.reconciled(), "{cell}");
            let expected = match scenario.kind {
                ScenarioKind::Basic => 2,
                ScenarioKind::PositionalReads => config.positional_ops(),
                ScenarioKind::StreamReads => config.stream_ops(),
            };
            assert_eq!(totals.completed, expected, "{cell}");
            assert!(totals.resizes > 0, "{cell}");
        }
    }
}

#[test]
fn wait_without_completion_times_out() {
    let (reader, _writer) = io::pipe().unwrap();
    let mut buf = [0u8; 16];
    let Some(mut ring) = ring(RingMode::SingleIssuerDeferTaskrun) else {
        return;
    };
    // Timed waits predate ring resizing; skip kernels without either.
    match ring.resize(RingSize::new(8, 16)) {
        Err(e) if is_unsupported(&e) => return,
        other => other.unwrap(),
    }

    let read = Submission {
        op: Operation::Read {
            fd: reader.as_raw_fd(),
            buf: NonNull::new(buf.as_mut_ptr()).unwrap(),
            len: buf.len() as u32,
            offset: 0,
        },
        dispatch: Dispatch::Immediate,
        user_data: 1,
    };
    // SAFETY: `buf` and `reader` outlive the ring, which is dropped first.
    unsafe { ring.try_push(&read).unwrap() };
    assert_eq!(ring.flush().unwrap(), 1);

    let err = ring.wait_cqe().unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
}

#[test]
fn sqpoll_flush_counts_only_its_own_entries() {
    let Some(mut ring) = ring(RingMode::SqPoll) else {
        return;
    };

    let mut next = 1;
    for round in 1..=64u32 {
        let batch = round % 8 + 1;
        for _ in 0..batch {
            // SAFETY: NOPs carry no buffers.
            unsafe { ring.try_push(&nop(next)).unwrap() };
            next += 1;
        }
        assert_eq!(ring.flush().unwrap(), batch, "round {round}");
        for _ in 0..batch {
            ring.wait_cqe().unwrap();
            ring.cqe_seen();
        }
    }
}
