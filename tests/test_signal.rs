// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hsa-signal contributors
//
// Single-signal semantics: atomic ops, wait conditions, timeouts,
// invalidation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use hsa_signal::{
    MemOrder, Runtime, SignalCondition, SignalKind, SignalOptions, WaitHint, WaitOutcome,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn test_runtime(prefix: &str) -> Runtime {
    let _ = env_logger::builder().is_test(true).try_init();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("hsasig_{prefix}_{}_{n}", std::process::id());
    Runtime::with_name(&name).expect("runtime")
}

/// System-timestamp ticks per millisecond (1 GHz timestamp domain).
const MS: u64 = 1_000_000;

const ORDERS: [MemOrder; 4] = [
    MemOrder::Relaxed,
    MemOrder::Acquire,
    MemOrder::Release,
    MemOrder::AcqRel,
];

#[test]
fn store_load_roundtrip_all_orders() {
    let rt = test_runtime("roundtrip");
    let signal = rt.create_signal(0).expect("signal");
    let mut v = 1i64;
    for store_order in ORDERS {
        for load_order in ORDERS {
            signal.store(v, store_order);
            assert_eq!(signal.load(load_order), v);
            v += 1;
        }
    }
}

#[test]
fn atomic_ops() {
    let rt = test_runtime("atomics");
    let signal = rt.create_signal(0).expect("signal");

    signal.add(10, MemOrder::AcqRel);
    assert_eq!(signal.load(MemOrder::Acquire), 10);

    signal.sub(3, MemOrder::AcqRel);
    assert_eq!(signal.load(MemOrder::Acquire), 7);

    signal.or(0x8, MemOrder::Relaxed);
    assert_eq!(signal.load(MemOrder::Relaxed), 0xf);

    signal.and(0xc, MemOrder::Relaxed);
    assert_eq!(signal.load(MemOrder::Relaxed), 0xc);

    signal.xor(0xff, MemOrder::Relaxed);
    assert_eq!(signal.load(MemOrder::Relaxed), 0xf3);

    let old = signal.exchange(100, MemOrder::AcqRel);
    assert_eq!(old, 0xf3);
    assert_eq!(signal.load(MemOrder::Relaxed), 100);

    // Failed CAS returns the current value and leaves it untouched.
    let old = signal.cas(99, 1, MemOrder::AcqRel);
    assert_eq!(old, 100);
    assert_eq!(signal.load(MemOrder::Relaxed), 100);

    let old = signal.cas(100, 1, MemOrder::AcqRel);
    assert_eq!(old, 100);
    assert_eq!(signal.load(MemOrder::Relaxed), 1);
}

#[test]
fn wait_already_satisfied_returns_immediately() {
    let rt = test_runtime("presat");
    let signal = rt.create_signal(5).expect("signal");
    let start = Instant::now();
    let outcome = signal.wait(SignalCondition::Eq, 5, 10_000 * MS, WaitHint::Blocked);
    assert_eq!(outcome, WaitOutcome::Satisfied(5));
    assert!(start.elapsed().as_millis() < 50);
}

// Every condition, satisfied by a concurrent store.
#[test]
fn all_conditions_wake_on_concurrent_store() {
    let cases: [(SignalCondition, i64, i64, i64); 4] = [
        (SignalCondition::Eq, 1, 7, 7),   // initial 1, store 7, compare 7
        (SignalCondition::Ne, 4, 9, 4),   // becomes != 4
        (SignalCondition::Gte, 0, 12, 10),
        (SignalCondition::Lt, 10, 2, 5),
    ];
    let rt = test_runtime("conds");
    for (cond, initial, stored, compare) in cases {
        let signal = rt.create_signal(initial).expect("signal");
        let s = signal.clone();
        let waiter =
            thread::spawn(move || s.wait(cond, compare, 5_000 * MS, WaitHint::Blocked));
        thread::sleep(Duration::from_millis(20));
        signal.store(stored, MemOrder::Release);
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Satisfied(stored));
    }
}

// Scenario: waiter blocks on EQ 0 with a 500 ms budget; a store at ~50 ms
// must release it at ~50 ms, not at the timeout.
#[test]
fn wake_latency_tracks_store_not_timeout() {
    let rt = test_runtime("latency");
    let signal = rt.create_signal(1).expect("signal");

    let s = signal.clone();
    let waiter = thread::spawn(move || {
        let start = Instant::now();
        let outcome = s.wait(SignalCondition::Eq, 0, 500 * MS, WaitHint::Blocked);
        (outcome, start.elapsed())
    });

    thread::sleep(Duration::from_millis(50));
    signal.store(0, MemOrder::Release);

    let (outcome, elapsed) = waiter.join().unwrap();
    assert_eq!(outcome, WaitOutcome::Satisfied(0));
    assert!(
        elapsed.as_millis() < 400,
        "woke at {}ms, expected ~50ms",
        elapsed.as_millis()
    );
}

// Timeout monotonicity: a never-true condition blocks for at least the
// timeout, at most the timeout plus one polling-loop slop bound, and is
// never reported satisfied.
#[test]
fn timeout_is_monotonic() {
    let rt = test_runtime("timeout");
    let signal = rt.create_signal(1).expect("signal");

    for hint in [WaitHint::Active, WaitHint::Blocked] {
        let start = Instant::now();
        let outcome = signal.wait(SignalCondition::Eq, 0, 100 * MS, hint);
        let elapsed = start.elapsed();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(
            elapsed.as_millis() >= 95,
            "returned after {}ms, budget 100ms",
            elapsed.as_millis()
        );
        assert!(
            elapsed.as_millis() < 400,
            "overshot to {}ms, budget 100ms",
            elapsed.as_millis()
        );
    }
}

#[test]
fn zero_timeout_is_a_poll() {
    let rt = test_runtime("poll");
    let signal = rt.create_signal(1).expect("signal");
    assert_eq!(
        signal.wait(SignalCondition::Eq, 0, 0, WaitHint::Blocked),
        WaitOutcome::TimedOut
    );
    assert_eq!(
        signal.wait(SignalCondition::Eq, 1, 0, WaitHint::Blocked),
        WaitOutcome::Satisfied(1)
    );
}

#[test]
fn invalidation_releases_sleeping_waiter() {
    let rt = test_runtime("invalidate");
    let signal = rt.create_signal(1).expect("signal");

    let s = signal.clone();
    let waiter = thread::spawn(move || {
        let start = Instant::now();
        let outcome = s.wait(SignalCondition::Eq, 0, u64::MAX, WaitHint::Blocked);
        (outcome, start.elapsed())
    });

    // Let the waiter get past the poll threshold and into the sleep path.
    thread::sleep(Duration::from_millis(300));
    signal.invalidate();

    let (outcome, elapsed) = waiter.join().unwrap();
    assert_eq!(outcome, WaitOutcome::Invalid);
    assert!(elapsed.as_secs() < 5, "invalidation did not wake the sleeper");
}

#[test]
fn busy_wait_only_signal_still_waits_correctly() {
    let rt = test_runtime("busy");
    let signal = rt
        .create_signal_with(
            3,
            SignalOptions {
                event_backed: false,
                ipc_exportable: false,
            },
        )
        .expect("signal");
    assert_eq!(signal.kind(), SignalKind::BusyWaitOnly);

    let s = signal.clone();
    let waiter =
        thread::spawn(move || s.wait(SignalCondition::Lt, 0, 5_000 * MS, WaitHint::Blocked));
    thread::sleep(Duration::from_millis(30));
    signal.store(-1, MemOrder::Release);
    assert_eq!(waiter.join().unwrap(), WaitOutcome::Satisfied(-1));
}

#[test]
fn clone_is_retain() {
    let rt = test_runtime("retain");
    let signal = rt.create_signal(0).expect("signal");
    assert_eq!(signal.ref_count(), 1);
    let second = signal.clone();
    assert_eq!(signal.ref_count(), 2);
    drop(second);
    assert_eq!(signal.ref_count(), 1);
}

#[test]
fn many_producers_one_waiter() {
    let rt = test_runtime("producers");
    let signal = rt.create_signal(8).expect("signal");

    let s = signal.clone();
    let waiter =
        thread::spawn(move || s.wait(SignalCondition::Eq, 0, 10_000 * MS, WaitHint::Blocked));

    let producers: Vec<_> = (0..8)
        .map(|_| {
            let s = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                s.sub(1, MemOrder::AcqRel);
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }

    assert_eq!(waiter.join().unwrap(), WaitOutcome::Satisfied(0));
}
