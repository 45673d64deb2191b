// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hsa-signal contributors
//
// Adaptive wait engine: hybrid busy-poll / OS-sleep for one signal or a
// batch. Polls for up to 200 µs on the fast clock, then (when the hint and
// the wake channels allow) issues one bounded OS blocking call per sleep
// cycle and returns to polling.
//
// Lost-wakeup discipline: the event page latches wake ages under its mutex,
// so a wake racing a waiter into its blocking call is never slept through.
// What a page without age tracking cannot do is coordinate several
// concurrent sleepers, so the rule: each wait increments the signal's
// `waiting` count on entry; on a no-age page only the waiter that observed
// `waiting == 0` before its increment may sleep — the rest busy-poll. With
// age tracking every waiter records its last-observed ages and the
// restriction is lifted.

use std::sync::atomic::{fence, Ordering};

use crate::clock::{self, POLL_THRESHOLD_PS};
use crate::platform::spin_hint;
use crate::signal::{Signal, SignalCondition, SignalCore, WaitHint, WaitOutcome};

/// Outcome of a multi-signal wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitAnyOutcome {
    /// `signals[index]` satisfied its condition; carries the observed value.
    Satisfied { index: usize, value: i64 },
    /// `signals[index]` carries the fatal-fault marker (checked before its
    /// ordinary condition).
    Fault { index: usize },
    /// `signals[index]` was invalidated; the scan aborts at the first such
    /// signal without checking the rest.
    Invalid { index: usize },
    TimedOut,
}

/// Decrements the waiter count when a wait exits by any path.
struct WaitGuard<'a>(&'a SignalCore);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Single-signal wait. Returns the outcome and whether the OS sleep path
/// was entered at least once (the latter feeds the single-sleeper tests).
pub(crate) fn wait_signal(
    core: &SignalCore,
    condition: SignalCondition,
    compare: i64,
    timeout_ticks: u64,
    hint: WaitHint,
) -> (WaitOutcome, bool) {
    let fast = clock::fast();
    let start_ps = fast.now_ps();
    let timeout_ps = clock::timeout_ticks_to_ps(timeout_ticks);

    let prior = core.waiting.fetch_add(1, Ordering::AcqRel);
    let _guard = WaitGuard(core);

    let age_tracked = core
        .wake
        .as_ref()
        .map(|w| w.page().age_tracking())
        .unwrap_or(false);
    let wake = if hint == WaitHint::Blocked && (age_tracked || prior == 0) {
        core.wake.as_ref()
    } else {
        None
    };

    let mut last_age = core.wake.as_ref().map(|w| w.age()).unwrap_or(0);
    let mut slept = false;

    loop {
        if !core.valid.load(Ordering::Acquire) {
            return (WaitOutcome::Invalid, slept);
        }

        let value = core.slot().value.load(Ordering::Relaxed);
        if condition.satisfied(value, compare) {
            fence(Ordering::Acquire);
            return (WaitOutcome::Satisfied(value), slept);
        }

        let elapsed = fast.now_ps().saturating_sub(start_ps);
        if let Some(limit) = timeout_ps {
            if elapsed >= limit {
                return (WaitOutcome::TimedOut, slept);
            }
        }

        match wake {
            Some(wake) if elapsed >= POLL_THRESHOLD_PS => {
                let remaining = timeout_ps
                    .map(|limit| clock::remaining_ps_to_ms(limit - elapsed))
                    .unwrap_or(u32::MAX - 1);
                if remaining == 0 {
                    // Under a millisecond left: polling is cheaper than an
                    // OS sleep that would overshoot the deadline.
                    spin_hint();
                    continue;
                }
                // One bounded OS wait per cycle, then back to polling.
                slept = true;
                if let Err(e) = wake.wait(&mut last_age, remaining) {
                    log::warn!("blocking wait failed, falling back to polling: {e}");
                }
            }
            _ => spin_hint(),
        }
    }
}

/// Wait until any of `signals` satisfies its condition.
///
/// Deterministic tie-break: each polling pass scans in index order and the
/// first index satisfying wins. An invalidated signal aborts the call
/// immediately with its index; a signal carrying the fatal-fault marker
/// returns immediately, bypassing its ordinary condition.
///
/// Blocking is attempted only when the hint asks for it and every signal
/// has a wake channel on the same event page; otherwise the whole call
/// busy-polls. The borrow of `signals` holds every signal alive for the
/// duration of the call.
///
/// Length-mismatched argument arrays are a caller bug and fail fast.
pub fn wait_any(
    signals: &[Signal],
    conditions: &[SignalCondition],
    compares: &[i64],
    timeout_ticks: u64,
    hint: WaitHint,
) -> WaitAnyOutcome {
    assert!(!signals.is_empty(), "wait_any on an empty signal set");
    assert_eq!(
        signals.len(),
        conditions.len(),
        "wait_any: signals/conditions length mismatch"
    );
    assert_eq!(
        signals.len(),
        compares.len(),
        "wait_any: signals/compares length mismatch"
    );

    let fast = clock::fast();
    let start_ps = fast.now_ps();
    let timeout_ps = clock::timeout_ticks_to_ps(timeout_ticks);

    // The single-sleeper rule applies to the batch as a whole: if any
    // member already had a waiter, this call is not the designated sleeper.
    let mut prior = 0;
    for s in signals {
        prior = prior.max(s.core.waiting.fetch_add(1, Ordering::AcqRel));
    }
    let _guards: Vec<WaitGuard<'_>> = signals.iter().map(|s| WaitGuard(&*s.core)).collect();

    // Blocking needs every signal event-backed, on one shared page.
    let page = match signals[0].core.wake.as_ref().map(|w| w.page()) {
        Some(first) if signals.iter().all(|s| {
            s.core
                .wake
                .as_ref()
                .is_some_and(|w| w.page().same_page(first))
        }) =>
        {
            Some(first.clone())
        }
        _ => None,
    };
    let age_tracked = page.as_ref().is_some_and(|p| p.age_tracking());
    let sleep_page = if hint == WaitHint::Blocked && (age_tracked || prior == 0) {
        page.as_ref()
    } else {
        None
    };

    // Wake-channel id set: sorted and deduplicated, since two signals may
    // share one channel.
    let (wake_ids, mut last_ages) = match sleep_page {
        Some(page) => {
            let mut ids: Vec<u32> = signals
                .iter()
                .filter_map(|s| s.core.wake.as_ref().map(|w| w.id()))
                .collect();
            ids.sort_unstable();
            ids.dedup();
            let ages: Vec<u64> = ids.iter().map(|&id| page.attach(id).age()).collect();
            (ids, ages)
        }
        None => (Vec::new(), Vec::new()),
    };

    loop {
        for (index, signal) in signals.iter().enumerate() {
            let core = &signal.core;
            if !core.valid.load(Ordering::Acquire) {
                return WaitAnyOutcome::Invalid { index };
            }
            if core.is_fatal() {
                fence(Ordering::Acquire);
                return WaitAnyOutcome::Fault { index };
            }
            let value = core.slot().value.load(Ordering::Relaxed);
            if conditions[index].satisfied(value, compares[index]) {
                fence(Ordering::Acquire);
                return WaitAnyOutcome::Satisfied { index, value };
            }
        }

        let elapsed = fast.now_ps().saturating_sub(start_ps);
        if let Some(limit) = timeout_ps {
            if elapsed >= limit {
                return WaitAnyOutcome::TimedOut;
            }
        }

        match sleep_page {
            Some(page) if elapsed >= POLL_THRESHOLD_PS => {
                let remaining = timeout_ps
                    .map(|limit| clock::remaining_ps_to_ms(limit - elapsed))
                    .unwrap_or(u32::MAX - 1);
                if remaining == 0 {
                    spin_hint();
                    continue;
                }
                if let Err(e) = page.wait_many(&wake_ids, &mut last_ages, remaining) {
                    log::warn!("blocking multi-wait failed, falling back to polling: {e}");
                }
            }
            _ => spin_hint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, SignalOptions};
    use crate::signal::MemOrder;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc as StdArc;
    use std::thread;
    use std::time::Duration;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn test_runtime(age_tracking: bool) -> Runtime {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("hsasig_waittest_{}_{n}", std::process::id());
        Runtime::with_options(&name, age_tracking).expect("runtime")
    }

    const MS: u64 = 1_000_000; // system-timestamp ticks per millisecond

    // Without event ages the wake is edge-triggered, so of two concurrent
    // blocking waiters exactly one may take the OS sleep path; the other
    // must be forced into busy-polling.
    #[test]
    fn single_sleeper_without_age_tracking() {
        let rt = test_runtime(false);
        let signal = rt.create_signal(1).expect("signal");

        let s1 = signal.clone();
        let t1 = thread::spawn(move || {
            wait_signal(&s1.core, SignalCondition::Eq, 0, 2_000 * MS, WaitHint::Blocked).1
        });
        let s2 = signal.clone();
        let t2 = thread::spawn(move || {
            wait_signal(&s2.core, SignalCondition::Eq, 0, 2_000 * MS, WaitHint::Blocked).1
        });

        // Let both waiters pass the poll threshold before releasing them.
        thread::sleep(Duration::from_millis(300));
        signal.store(0, MemOrder::Release);

        let slept1 = t1.join().unwrap();
        let slept2 = t2.join().unwrap();
        assert!(
            !(slept1 && slept2),
            "both waiters entered the sleep path without age tracking"
        );
    }

    // With age tracking both waiters may sleep and both must still wake.
    #[test]
    fn concurrent_sleepers_with_age_tracking() {
        let rt = test_runtime(true);
        let signal = rt.create_signal(1).expect("signal");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = signal.clone();
                thread::spawn(move || {
                    s.wait(SignalCondition::Eq, 0, 5_000 * MS, WaitHint::Blocked)
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(300));
        signal.store(0, MemOrder::Release);

        for h in handles {
            assert_eq!(h.join().unwrap(), WaitOutcome::Satisfied(0));
        }
    }

    // The sleep path must actually be reachable: a lone blocking waiter
    // past the poll threshold enters it.
    #[test]
    fn lone_blocked_waiter_sleeps() {
        let rt = test_runtime(true);
        let signal = rt.create_signal(1).expect("signal");

        let s = signal.clone();
        let done = StdArc::new(AtomicUsize::new(0));
        let done2 = StdArc::clone(&done);
        let t = thread::spawn(move || {
            let (outcome, slept) =
                wait_signal(&s.core, SignalCondition::Eq, 0, 2_000 * MS, WaitHint::Blocked);
            done2.store(1, Ordering::SeqCst);
            (outcome, slept)
        });

        thread::sleep(Duration::from_millis(300));
        assert_eq!(done.load(Ordering::SeqCst), 0, "waiter returned early");
        signal.store(0, MemOrder::Release);

        let (outcome, slept) = t.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Satisfied(0));
        assert!(slept, "blocked waiter never entered the sleep path");
    }

    // A batch with a busy-wait-only member must poll for the whole call:
    // that member can never broadcast, so only a polling waiter can observe
    // its store promptly. A sleeper would stay parked until the timeout.
    #[test]
    fn mixed_batch_forces_busy_polling() {
        let rt = test_runtime(true);
        let evented = rt.create_signal(1).expect("signal");
        let busy = rt
            .create_signal_with(
                1,
                SignalOptions {
                    event_backed: false,
                    ipc_exportable: false,
                },
            )
            .expect("signal");

        let sigs = [evented, busy.clone()];
        let t = thread::spawn(move || {
            let start = std::time::Instant::now();
            let outcome = wait_any(
                &sigs,
                &[SignalCondition::Eq; 2],
                &[0, 0],
                10_000 * MS,
                WaitHint::Blocked,
            );
            (outcome, start.elapsed())
        });

        // Past the poll threshold, then satisfy the wake-less member.
        thread::sleep(Duration::from_millis(300));
        busy.store(0, MemOrder::Release);

        let (outcome, elapsed) = t.join().unwrap();
        assert_eq!(outcome, WaitAnyOutcome::Satisfied { index: 1, value: 0 });
        assert!(
            elapsed.as_millis() < 2_000,
            "batch slept past the busy-only store ({}ms)",
            elapsed.as_millis()
        );
    }

    // Active hint never sleeps, whatever the wake channel supports.
    #[test]
    fn active_hint_never_sleeps() {
        let rt = test_runtime(true);
        let signal = rt.create_signal(1).expect("signal");

        let s = signal.clone();
        let t = thread::spawn(move || {
            wait_signal(&s.core, SignalCondition::Eq, 0, 1_000 * MS, WaitHint::Active)
        });

        thread::sleep(Duration::from_millis(50));
        signal.store(0, MemOrder::Release);

        let (outcome, slept) = t.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Satisfied(0));
        assert!(!slept);
    }
}
