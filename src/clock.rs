// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hsa-signal contributors
//
// Dual-clock timing subsystem.
//
// AccurateClock — the high-accuracy, higher-latency OS clock
//                 (clock_gettime(CLOCK_MONOTONIC)), scale fixed at init.
// FastClock     — a low-latency TSC-like counter calibrated once against
//                 the accurate clock; drives the wait-engine poll loops.
//
// Both are process-wide, initialized once before first use and never
// mutated afterwards. Timeout values supplied by callers are expressed in
// the system timestamp domain and converted through double-precision
// seconds, never by integer tick-to-tick scaling.

use std::sync::OnceLock;

/// Busy-poll threshold before a blocking wait is attempted: 200 µs,
/// expressed in FastClock picoseconds.
pub const POLL_THRESHOLD_PS: u128 = 200_000_000;

// ---------------------------------------------------------------------------
// AccurateClock
// ---------------------------------------------------------------------------

/// The OS monotonic clock with its tick scale captured once at init.
#[derive(Debug, Clone, Copy)]
pub struct AccurateClock {
    ns_per_tick: f64,
}

/// Tick rate of the OS monotonic clock. On POSIX the clock_gettime domain
/// reports in nanoseconds, so the frequency is a flat 1 GHz.
fn os_timer_frequency() -> u64 {
    1_000_000_000
}

#[cfg(unix)]
fn monotonic_raw_ticks() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

impl AccurateClock {
    fn init() -> Self {
        let freq = os_timer_frequency();
        Self {
            ns_per_tick: 1e9 / freq as f64,
        }
    }

    /// Current time in nanoseconds. O(1) using the stored scale.
    pub fn now_ns(&self) -> u64 {
        (monotonic_raw_ticks() as f64 * self.ns_per_tick) as u64
    }
}

/// The process-wide accurate clock.
pub fn accurate() -> &'static AccurateClock {
    static CLOCK: OnceLock<AccurateClock> = OnceLock::new();
    CLOCK.get_or_init(AccurateClock::init)
}

// ---------------------------------------------------------------------------
// FastClock
// ---------------------------------------------------------------------------

/// Low-latency clock: raw TSC reads scaled by a calibrated picoseconds-per-
/// tick factor.
#[derive(Debug, Clone, Copy)]
pub struct FastClock {
    ps_per_tick: f64,
}

#[cfg(target_arch = "x86_64")]
fn fast_raw_ticks() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

// Without an invariant TSC equivalent, fall back to the accurate clock as
// the raw source. Calibration then simply discovers a 1 GHz rate.
#[cfg(not(target_arch = "x86_64"))]
fn fast_raw_ticks() -> u64 {
    monotonic_raw_ticks()
}

/// Calibration: up to 10 trials against the accurate clock with an
/// exponentially growing target delay starting at 1 ms. A trial is accepted
/// only when the entry and exit overhead are each under a tenth of the
/// measured span, which filters out thread preemption. Among accepted
/// trials the smallest span wins; calibration stops early once the retained
/// tick delta exceeds 1000 ticks.
fn calibrate() -> FastClock {
    let acc = accurate();

    let mut best_ticks: u64 = 0;
    let mut best_ns: u64 = u64::MAX;

    let mut delay_ns: u64 = 1_000_000; // 1 ms
    for _ in 0..10 {
        let t0 = acc.now_ns();
        let r1 = fast_raw_ticks();
        let t1 = acc.now_ns();

        while acc.now_ns() - t1 < delay_ns {
            std::hint::spin_loop();
        }

        let t2 = acc.now_ns();
        let r2 = fast_raw_ticks();
        let t3 = acc.now_ns();

        let span_ns = t2 - t1;
        let entry = t1 - t0;
        let exit = t3 - t2;

        if entry * 10 < span_ns && exit * 10 < span_ns && span_ns < best_ns {
            best_ns = span_ns;
            best_ticks = r2.wrapping_sub(r1);
        }

        if best_ns != u64::MAX && best_ticks > 1000 {
            break;
        }
        delay_ns *= 2;
    }

    if best_ns == u64::MAX || best_ticks == 0 {
        // Every trial was preempted; assume the raw source runs at the OS
        // clock rate rather than leaving the clock unusable.
        return FastClock { ps_per_tick: 1e3 };
    }

    let freq = best_ticks as f64 / (best_ns as f64 / 1e9);
    FastClock {
        ps_per_tick: 1e12 / freq,
    }
}

impl FastClock {
    /// Current time in picoseconds. u128 because a u64 of picoseconds wraps
    /// after roughly 213 days of uptime.
    pub fn now_ps(&self) -> u128 {
        (fast_raw_ticks() as f64 * self.ps_per_tick) as u128
    }

    /// Calibrated tick scale, exposed for proportionality tests.
    pub fn ps_per_tick(&self) -> f64 {
        self.ps_per_tick
    }
}

/// The process-wide fast clock, calibrated at first use.
pub fn fast() -> &'static FastClock {
    static CLOCK: OnceLock<FastClock> = OnceLock::new();
    CLOCK.get_or_init(calibrate)
}

// ---------------------------------------------------------------------------
// Timeout conversion
// ---------------------------------------------------------------------------

/// Tick rate used to interpret caller-supplied timeout values. Queried from
/// the system once and cached.
pub fn system_timestamp_frequency() -> u64 {
    static FREQ: OnceLock<u64> = OnceLock::new();
    *FREQ.get_or_init(os_timer_frequency)
}

/// Convert a caller timeout in system-timestamp ticks to FastClock
/// picoseconds. `u64::MAX` means "no timeout" and yields `None`.
///
/// The conversion goes through double-precision seconds so that widely
/// different tick frequencies neither overflow nor lose the entire
/// fractional part.
pub fn timeout_ticks_to_ps(ticks: u64) -> Option<u128> {
    if ticks == u64::MAX {
        return None;
    }
    let seconds = ticks as f64 / system_timestamp_frequency() as f64;
    Some((seconds * 1e12) as u128)
}

/// Convert a remaining FastClock picosecond budget to whole milliseconds for
/// the OS blocking call, clamped to `u32::MAX - 1`.
pub fn remaining_ps_to_ms(remaining_ps: u128) -> u32 {
    let ms = remaining_ps / 1_000_000_000;
    ms.min((u32::MAX - 1) as u128) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_conversion_roundtrip() {
        // 500 ms at 1 GHz = 500e6 ticks = 500e9 ps
        let ps = timeout_ticks_to_ps(500_000_000).unwrap();
        assert_eq!(ps, 500_000_000_000);
    }

    #[test]
    fn infinite_timeout_is_none() {
        assert!(timeout_ticks_to_ps(u64::MAX).is_none());
    }

    #[test]
    fn remaining_clamps_to_u32() {
        assert_eq!(remaining_ps_to_ms(u128::MAX), u32::MAX - 1);
        assert_eq!(remaining_ps_to_ms(3_000_000_000), 3);
    }
}
