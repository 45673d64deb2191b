// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hsa-signal contributors
//
// Queue drain tracking on top of Signal/WaitEngine.
//
// The queue byte-protocol is out of scope; this module only knows about
// the producer-side write pointer, the device-updated read pointer, and
// the doorbell. submit() publishes work and never blocks; wait_for_drain()
// either polls the read pointer (wraparound-safe) or parks on a
// completion signal the device stores to when it drains.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock;
use crate::error::Result;
use crate::platform::spin_hint;
use crate::runtime::{Runtime, SignalOptions};
use crate::signal::{MemOrder, Signal, SignalCondition, WaitHint, WaitOutcome};

/// The device doorbell register: an opaque, non-blocking write strictly
/// ordered after the write-pointer store.
pub trait Doorbell: Send + Sync {
    fn ring(&self, wptr: u64);
}

/// Tracks whether a queue has drained past a submission point.
///
/// The write pointer is monotonic and wraps; all comparisons use wrapping
/// arithmetic, so a queue can run forever.
pub struct CompletionTracker {
    wptr: AtomicU64,
    /// Device-updated read pointer (mapped register in the real stack).
    rptr: Arc<AtomicU64>,
    doorbell: Arc<dyn Doorbell>,
    completion: Signal,
}

impl CompletionTracker {
    /// `rptr` is the device's read-pointer mapping; the tracker only ever
    /// reads it.
    pub fn new(runtime: &Runtime, rptr: Arc<AtomicU64>, doorbell: Arc<dyn Doorbell>) -> Result<Self> {
        // The completion signal is stored to by the device-side handler,
        // so it must be event-backed for the blocking drain path.
        let completion = runtime.create_signal_with(
            0,
            SignalOptions {
                event_backed: true,
                ipc_exportable: false,
            },
        )?;
        Ok(Self {
            wptr: AtomicU64::new(0),
            rptr,
            doorbell,
            completion,
        })
    }

    /// Publish `packets` new packets. Never blocks.
    ///
    /// Ordering contract: the write-pointer store is release-ordered, an
    /// explicit barrier separates it from the doorbell write, and the
    /// doorbell write comes last — the device must never observe a
    /// doorbell for packets whose write pointer is not yet visible.
    pub fn submit(&self, packets: u64) -> u64 {
        let new_wptr = self
            .wptr
            .fetch_add(packets, Ordering::Release)
            .wrapping_add(packets);
        fence(Ordering::SeqCst);
        self.doorbell.ring(new_wptr);
        new_wptr
    }

    /// Write pointer after the most recent submit.
    pub fn write_index(&self) -> u64 {
        self.wptr.load(Ordering::Acquire)
    }

    /// Packets submitted but not yet retired by the device.
    pub fn pending(&self) -> u64 {
        let wptr = self.wptr.load(Ordering::Acquire);
        let rptr = self.rptr.load(Ordering::Acquire);
        wptr.wrapping_sub(rptr)
    }

    /// The completion signal the device-side handler stores `0` into when
    /// the queue drains (the completion-packet analog).
    pub fn completion_signal(&self) -> &Signal {
        &self.completion
    }

    /// Block until every packet submitted before this call has retired.
    ///
    /// `WaitHint::Active` polls the read pointer; `WaitHint::Blocked`
    /// re-arms the completion signal and delegates to `Signal::wait`,
    /// which parks the thread instead of burning CPU while the device
    /// works through the backlog.
    pub fn wait_for_drain(&self, timeout_ticks: u64, hint: WaitHint) -> WaitOutcome {
        match hint {
            WaitHint::Active => self.poll_drain(timeout_ticks),
            WaitHint::Blocked => {
                if self.pending() == 0 {
                    return WaitOutcome::Satisfied(0);
                }
                // Re-arm silently: the store must not read as completion.
                self.completion.silent_store(1, MemOrder::Relaxed);
                if self.pending() == 0 {
                    // Drained between the check and the re-arm.
                    return WaitOutcome::Satisfied(0);
                }
                self.completion
                    .wait(SignalCondition::Eq, 0, timeout_ticks, WaitHint::Blocked)
            }
        }
    }

    fn poll_drain(&self, timeout_ticks: u64) -> WaitOutcome {
        let fast = clock::fast();
        let start = fast.now_ps();
        let limit = clock::timeout_ticks_to_ps(timeout_ticks);
        let target = self.wptr.load(Ordering::Acquire);
        loop {
            let rptr = self.rptr.load(Ordering::Acquire);
            // Wrapping distance: zero (or "past") means drained.
            if target.wrapping_sub(rptr) == 0 || target.wrapping_sub(rptr) > u64::MAX / 2 {
                fence(Ordering::Acquire);
                return WaitOutcome::Satisfied(rptr as i64);
            }
            if let Some(limit) = limit {
                if fast.now_ps().saturating_sub(start) >= limit {
                    return WaitOutcome::TimedOut;
                }
            }
            spin_hint();
        }
    }
}
