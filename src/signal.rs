// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hsa-signal contributors
//
// The Signal primitive: an atomic 64-bit value with an optional OS-backed
// wake channel. Producers store; consumers wait. Every mutating operation
// additionally notifies the wake channel so a sleeping waiter is woken —
// a side effect, not part of the atomic's return value.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::event::WakeEvent;
use crate::pool::{SignalSlot, SlotIndex, FLAG_FATAL};
use crate::runtime::ContextInner;
use crate::wait;

/// Wait condition against the signal value. Exhaustive by construction: an
/// out-of-range condition cannot be expressed, which is the defined-failure
/// stance for that class of caller bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalCondition {
    Eq,
    Ne,
    Gte,
    Lt,
}

impl SignalCondition {
    #[inline]
    pub(crate) fn satisfied(self, current: i64, compare: i64) -> bool {
        match self {
            SignalCondition::Eq => current == compare,
            SignalCondition::Ne => current != compare,
            SignalCondition::Gte => current >= compare,
            SignalCondition::Lt => current < compare,
        }
    }
}

/// Caller's scheduling preference for a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitHint {
    /// Busy-poll for the whole wait; never enter an OS sleep.
    Active,
    /// Poll briefly, then sleep in the OS until notified.
    Blocked,
}

/// Outcome of a single-signal wait. Timeouts and invalidation are ordinary
/// outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condition held; carries the observed value.
    Satisfied(i64),
    TimedOut,
    /// The signal (or its device context) was torn down mid-wait.
    Invalid,
}

/// Memory order selector mirrored across the ABI boundary.
///
/// Loads requested with a store-only order degrade to the nearest legal
/// load order (and vice versa), matching the usual HSA binding behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOrder {
    Relaxed,
    Acquire,
    Release,
    AcqRel,
}

impl MemOrder {
    fn load(self) -> Ordering {
        match self {
            MemOrder::Relaxed | MemOrder::Release => Ordering::Relaxed,
            MemOrder::Acquire | MemOrder::AcqRel => Ordering::Acquire,
        }
    }

    fn store(self) -> Ordering {
        match self {
            MemOrder::Relaxed | MemOrder::Acquire => Ordering::Relaxed,
            MemOrder::Release | MemOrder::AcqRel => Ordering::Release,
        }
    }

    fn rmw(self) -> Ordering {
        match self {
            MemOrder::Relaxed => Ordering::Relaxed,
            MemOrder::Acquire => Ordering::Acquire,
            MemOrder::Release => Ordering::Release,
            MemOrder::AcqRel => Ordering::AcqRel,
        }
    }
}

/// Backing-storage kind tag stored in the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    BusyWaitOnly,
    EventBacked,
}

impl SignalKind {
    pub(crate) fn tag(self) -> i32 {
        match self {
            SignalKind::BusyWaitOnly => 0,
            SignalKind::EventBacked => 1,
        }
    }

    pub(crate) fn from_tag(tag: i32) -> SignalKind {
        if tag == 1 {
            SignalKind::EventBacked
        } else {
            SignalKind::BusyWaitOnly
        }
    }
}

pub(crate) enum SlotStorage {
    /// Pool-owned slot, returned on final release.
    Pool(SlotIndex),
    /// Dedicated shared-memory segment (IPC-exportable); the segment handle
    /// keeps the mapping alive and unlinks when the last process drops it.
    Shared(crate::platform::ShmSegment),
}

pub(crate) struct SignalCore {
    pub(crate) ctx: Arc<ContextInner>,
    pub(crate) slot: NonNull<SignalSlot>,
    pub(crate) storage: SlotStorage,
    pub(crate) kind: SignalKind,
    pub(crate) wake: Option<WakeEvent>,
    /// Count of threads currently inside a wait on this signal; drives the
    /// single-sleeper rule when the wake channel has no age tracking.
    pub(crate) waiting: AtomicU32,
    /// Cleared on invalidation (device removal); every waiter observes it
    /// and returns immediately.
    pub(crate) valid: AtomicBool,
    /// IPC export handle, when exported.
    pub(crate) ipc_handle: Option<u64>,
}

// Safety: the slot pointer targets storage whose lifetime is tied to
// `storage`/`ctx`, and all shared state behind it is atomic.
unsafe impl Send for SignalCore {}
unsafe impl Sync for SignalCore {}

impl SignalCore {
    #[inline]
    pub(crate) fn slot(&self) -> &SignalSlot {
        unsafe { self.slot.as_ref() }
    }

    #[inline]
    pub(crate) fn is_fatal(&self) -> bool {
        self.slot().flags.load(Ordering::Acquire) & FLAG_FATAL != 0
    }

    fn notify(&self) {
        if let Some(wake) = &self.wake {
            wake.signal();
        }
    }
}

impl Drop for SignalCore {
    fn drop(&mut self) {
        // Sequenced teardown: deregister from the IPC registry first so a
        // concurrent importer cannot resurrect a handle whose storage has
        // already been recycled, then return the storage.
        if let Some(handle) = self.ipc_handle {
            self.ctx.registry.remove(handle);
        }
        // The wake event slot is released by WakeEvent::drop after this.
        if let SlotStorage::Pool(idx) = self.storage {
            self.ctx.pool.free(idx);
        }
    }
}

/// The synchronization primitive of the runtime.
///
/// `Signal` is a counted handle: `clone()` retains, dropping the last
/// handle releases — deregistering from the IPC registry (if exported) and
/// returning the backing storage to its pool, in that order.
#[derive(Clone)]
pub struct Signal {
    pub(crate) core: Arc<SignalCore>,
}

impl Signal {
    /// Current value.
    pub fn load(&self, order: MemOrder) -> i64 {
        self.core.slot().value.load(order.load())
    }

    /// Store `value` and notify the wake channel.
    pub fn store(&self, value: i64, order: MemOrder) {
        self.core.slot().value.store(value, order.store());
        self.core.notify();
    }

    /// Store without waking sleepers. Used when re-arming a completion
    /// signal, where the store must not be mistaken for the completion.
    pub fn silent_store(&self, value: i64, order: MemOrder) {
        self.core.slot().value.store(value, order.store());
    }

    pub fn add(&self, value: i64, order: MemOrder) {
        self.core.slot().value.fetch_add(value, order.rmw());
        self.core.notify();
    }

    pub fn sub(&self, value: i64, order: MemOrder) {
        self.core.slot().value.fetch_sub(value, order.rmw());
        self.core.notify();
    }

    pub fn and(&self, value: i64, order: MemOrder) {
        self.core.slot().value.fetch_and(value, order.rmw());
        self.core.notify();
    }

    pub fn or(&self, value: i64, order: MemOrder) {
        self.core.slot().value.fetch_or(value, order.rmw());
        self.core.notify();
    }

    pub fn xor(&self, value: i64, order: MemOrder) {
        self.core.slot().value.fetch_xor(value, order.rmw());
        self.core.notify();
    }

    /// Swap in `value`, returning the previous value.
    pub fn exchange(&self, value: i64, order: MemOrder) -> i64 {
        let old = self.core.slot().value.swap(value, order.rmw());
        self.core.notify();
        old
    }

    /// Compare-and-swap; returns the previous value (equal to `expected` on
    /// success).
    pub fn cas(&self, expected: i64, value: i64, order: MemOrder) -> i64 {
        let result = self.core.slot().value.compare_exchange(
            expected,
            value,
            order.rmw(),
            order.load(),
        );
        self.core.notify();
        match result {
            Ok(old) | Err(old) => old,
        }
    }

    /// Block until `condition` holds against `compare`, the timeout
    /// elapses, or the signal is invalidated.
    ///
    /// `timeout_ticks` is in system-timestamp units
    /// ([`crate::clock::system_timestamp_frequency`]); `u64::MAX` waits
    /// forever. With [`WaitHint::Blocked`] the waiter polls for ~200 µs and
    /// then sleeps in the OS until notified.
    pub fn wait(
        &self,
        condition: SignalCondition,
        compare: i64,
        timeout_ticks: u64,
        hint: WaitHint,
    ) -> WaitOutcome {
        wait::wait_signal(&self.core, condition, compare, timeout_ticks, hint).0
    }

    /// Mark the signal invalid (device-removal path) and wake every
    /// sleeper so they observe it immediately.
    pub fn invalidate(&self) {
        self.core.valid.store(false, Ordering::Release);
        if let Some(wake) = &self.core.wake {
            wake.signal();
        }
    }

    /// Raise the out-of-band fatal-fault marker. A `wait_any` scanning this
    /// signal returns its index immediately, bypassing the ordinary
    /// condition.
    pub fn set_fatal(&self) {
        self.core
            .slot()
            .flags
            .fetch_or(FLAG_FATAL, Ordering::AcqRel);
        if let Some(wake) = &self.core.wake {
            wake.signal();
        }
    }

    /// Whether this signal currently carries the fatal-fault marker.
    pub fn is_fatal(&self) -> bool {
        self.core.is_fatal()
    }

    /// Backing kind.
    pub fn kind(&self) -> SignalKind {
        self.core.kind
    }

    /// IPC handle, when this signal was created exportable.
    pub fn ipc_handle(&self) -> Option<u64> {
        self.core.ipc_handle
    }

    /// Number of live handles to this signal (this one included).
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.core)
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("value", &self.load(MemOrder::Relaxed))
            .field("kind", &self.core.kind)
            .field("ipc_handle", &self.core.ipc_handle)
            .finish()
    }
}
