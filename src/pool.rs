// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hsa-signal contributors
//
// SharedSignalPool: typed object pool backing non-IPC signal storage.
//
// Slots live in geometrically growing fixed-size blocks; free slots are an
// index stack (LIFO, so a freed slot is the next one handed out). Blocks
// are allocated fallibly so exhaustion surfaces as OutOfMemory instead of
// an abort, with one retry at the minimum block size.
//
// The pool never destroys live slots: clear() only releases block storage,
// and the runtime guarantees it runs after every signal has been released.
// Leftover live slots at clear() are counted and logged, never fatal.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Fatal-fault marker bit in `SignalSlot::flags`. Raised out-of-band by a
/// fault handler; `wait_any` returns the carrying signal immediately,
/// bypassing its ordinary condition.
pub(crate) const FLAG_FATAL: u32 = 1;

/// Fixed-layout signal storage, shared-memory compatible.
///
/// This is the cross-process ABI block: an i64 value, an i32 kind tag, a
/// flags word, and two 64-bit opaque ids (wake-event id and IPC handle).
/// Every field is atomic because an unbounded set of processes may touch
/// the slot concurrently.
#[repr(C)]
pub(crate) struct SignalSlot {
    pub value: AtomicI64,
    pub kind: AtomicI32,
    pub flags: AtomicU32,
    pub event_id: AtomicU64,
    pub handle: AtomicU64,
}

/// Slots per block on first growth; doubles after every successful growth.
pub(crate) const MIN_BLOCK_SLOTS: usize = 64;

/// Stable address of one slot inside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotIndex {
    block: u32,
    slot: u32,
}

struct Block {
    ptr: NonNull<SignalSlot>,
    len: usize,
}

// Safety: blocks are plain storage; slot contents are atomics.
unsafe impl Send for Block {}

struct PoolInner {
    blocks: Vec<Block>,
    free: Vec<SlotIndex>,
    next_block_slots: usize,
    granted: usize,
    allocs: u64,
    frees: u64,
    cleared: bool,
}

pub(crate) struct SignalPool {
    inner: Mutex<PoolInner>,
}

impl SignalPool {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                blocks: Vec::new(),
                free: Vec::new(),
                next_block_slots: MIN_BLOCK_SLOTS,
                granted: 0,
                allocs: 0,
                frees: 0,
                cleared: false,
            }),
        }
    }

    /// Hand out a free slot, growing the pool if the free list is empty.
    /// The returned slot is zeroed. The pointer stays valid until `clear()`;
    /// blocks never move.
    pub(crate) fn alloc(&self) -> Result<(SlotIndex, NonNull<SignalSlot>)> {
        let mut inner = self.inner.lock().unwrap();

        if inner.free.is_empty() {
            let want = inner.next_block_slots;
            if grow(&mut inner, want) {
                inner.next_block_slots = want * 2;
            } else if grow(&mut inner, MIN_BLOCK_SLOTS) {
                // One retry at the minimum size before giving up. Scale the
                // next attempt back down too; the size that just failed
                // would only fail again on the next exhaustion.
                inner.next_block_slots = MIN_BLOCK_SLOTS * 2;
            } else {
                return Err(Error::OutOfMemory);
            }
        }

        let Some(idx) = inner.free.pop() else {
            return Err(Error::OutOfMemory);
        };
        inner.allocs += 1;
        let ptr = slot_ptr(&inner, idx);
        // Recycled slots keep stale contents; hand out a clean one.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, 1) };
        Ok((idx, ptr))
    }

    /// Return a slot to the free list. The caller must be the sole owner.
    pub(crate) fn free(&self, idx: SlotIndex) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(
            !inner.free.contains(&idx),
            "slot {idx:?} double-freed to signal pool"
        );
        inner.frees += 1;
        inner.free.push(idx);
    }

    /// Release all block storage. Live slots are the caller's
    /// responsibility; any remaining are counted as leaks and logged.
    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.cleared {
            return;
        }
        inner.cleared = true;

        if cfg!(debug_assertions) {
            let leaked = inner.granted - inner.free.len();
            if leaked > 0 {
                log::warn!(
                    "signal pool torn down with {leaked} live slot(s) \
                     ({} allocs, {} frees)",
                    inner.allocs,
                    inner.frees
                );
            }
        }

        for block in inner.blocks.drain(..) {
            // The layout was validated when the block was allocated.
            if let Ok(layout) = Layout::array::<SignalSlot>(block.len) {
                unsafe { dealloc(block.ptr.as_ptr() as *mut u8, layout) };
            }
        }
        inner.free.clear();
        inner.granted = 0;
    }

    #[cfg(test)]
    pub(crate) fn granted(&self) -> usize {
        self.inner.lock().unwrap().granted
    }

    #[cfg(test)]
    pub(crate) fn free_len(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    #[cfg(test)]
    pub(crate) fn next_block_slots(&self) -> usize {
        self.inner.lock().unwrap().next_block_slots
    }

    #[cfg(test)]
    pub(crate) fn set_next_block_slots(&self, slots: usize) {
        self.inner.lock().unwrap().next_block_slots = slots;
    }
}

impl Drop for SignalPool {
    fn drop(&mut self) {
        self.clear();
    }
}

fn slot_ptr(inner: &PoolInner, idx: SlotIndex) -> NonNull<SignalSlot> {
    let block = &inner.blocks[idx.block as usize];
    debug_assert!((idx.slot as usize) < block.len);
    unsafe { NonNull::new_unchecked(block.ptr.as_ptr().add(idx.slot as usize)) }
}

/// Allocate one block of `slots` slots and push its indices onto the free
/// list (reversed, so the lowest index pops first). Returns false if the
/// allocation failed.
fn grow(inner: &mut PoolInner, slots: usize) -> bool {
    let layout = match Layout::array::<SignalSlot>(slots) {
        Ok(l) => l,
        Err(_) => return false,
    };
    let raw = unsafe { alloc_zeroed(layout) } as *mut SignalSlot;
    let Some(ptr) = NonNull::new(raw) else {
        return false;
    };

    let block_id = inner.blocks.len() as u32;
    inner.blocks.push(Block { ptr, len: slots });
    inner.granted += slots;
    for slot in (0..slots as u32).rev() {
        inner.free.push(SlotIndex {
            block: block_id,
            slot,
        });
    }
    true
}
