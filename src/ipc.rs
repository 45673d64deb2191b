// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hsa-signal contributors
//
// IPC signal registry: process-wide map from exported 64-bit handle to the
// local Signal core. An exported signal's slot lives in its own named shm
// segment; the handle is baked into the segment name, so any process
// sharing the runtime name can map it. Entries are weak so the registry
// never extends a signal's lifetime; removal happens on final release,
// sequenced before the storage itself is recycled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::signal::SignalCore;

/// Process-wide-unique export handle: pid in the high half, a counter in
/// the low half. Uniqueness across processes comes from the pid.
pub(crate) fn next_handle() -> u64 {
    static COUNTER: AtomicU32 = AtomicU32::new(1);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    ((std::process::id() as u64) << 32) | seq as u64
}

/// Shm segment name for an exported signal slot.
pub(crate) fn slot_shm_name(runtime_name: &str, handle: u64) -> String {
    format!("{runtime_name}_sig_{handle:016x}")
}

pub(crate) struct IpcRegistry {
    mapping: Mutex<HashMap<u64, Weak<SignalCore>>>,
}

impl IpcRegistry {
    pub(crate) fn new() -> Self {
        Self {
            mapping: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, handle: u64, core: &Arc<SignalCore>) {
        self.mapping
            .lock()
            .unwrap()
            .insert(handle, Arc::downgrade(core));
    }

    /// Look up a handle exported (or previously imported) by this process.
    pub(crate) fn lookup(&self, handle: u64) -> Option<Arc<SignalCore>> {
        self.mapping
            .lock()
            .unwrap()
            .get(&handle)
            .and_then(Weak::upgrade)
    }

    pub(crate) fn remove(&self, handle: u64) {
        self.mapping.lock().unwrap().remove(&handle);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.mapping.lock().unwrap().len()
    }
}
