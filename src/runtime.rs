// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hsa-signal contributors
//
// RuntimeContext: the explicit owner of all process-wide signal state —
// the signal pool, the IPC registry, and the event page. Created at
// process init, torn down at shutdown. Outstanding signals hold the inner
// context alive, so the pool can only be cleared after every signal has
// been released; the ordering is structural, not a convention.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::event::EventPage;
use crate::ipc::{self, IpcRegistry};
use crate::platform::{ShmMode, ShmSegment};
use crate::pool::{SignalPool, SignalSlot};
use crate::signal::{Signal, SignalCore, SignalKind, SlotStorage};

/// Default runtime name; processes sharing signals must agree on it.
const DEFAULT_NAME: &str = "hsasig";

/// Creation options for a signal.
#[derive(Debug, Clone, Copy)]
pub struct SignalOptions {
    /// Attach an OS wake channel so blocking waits can sleep. Without it
    /// the signal is busy-wait only.
    pub event_backed: bool,
    /// Place the slot in its own shared-memory segment and register an IPC
    /// handle for it at creation.
    pub ipc_exportable: bool,
}

impl Default for SignalOptions {
    fn default() -> Self {
        Self {
            event_backed: true,
            ipc_exportable: false,
        }
    }
}

pub(crate) struct ContextInner {
    pub(crate) name: String,
    pub(crate) pool: SignalPool,
    pub(crate) registry: IpcRegistry,
    pub(crate) events: EventPage,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // All signal cores are gone by now (they hold an Arc to us), so
        // clearing only has block storage left to release.
        self.pool.clear();
    }
}

/// Handle to the signal runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<ContextInner>,
}

impl Runtime {
    /// Create (or join) the default runtime for this machine.
    pub fn new() -> Result<Self> {
        Self::with_options(DEFAULT_NAME, true)
    }

    /// Create (or join) a named runtime. The name scopes every shared
    /// object — the event page and exported signal slots — so two runtimes
    /// with different names cannot see each other's signals.
    pub fn with_name(name: &str) -> Result<Self> {
        Self::with_options(name, true)
    }

    /// Named runtime with explicit event-age capability. Disabling age
    /// tracking forces the wait engine's single-sleeper discipline; it
    /// exists for platforms (and tests) without a usable age counter.
    pub fn with_options(name: &str, event_age_tracking: bool) -> Result<Self> {
        let events = EventPage::open(&format!("{name}_events"), event_age_tracking)?;
        Ok(Self {
            inner: Arc::new(ContextInner {
                name: name.to_string(),
                pool: SignalPool::new(),
                registry: IpcRegistry::new(),
                events,
            }),
        })
    }

    /// Create an event-backed signal with `initial` value.
    pub fn create_signal(&self, initial: i64) -> Result<Signal> {
        self.create_signal_with(initial, SignalOptions::default())
    }

    /// Create a signal with explicit options. Fails with `OutOfMemory`
    /// when no backing storage can be obtained.
    pub fn create_signal_with(&self, initial: i64, opts: SignalOptions) -> Result<Signal> {
        let (slot, storage, ipc_handle) = if opts.ipc_exportable {
            let handle = ipc::next_handle();
            let seg = ShmSegment::acquire(
                &ipc::slot_shm_name(&self.inner.name, handle),
                std::mem::size_of::<SignalSlot>(),
                ShmMode::Create,
            )?;
            let slot = std::ptr::NonNull::new(seg.as_mut_ptr() as *mut SignalSlot)
                .ok_or(Error::OutOfMemory)?;
            (slot, SlotStorage::Shared(seg), Some(handle))
        } else {
            let (idx, slot) = self.inner.pool.alloc()?;
            (slot, SlotStorage::Pool(idx), None)
        };

        // Event-page exhaustion degrades to busy-wait rather than failing
        // creation; waits stay correct, just hotter.
        let (kind, wake) = if opts.event_backed {
            match self.inner.events.claim() {
                Some(ev) => (SignalKind::EventBacked, Some(ev)),
                None => {
                    log::warn!("event page full; signal degraded to busy-wait");
                    (SignalKind::BusyWaitOnly, None)
                }
            }
        } else {
            (SignalKind::BusyWaitOnly, None)
        };

        {
            let s = unsafe { slot.as_ref() };
            s.value.store(initial, Ordering::Relaxed);
            s.kind.store(kind.tag(), Ordering::Relaxed);
            if let Some(ev) = &wake {
                s.event_id.store(ev.id() as u64, Ordering::Relaxed);
            }
            if let Some(h) = ipc_handle {
                s.handle.store(h, Ordering::Release);
            }
        }

        let core = Arc::new(SignalCore {
            ctx: Arc::clone(&self.inner),
            slot,
            storage,
            kind,
            wake,
            waiting: AtomicU32::new(0),
            valid: AtomicBool::new(true),
            ipc_handle,
        });

        if let Some(handle) = ipc_handle {
            self.inner.registry.insert(handle, &core);
        }

        Ok(Signal { core })
    }

    /// Import a signal exported under `handle`.
    ///
    /// Same-process imports resolve through the registry and share the
    /// existing core; otherwise the exporter's slot segment is mapped by
    /// name and a local core is built over it. Returns `UnknownHandle`
    /// when nothing is exported under the handle anymore.
    pub fn import_signal(&self, handle: u64) -> Result<Signal> {
        if let Some(core) = self.inner.registry.lookup(handle) {
            return Ok(Signal { core });
        }

        let seg = ShmSegment::acquire(
            &ipc::slot_shm_name(&self.inner.name, handle),
            std::mem::size_of::<SignalSlot>(),
            ShmMode::Open,
        )
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::UnknownHandle(handle)
            } else {
                Error::Os(e)
            }
        })?;

        let slot = std::ptr::NonNull::new(seg.as_mut_ptr() as *mut SignalSlot)
            .ok_or(Error::UnknownHandle(handle))?;
        let s = unsafe { slot.as_ref() };
        if s.handle.load(Ordering::Acquire) != handle {
            // The exporter either has not finished publishing or already
            // tore the slot down.
            return Err(Error::UnknownHandle(handle));
        }

        let kind = SignalKind::from_tag(s.kind.load(Ordering::Relaxed));
        let wake = match kind {
            SignalKind::EventBacked => {
                let id = s.event_id.load(Ordering::Relaxed) as u32;
                Some(self.inner.events.attach(id))
            }
            SignalKind::BusyWaitOnly => None,
        };

        let core = Arc::new(SignalCore {
            ctx: Arc::clone(&self.inner),
            slot,
            storage: SlotStorage::Shared(seg),
            kind,
            wake,
            waiting: AtomicU32::new(0),
            valid: AtomicBool::new(true),
            ipc_handle: Some(handle),
        });
        self.inner.registry.insert(handle, &core);
        Ok(Signal { core })
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }
}
