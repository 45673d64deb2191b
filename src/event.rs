// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hsa-signal contributors
//
// Wake channels for event-backed signals.
//
// One named shm segment per runtime (the "event page") holds a process-
// shared pthread mutex + condition variable and a fixed array of event
// slots. Each slot carries a monotonic age counter: a producer bumps the
// age and broadcasts; a waiter that recorded an older age returns from the
// blocking call immediately instead of sleeping, which is what makes the
// sleep path safe for any number of concurrent waiters.
//
// Age tracking can be disabled at page-open time. Ages are still bumped
// and still latch a wake that races a waiter into its sleep (checked under
// the page mutex before blocking), but they no longer coordinate multiple
// concurrent sleepers; the wait engine compensates with its single-sleeper
// discipline.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::platform::posix::{
    shared_cond_broadcast, shared_cond_init, shared_cond_timedwait, shared_mutex_init,
    shared_mutex_lock, shared_mutex_unlock,
};
use crate::platform::{ShmMode, ShmSegment};

/// Event slots per page. A slot is claimed per event-backed signal and
/// recycled on release; ages persist across claims so they stay monotonic.
pub(crate) const EVENT_CAPACITY: usize = 512;

#[repr(C)]
struct EventPageHeader {
    mutex: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
}

#[repr(C)]
struct EventSlot {
    age: AtomicU64,
    claimed: AtomicU32,
    _pad: u32,
}

const PAGE_SIZE: usize =
    std::mem::size_of::<EventPageHeader>() + EVENT_CAPACITY * std::mem::size_of::<EventSlot>();

struct PageShared {
    shm: ShmSegment,
    age_tracking: bool,
    name: String,
}

// Safety: all shared contents are atomics or pshared pthread objects.
unsafe impl Send for PageShared {}
unsafe impl Sync for PageShared {}

/// Handle to a runtime's event page. Cheap to clone.
#[derive(Clone)]
pub(crate) struct EventPage {
    shared: Arc<PageShared>,
}

// All threads in a process that open the same page name must share one
// mapping: pthread objects on some platforms store pointers relative to the
// address they were initialized at, so a second mmap at a different address
// is not usable.
fn page_cache() -> &'static Mutex<HashMap<String, Weak<PageShared>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Weak<PageShared>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

impl EventPage {
    /// Open (or create) the named event page. The creator initializes the
    /// embedded mutex and condition variable in place.
    pub(crate) fn open(name: &str, age_tracking: bool) -> io::Result<Self> {
        let mut cache = page_cache().lock().unwrap();
        if let Some(weak) = cache.get(name) {
            if let Some(shared) = weak.upgrade() {
                return Ok(Self { shared });
            }
        }

        let shm = ShmSegment::acquire(name, PAGE_SIZE, ShmMode::CreateOrOpen)?;
        if shm.prev_ref_count() == 0 {
            let header = shm.as_mut_ptr() as *mut EventPageHeader;
            unsafe {
                shared_mutex_init(std::ptr::addr_of_mut!((*header).mutex))?;
                shared_cond_init(std::ptr::addr_of_mut!((*header).cond))?;
            }
            // Slot array is kernel-zeroed: ages 0, nothing claimed.
        }

        let shared = Arc::new(PageShared {
            shm,
            age_tracking,
            name: name.to_string(),
        });
        cache.insert(name.to_string(), Arc::downgrade(&shared));
        Ok(Self { shared })
    }

    fn header(&self) -> *mut EventPageHeader {
        self.shared.shm.as_mut_ptr() as *mut EventPageHeader
    }

    fn slot(&self, id: u32) -> &EventSlot {
        debug_assert!((id as usize) < EVENT_CAPACITY);
        unsafe {
            let base = self
                .shared
                .shm
                .as_mut_ptr()
                .add(std::mem::size_of::<EventPageHeader>()) as *const EventSlot;
            &*base.add(id as usize)
        }
    }

    /// Whether waits on this page may rely on per-event age counters to
    /// coordinate concurrent sleepers.
    pub(crate) fn age_tracking(&self) -> bool {
        self.shared.age_tracking
    }

    /// Two pages refer to the same wake domain iff they share a mapping.
    pub(crate) fn same_page(&self, other: &EventPage) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Claim a free event slot. Returns `None` when the page is full.
    pub(crate) fn claim(&self) -> Option<WakeEvent> {
        for id in 0..EVENT_CAPACITY as u32 {
            let slot = self.slot(id);
            if slot
                .claimed
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(WakeEvent {
                    page: self.clone(),
                    id,
                    owned: true,
                });
            }
        }
        None
    }

    /// Attach to an already-claimed slot (IPC import path). The importer
    /// does not own the claim and will not release it.
    pub(crate) fn attach(&self, id: u32) -> WakeEvent {
        WakeEvent {
            page: self.clone(),
            id,
            owned: false,
        }
    }

    fn release_slot(&self, id: u32) {
        self.slot(id).claimed.store(0, Ordering::Release);
    }

    /// Block until any of `ids` advances past its recorded age, or until
    /// `timeout_ms` elapses. Updates `last_ages` in place for every id whose
    /// age moved. Returns `Ok(false)` on timeout.
    ///
    /// This is the single OS multi-wait call the wait engine issues per
    /// sleep cycle; `ids` must be sorted and deduplicated by the caller.
    ///
    /// Ages are latched under the mutex in both page modes: a wake that
    /// fired between the caller's last value poll and this lock acquisition
    /// already bumped its age and must not be slept through. The mode only
    /// decides whether ages may coordinate concurrent sleepers.
    pub(crate) fn wait_many(
        &self,
        ids: &[u32],
        last_ages: &mut [u64],
        timeout_ms: u32,
    ) -> io::Result<bool> {
        debug_assert_eq!(ids.len(), last_ages.len());
        let header = self.header();
        let mtx = unsafe { std::ptr::addr_of_mut!((*header).mutex) };
        let cond = unsafe { std::ptr::addr_of_mut!((*header).cond) };

        unsafe { shared_mutex_lock(mtx)? };
        let result = (|| {
            if self.collect_advanced(ids, last_ages) {
                return Ok(true);
            }
            let signalled = unsafe { shared_cond_timedwait(cond, mtx, timeout_ms as u64)? };
            if self.collect_advanced(ids, last_ages) {
                return Ok(true);
            }
            Ok(signalled)
        })();
        unsafe { shared_mutex_unlock(mtx)? };
        result
    }

    fn collect_advanced(&self, ids: &[u32], last_ages: &mut [u64]) -> bool {
        let mut advanced = false;
        for (i, &id) in ids.iter().enumerate() {
            let age = self.slot(id).age.load(Ordering::Acquire);
            if age != last_ages[i] {
                last_ages[i] = age;
                advanced = true;
            }
        }
        advanced
    }

    fn notify_all(&self) -> io::Result<()> {
        let header = self.header();
        let mtx = unsafe { std::ptr::addr_of_mut!((*header).mutex) };
        let cond = unsafe { std::ptr::addr_of_mut!((*header).cond) };
        // Lock/unlock barrier so a waiter between its age check and the
        // cond wait cannot miss the broadcast.
        unsafe {
            shared_mutex_lock(mtx)?;
            shared_mutex_unlock(mtx)?;
            shared_cond_broadcast(cond)
        }
    }

    #[cfg(test)]
    pub(crate) fn name(&self) -> &str {
        &self.shared.name
    }
}

/// One claimed event slot: the wake channel of an event-backed signal.
pub(crate) struct WakeEvent {
    page: EventPage,
    id: u32,
    owned: bool,
}

impl WakeEvent {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn page(&self) -> &EventPage {
        &self.page
    }

    /// Current age of this event.
    pub(crate) fn age(&self) -> u64 {
        self.page.slot(self.id).age.load(Ordering::Acquire)
    }

    /// Advance the age and wake every sleeper on the page.
    ///
    /// Failures here are logged, not propagated: the caller already
    /// performed its atomic update and pollers will still observe it.
    pub(crate) fn signal(&self) {
        self.page.slot(self.id).age.fetch_add(1, Ordering::Release);
        if let Err(e) = self.page.notify_all() {
            log::warn!("wake notification failed on event {}: {e}", self.id);
        }
    }

    /// Single-event blocking wait; see [`EventPage::wait_many`].
    pub(crate) fn wait(&self, last_age: &mut u64, timeout_ms: u32) -> io::Result<bool> {
        let ids = [self.id];
        let mut ages = [*last_age];
        let woken = self.page.wait_many(&ids, &mut ages, timeout_ms)?;
        *last_age = ages[0];
        Ok(woken)
    }
}

impl Drop for WakeEvent {
    fn drop(&mut self) {
        if self.owned {
            self.page.release_slot(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_page(prefix: &str) -> String {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_evpage_{}_{n}", std::process::id())
    }

    #[test]
    fn claim_and_release() {
        let name = unique_page("claim");
        let page = EventPage::open(&name, true).expect("open page");
        let ev = page.claim().expect("claim");
        let id = ev.id();
        drop(ev);
        // Slot is recycled, so the next claim gets it back.
        let ev2 = page.claim().expect("claim again");
        assert_eq!(ev2.id(), id);
    }

    #[test]
    fn stale_age_returns_immediately() {
        let name = unique_page("stale");
        let page = EventPage::open(&name, true).expect("open page");
        let ev = page.claim().expect("claim");

        let mut last_age = ev.age();
        ev.signal();

        let start = std::time::Instant::now();
        let woken = ev.wait(&mut last_age, 5_000).expect("wait");
        assert!(woken);
        assert!(start.elapsed().as_millis() < 100);
        assert_eq!(last_age, ev.age());
    }

    // A wake that lands between a waiter's last poll and its blocking call
    // must be caught by the age latch even when age tracking is off.
    #[test]
    fn wake_before_sleep_is_caught_without_age_tracking() {
        let name = unique_page("edgewake");
        let page = EventPage::open(&name, false).expect("open page");
        let ev = page.claim().expect("claim");

        let mut last_age = ev.age();
        ev.signal();

        let start = std::time::Instant::now();
        let woken = ev.wait(&mut last_age, 2_000).expect("wait");
        assert!(woken, "wake preceding the sleep was lost");
        assert!(start.elapsed().as_millis() < 100);
    }

    #[test]
    fn same_name_shares_mapping() {
        let name = unique_page("shared");
        let a = EventPage::open(&name, true).expect("open a");
        let b = EventPage::open(&name, true).expect("open b");
        assert!(a.same_page(&b));
        assert_eq!(a.name(), name);
    }
}
