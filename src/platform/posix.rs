// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hsa-signal contributors
//
// POSIX backing for the signal runtime: named shared-memory segments for
// IPC-exported signal slots and the process-shared event page, plus raw
// helpers for pthread mutex/cond objects placed inside those segments with
// the PTHREAD_PROCESS_SHARED attribute.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

// ---------------------------------------------------------------------------
// Robust mutex symbols — not exposed by `libc` on all platforms.
// macOS has no robust mutexes; waits there rely on the shm refcount cleanup.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

// ---------------------------------------------------------------------------
// Shm naming
// ---------------------------------------------------------------------------

/// Maximum length for POSIX shm names. 0 disables truncation.
/// macOS caps names at PSHMNAMLEN (31); Linux allows 255.
#[cfg(target_os = "macos")]
const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
const SHM_NAME_MAX: usize = 0;

fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Produce a POSIX shm-safe name (with leading '/'), hash-shortened on
/// platforms with tight name limits.
pub fn make_shm_name(name: &str) -> String {
    let result = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if SHM_NAME_MAX == 0 || result.len() <= SHM_NAME_MAX {
        return result;
    }

    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = if SHM_NAME_MAX > HASH_SUFFIX_LEN + 1 {
        SHM_NAME_MAX - HASH_SUFFIX_LEN - 1
    } else {
        0
    };

    let hash = fnv1a_64(result.as_bytes());
    let mut shortened = String::with_capacity(SHM_NAME_MAX);
    shortened.push('/');
    if prefix_len > 0 {
        let body = &result[1..];
        let take = prefix_len.min(body.len());
        shortened.push_str(&body[..take]);
    }
    shortened.push('_');
    shortened.push_str(&format!("{hash:016x}"));
    shortened
}

// ---------------------------------------------------------------------------
// Layout helpers — a trailing atomic<i32> refcount is appended to every
// segment so the last process to unmap can unlink the backing object.
// ---------------------------------------------------------------------------

const ALIGN: usize = std::mem::align_of::<AtomicI32>();

fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// Returns a reference to the trailing `AtomicI32` refcount of a mapped
/// region of `total_size` bytes starting at `mem`.
///
/// # Safety
/// `mem` must point to a valid mapped region of at least `total_size` bytes.
unsafe fn acc_of(mem: *mut u8, total_size: usize) -> &'static AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

// ---------------------------------------------------------------------------
// ShmSegment — named POSIX shared memory with shared refcount lifetime
// ---------------------------------------------------------------------------

/// Open mode for a shared segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    /// Create exclusively — fail if the name already exists.
    Create,
    /// Open existing — fail if the name does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

/// A named, inter-process shared memory segment.
///
/// Backs IPC-exported signal slots and the event page. The mapped region
/// carries a trailing `atomic<i32>` reference counter shared by every
/// process mapping the same name; the last unmapper unlinks the object.
pub struct ShmSegment {
    mem: *mut u8,
    size: usize,   // total mapped size (including refcount)
    name: String,  // POSIX name (with leading '/')
    prev_ref: i32, // refcount before our increment (0 = we created it)
}

// Safety: the region is process-shared by design; all concurrently-touched
// contents are atomics or pshared pthread objects.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Acquire a named segment of `user_size` usable bytes.
    ///
    /// Fresh segments are zero-filled by the kernel; the creator (the caller
    /// observing `prev_ref_count() == 0`) must place any non-zero initial
    /// state before publishing the name to other processes.
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let perms: libc::mode_t = 0o666;
        let total_size = calc_size(user_size);

        // For CreateOrOpen: try exclusive create first so ftruncate only
        // runs when we own the fresh object. On macOS, ftruncate on an
        // already-sized shm object can zero its contents before failing.
        let (fd, need_truncate) = match mode {
            ShmMode::Create => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, true)
            }
            ShmMode::Open => {
                let f =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, false)
            }
            ShmMode::CreateOrOpen => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f != -1 {
                    (f, true)
                } else {
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() != Some(libc::EEXIST) {
                        return Err(e);
                    }
                    let f2 = unsafe {
                        libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
                    };
                    if f2 == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    (f2, false)
                }
            }
        };

        unsafe { libc::fchmod(fd, perms) };

        if need_truncate {
            let ret = unsafe { libc::ftruncate(fd, total_size as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let prev = unsafe { acc_of(mem as *mut u8, total_size).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem: mem as *mut u8,
            size: total_size,
            name: posix_name,
            prev_ref: prev,
        })
    }

    /// Mutable pointer to the user-visible region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// The refcount value *before* our own increment during acquire.
    /// 0 means this handle was the first to map the segment.
    pub fn prev_ref_count(&self) -> i32 {
        self.prev_ref
    }

    /// Force-remove the backing object (shm_unlink). Does NOT unmap.
    pub fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        let prev = unsafe { acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 {
            self.unlink();
        }
    }
}

// ---------------------------------------------------------------------------
// Process-shared pthread mutex/cond helpers
//
// The event page embeds one mutex + one condition variable directly in its
// shm mapping. These helpers initialize and drive the raw objects in place;
// the caller owns placement and lifetime. No pthread_*_destroy is issued on
// teardown: on macOS a recycled virtual address could belong to a different
// segment by then, and the munmap + unlink path reclaims the memory.
// ---------------------------------------------------------------------------

/// Initialize a `pthread_mutex_t` at `mtx` with PTHREAD_PROCESS_SHARED
/// (and robustness where available).
///
/// # Safety
/// `mtx` must point to writable, zeroed memory inside a shared mapping that
/// no other thread or process is using yet.
pub unsafe fn shared_mutex_init(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    ptr::write_bytes(mtx, 0, 1);

    let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    let mut eno = libc::pthread_mutexattr_init(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }

    eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno != 0 {
        libc::pthread_mutexattr_destroy(&mut attr);
        return Err(io::Error::from_raw_os_error(eno));
    }

    #[cfg(not(target_os = "macos"))]
    {
        eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
        if eno != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(eno));
        }
    }

    eno = libc::pthread_mutex_init(mtx, &attr);
    libc::pthread_mutexattr_destroy(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Initialize a `pthread_cond_t` at `cond` with PTHREAD_PROCESS_SHARED.
///
/// # Safety
/// Same placement requirements as [`shared_mutex_init`].
pub unsafe fn shared_cond_init(cond: *mut libc::pthread_cond_t) -> io::Result<()> {
    ptr::write_bytes(cond, 0, 1);

    let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
    let mut eno = libc::pthread_condattr_init(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }

    eno = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno != 0 {
        libc::pthread_condattr_destroy(&mut attr);
        return Err(io::Error::from_raw_os_error(eno));
    }

    eno = libc::pthread_cond_init(cond, &attr);
    libc::pthread_condattr_destroy(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Lock a process-shared mutex, recovering from a dead previous owner on
/// platforms with robust mutexes.
///
/// # Safety
/// `mtx` must point to a mutex initialized by [`shared_mutex_init`].
pub unsafe fn shared_mutex_lock(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let eno = libc::pthread_mutex_lock(mtx);
    match eno {
        0 => Ok(()),
        #[cfg(not(target_os = "macos"))]
        EOWNERDEAD => {
            let eno2 = pthread_mutex_consistent(mtx);
            if eno2 != 0 {
                return Err(io::Error::from_raw_os_error(eno2));
            }
            Ok(())
        }
        _ => Err(io::Error::from_raw_os_error(eno)),
    }
}

/// # Safety
/// `mtx` must be locked by the calling thread.
pub unsafe fn shared_mutex_unlock(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let eno = libc::pthread_mutex_unlock(mtx);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Wake all waiters on a process-shared condition variable.
///
/// # Safety
/// `cond` must point to a cond initialized by [`shared_cond_init`].
pub unsafe fn shared_cond_broadcast(cond: *mut libc::pthread_cond_t) -> io::Result<()> {
    let eno = libc::pthread_cond_broadcast(cond);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Wait on `cond` with `mtx` held, for at most `timeout_ms` milliseconds.
/// Returns `Ok(true)` if signalled, `Ok(false)` on timeout.
///
/// # Safety
/// `mtx` must be locked by the calling thread; both pointers must reference
/// objects initialized by the helpers above.
pub unsafe fn shared_cond_timedwait(
    cond: *mut libc::pthread_cond_t,
    mtx: *mut libc::pthread_mutex_t,
    timeout_ms: u64,
) -> io::Result<bool> {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let deadline = now + std::time::Duration::from_millis(timeout_ms);
    let ts = libc::timespec {
        tv_sec: deadline.as_secs() as libc::time_t,
        tv_nsec: deadline.subsec_nanos() as libc::c_long,
    };
    let eno = libc::pthread_cond_timedwait(cond, mtx, &ts);
    if eno == 0 {
        return Ok(true);
    }
    if eno == libc::ETIMEDOUT {
        return Ok(false);
    }
    Err(io::Error::from_raw_os_error(eno))
}
