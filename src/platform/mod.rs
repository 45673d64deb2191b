// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hsa-signal contributors

#[cfg(unix)]
pub mod posix;

#[cfg(unix)]
pub use posix::{ShmMode, ShmSegment};

/// CPU relaxation hint for the busy-poll phase of a wait.
///
/// On hardware with a monitor/wait style instruction this would arm the
/// monitor; in user space we degrade to the portable spin-loop hint, which
/// is a capability downgrade and never a correctness change.
#[inline]
pub fn spin_hint() {
    std::hint::spin_loop();
}
