// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hsa-signal contributors
//
// Error taxonomy for the signal runtime.
//
// Timeouts and mid-wait invalidation are deliberately NOT here: both are
// ordinary outcomes of a wait and surface as `WaitOutcome` variants. Errors
// are reserved for operations that did not happen at all.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The signal pool could not grow, even after retrying at the minimum
    /// block size. Creation did not happen.
    #[error("signal storage exhausted even at minimum block size")]
    OutOfMemory,

    /// No exported signal is registered (or reachable in shared memory)
    /// under this IPC handle.
    #[error("unknown IPC signal handle {0:#018x}")]
    UnknownHandle(u64),

    /// Underlying OS failure (shm mapping, pshared pthread object).
    #[error(transparent)]
    Os(#[from] io::Error),
}
