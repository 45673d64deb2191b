// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hsa-signal contributors
//
// Signal and event synchronization engine for an HSA-style GPU compute
// runtime: the Signal primitive with adaptive single/multi waits, the
// shared-memory signal pool, cross-process signal export/import, and the
// dual-clock timing subsystem bounding every timeout.

pub mod clock;

mod platform;

mod error;
pub use error::{Error, Result};

mod event;
mod ipc;
mod pool;

mod runtime;
pub use runtime::{Runtime, SignalOptions};

mod signal;
pub use signal::{MemOrder, Signal, SignalCondition, SignalKind, WaitHint, WaitOutcome};

mod wait;
pub use wait::{wait_any, WaitAnyOutcome};

mod queue;
pub use queue::{CompletionTracker, Doorbell};
