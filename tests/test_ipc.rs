// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hsa-signal contributors
//
// Signal export/import: registry resolution, shared-memory re-mapping,
// cross-context visibility and wake-up, unknown-handle errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use hsa_signal::{
    Error, MemOrder, Runtime, SignalCondition, SignalOptions, WaitHint, WaitOutcome,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let _ = env_logger::builder().is_test(true).try_init();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("hsasig_{prefix}_{}_{n}", std::process::id())
}

const MS: u64 = 1_000_000;

const EXPORTABLE: SignalOptions = SignalOptions {
    event_backed: true,
    ipc_exportable: true,
};

#[test]
fn exported_signal_carries_a_handle() {
    let rt = Runtime::with_name(&unique_name("handle")).expect("runtime");
    let plain = rt.create_signal(0).expect("signal");
    assert_eq!(plain.ipc_handle(), None);

    let exported = rt.create_signal_with(0, EXPORTABLE).expect("signal");
    assert!(exported.ipc_handle().is_some());

    let other = rt.create_signal_with(0, EXPORTABLE).expect("signal");
    assert_ne!(exported.ipc_handle(), other.ipc_handle());
}

// Same-context import resolves through the registry: both handles are the
// same signal, not two mappings of it.
#[test]
fn same_context_import_shares_the_core() {
    let rt = Runtime::with_name(&unique_name("same")).expect("runtime");
    let exported = rt.create_signal_with(7, EXPORTABLE).expect("signal");
    let handle = exported.ipc_handle().expect("handle");

    let imported = rt.import_signal(handle).expect("import");
    assert_eq!(imported.load(MemOrder::Acquire), 7);
    assert_eq!(exported.ref_count(), 2);

    imported.store(42, MemOrder::Release);
    assert_eq!(exported.load(MemOrder::Acquire), 42);
}

// A second runtime under the same name maps the exporter's slot segment by
// name. Stores must be visible both ways through the shared mapping.
#[test]
fn import_through_second_context_maps_the_slot() {
    let name = unique_name("remap");
    let exporter = Runtime::with_name(&name).expect("runtime");
    let importer = Runtime::with_name(&name).expect("runtime");

    let exported = exporter.create_signal_with(5, EXPORTABLE).expect("signal");
    let handle = exported.ipc_handle().expect("handle");

    let imported = importer.import_signal(handle).expect("import");
    assert_eq!(imported.load(MemOrder::Acquire), 5);
    assert_eq!(imported.ipc_handle(), Some(handle));

    imported.add(10, MemOrder::AcqRel);
    assert_eq!(exported.load(MemOrder::Acquire), 15);

    exported.store(-3, MemOrder::Release);
    assert_eq!(imported.load(MemOrder::Acquire), -3);
}

// Wake-up across contexts: a waiter on the imported signal must be
// released by a store through the exporter's handle. Both contexts open
// the same event page, so the wake channel crosses the context boundary.
#[test]
fn store_through_exporter_wakes_importer_waiter() {
    let name = unique_name("wake");
    let exporter = Runtime::with_name(&name).expect("runtime");
    let importer = Runtime::with_name(&name).expect("runtime");

    let exported = exporter.create_signal_with(1, EXPORTABLE).expect("signal");
    let handle = exported.ipc_handle().expect("handle");
    let imported = importer.import_signal(handle).expect("import");

    let waiter = thread::spawn(move || {
        imported.wait(SignalCondition::Eq, 0, 10_000 * MS, WaitHint::Blocked)
    });

    thread::sleep(Duration::from_millis(50));
    exported.store(0, MemOrder::Release);
    assert_eq!(waiter.join().unwrap(), WaitOutcome::Satisfied(0));
}

#[test]
fn unknown_handle_is_an_error() {
    let rt = Runtime::with_name(&unique_name("unknown")).expect("runtime");
    match rt.import_signal(0xdead_beef_0000_0001) {
        Err(Error::UnknownHandle(h)) => assert_eq!(h, 0xdead_beef_0000_0001),
        other => panic!("expected UnknownHandle, got {other:?}"),
    }
}

// Importing twice through the same context returns the cached core rather
// than re-mapping.
#[test]
fn repeat_import_hits_the_registry() {
    let name = unique_name("repeat");
    let exporter = Runtime::with_name(&name).expect("runtime");
    let importer = Runtime::with_name(&name).expect("runtime");

    let exported = exporter.create_signal_with(0, EXPORTABLE).expect("signal");
    let handle = exported.ipc_handle().expect("handle");

    let first = importer.import_signal(handle).expect("import");
    let second = importer.import_signal(handle).expect("import");
    assert_eq!(first.ref_count(), 2);

    first.store(9, MemOrder::Release);
    assert_eq!(second.load(MemOrder::Acquire), 9);
}
