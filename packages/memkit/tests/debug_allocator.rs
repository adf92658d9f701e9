//! Integration tests for `DebugAllocator`, exercising leak accounting and misuse detection
//! through the public API.
#![cfg(feature = "debug")]
#![allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]

use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use std::thread;

use memkit::{
    ContractViolation, DebugAllocator, Diagnostic, DiagnosticSink, GUARD_SIZE, Operation,
    Registry, ViolationPolicy,
};

#[derive(Debug, Default)]
struct Collector {
    seen: Mutex<Vec<Diagnostic>>,
}

impl Collector {
    fn snapshot(&self) -> Vec<Diagnostic> {
        self.seen.lock().unwrap().clone()
    }
}

impl DiagnosticSink for Collector {
    fn emit(&self, diagnostic: &Diagnostic) {
        self.seen.lock().unwrap().push(*diagnostic);
    }
}

fn collecting() -> (DebugAllocator, Arc<Collector>) {
    let collector = Arc::new(Collector::default());

    let debug = DebugAllocator::builder()
        .sink(Arc::clone(&collector))
        .violation_policy(ViolationPolicy::ReturnError)
        .build();

    (debug, collector)
}

#[test]
fn malloc_free_round_trip_leaves_nothing() {
    let (debug, collector) = collecting();

    let ptr = debug.malloc(64).unwrap().unwrap();
    unsafe { ptr.write_bytes(0x5A, 64) };
    debug.free(ptr).unwrap();

    assert_eq!(debug.print_leaks(), 0);
    assert!(collector.snapshot().is_empty());
}

#[test]
fn unfreed_allocations_are_reported() {
    let (debug, collector) = collecting();

    let _a = debug.malloc(10).unwrap().unwrap();
    let _b = debug.malloc(20).unwrap().unwrap();
    let _c = debug.malloc(30).unwrap().unwrap();

    let report = debug.leak_report();
    assert_eq!(report.count(), 3);
    assert_eq!(report.total_bytes(), 60);

    assert_eq!(debug.print_leaks(), 3);

    let seen = collector.snapshot();
    assert_eq!(
        seen.last(),
        Some(&Diagnostic::LeakSummary {
            count: 3,
            total_bytes: 60
        })
    );
    assert!(seen[..3].iter().all(Diagnostic::is_leak_report));
}

#[test]
fn writing_past_the_end_is_detected() {
    let (debug, _) = collecting();

    let ptr = debug.malloc(64).unwrap().unwrap();
    unsafe { ptr.add(64).write(1) };

    assert!(matches!(
        debug.validate(ptr),
        Err(ContractViolation::BufferOverflow { size: 64, .. })
    ));
}

#[test]
fn writing_at_the_end_of_the_guard_is_detected() {
    let (debug, _) = collecting();

    let ptr = debug.malloc(8).unwrap().unwrap();
    unsafe { ptr.add(8 + GUARD_SIZE - 1).write(1) };

    assert!(debug.validate(ptr).is_err());
}

#[test]
fn double_free_is_not_an_invalid_free() {
    let (debug, collector) = collecting();

    let ptr = debug.malloc(8).unwrap().unwrap();
    debug.free(ptr).unwrap();

    let violation = debug.free(ptr).unwrap_err();
    let ContractViolation::AlreadyFreed {
        site, operation, ..
    } = violation
    else {
        panic!("expected a double free, got {violation:?}");
    };

    assert_eq!(operation, Operation::Free);
    assert_eq!(site.file(), file!());
    assert_eq!(collector.snapshot(), vec![Diagnostic::Violation(violation)]);
}

#[test]
fn foreign_pointer_is_an_invalid_free() {
    let (debug, _) = collecting();

    let mut local = [0_u8; 32];
    let violation = debug.free(NonNull::from(&mut local).cast()).unwrap_err();

    assert!(matches!(
        violation,
        ContractViolation::Untracked {
            operation: Operation::Free,
            ..
        }
    ));
}

#[test]
fn pointer_from_another_registry_is_an_invalid_free() {
    let (first, _) = collecting();
    let (second, _) = collecting();

    let ptr = first.malloc(8).unwrap().unwrap();

    assert!(matches!(
        second.validate(ptr),
        Err(ContractViolation::Untracked { .. })
    ));

    first.free(ptr).unwrap();
}

#[test]
fn poisoned_allocator_refuses_further_work() {
    let (debug, _) = collecting();

    let ptr = debug.malloc(8).unwrap().unwrap();
    debug.free(ptr).unwrap();
    _ = debug.free(ptr).unwrap_err();

    assert!(debug.is_poisoned());
    assert_eq!(debug.malloc(1), Err(ContractViolation::Poisoned));
    assert_eq!(debug.free(ptr), Err(ContractViolation::Poisoned));
}

#[test]
fn calloc_returns_zeroed_memory() {
    let (debug, _) = collecting();

    let ptr = debug.calloc(100, 4).unwrap().unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 400) };

    assert!(bytes.iter().all(|&b| b == 0));
    debug.free(ptr).unwrap();
}

#[test]
fn realloc_keeps_data_and_tracking_consistent() {
    let (debug, _) = collecting();

    let mut ptr = debug.malloc(4).unwrap().unwrap();
    unsafe { ptr.copy_from_nonoverlapping(NonNull::from(b"memk").cast(), 4) };

    for size in [16, 256, 8192, 5] {
        ptr = debug.realloc(Some(ptr), size).unwrap().unwrap();
        debug.validate(ptr).unwrap();
        assert_eq!(debug.leak_report().total_bytes(), size);
    }

    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 4) };
    assert_eq!(bytes, b"memk");

    debug.free(ptr).unwrap();
    assert!(debug.registry().is_empty());
}

#[test]
fn shared_registry_reports_across_threads() {
    let registry = Arc::new(Registry::<parking_lot::RawMutex>::new());

    let handles: Vec<_> = (0..4_usize)
        .map(|worker| {
            let registry = Arc::clone(&registry);

            thread::spawn(move || {
                let debug = DebugAllocator::builder()
                    .registry(registry)
                    .violation_policy(ViolationPolicy::ReturnError)
                    .build();

                // Every worker leaks exactly one allocation of its own size.
                let leaked = debug.malloc(worker + 1).unwrap().unwrap();
                let freed = debug.malloc(100).unwrap().unwrap();
                debug.free(freed).unwrap();

                leaked.as_ptr().addr()
            })
        })
        .collect();

    for handle in handles {
        _ = handle.join().unwrap();
    }

    let report = registry.leak_report();
    assert_eq!(report.count(), 4);
    assert_eq!(report.total_bytes(), 1 + 2 + 3 + 4);
}
