use std::fmt;
use std::io::{self, Write};
use std::panic::Location;
use std::sync::Arc;

use crate::ContractViolation;

/// An event reported by a [`DebugAllocator`][crate::DebugAllocator].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Diagnostic {
    /// The backing allocator could not satisfy a request.
    OutOfMemory {
        /// Payload size requested by the caller.
        size: usize,

        /// Where the request was made.
        site: &'static Location<'static>,
    },

    /// Misuse of the allocator was detected.
    Violation(ContractViolation),

    /// An allocation that was still live when leaks were reported.
    Leak {
        /// Address of the payload.
        address: usize,

        /// Size of the payload in bytes.
        size: usize,

        /// Where the allocation was made.
        site: &'static Location<'static>,
    },

    /// Concludes a leak report.
    LeakSummary {
        /// Number of live allocations.
        count: usize,

        /// Sum of the sizes of all live allocations.
        total_bytes: usize,
    },
}

impl Diagnostic {
    /// Whether this diagnostic is part of a leak report, as opposed to an error.
    #[must_use]
    pub fn is_leak_report(&self) -> bool {
        matches!(self, Self::Leak { .. } | Self::LeakSummary { .. })
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { size, site } => {
                write!(f, "out of memory: failed to allocate {size} bytes at {site}")
            }
            Self::Violation(violation) => write!(f, "{violation}"),
            Self::Leak {
                address,
                size,
                site,
            } => write!(f, "leak: {size} bytes at {address:#x} allocated at {site}"),
            Self::LeakSummary { count, total_bytes } => {
                write!(f, "leak summary: {total_bytes} bytes in {count} blocks")
            }
        }
    }
}

/// Receives the diagnostics of a [`DebugAllocator`][crate::DebugAllocator].
///
/// Diagnostics are emitted synchronously on the thread performing the allocator operation. A
/// sink must not call back into the allocator that emitted the diagnostic.
#[cfg_attr(test, mockall::automock)]
pub trait DiagnosticSink: Send + Sync {
    /// Delivers one diagnostic.
    fn emit(&self, diagnostic: &Diagnostic);
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for Arc<S> {
    fn emit(&self, diagnostic: &Diagnostic) {
        (**self).emit(diagnostic);
    }
}

/// Writes every diagnostic as one line to standard error. This is the default sink.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    #[cfg_attr(test, mutants::skip)] // Output to stderr cannot be observed by tests.
    fn emit(&self, diagnostic: &Diagnostic) {
        // There is nowhere left to report a failure to write a diagnostic.
        _ = writeln!(io::stderr().lock(), "[memkit] {diagnostic}");
    }
}

/// Emits every diagnostic as a [`tracing`] event under the `memkit` target.
///
/// Leak reports are emitted at the `WARN` level, everything else at the `ERROR` level.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    #[cfg_attr(test, mutants::skip)] // Events are only observable through a subscriber.
    fn emit(&self, diagnostic: &Diagnostic) {
        if diagnostic.is_leak_report() {
            tracing::warn!(target: "memkit", "{diagnostic}");
        } else {
            tracing::error!(target: "memkit", "{diagnostic}");
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Operation;

    assert_impl_all!(Diagnostic: Send, Sync, Copy, fmt::Display);
    assert_impl_all!(StderrSink: DiagnosticSink, Default);
    assert_impl_all!(TracingSink: DiagnosticSink, Default);
    assert_impl_all!(Arc<dyn DiagnosticSink>: DiagnosticSink);

    #[test]
    fn out_of_memory_names_size_and_site() {
        let site = Location::caller();
        let text = Diagnostic::OutOfMemory { size: 123, site }.to_string();

        assert!(text.starts_with("out of memory: failed to allocate 123 bytes at "));
        assert!(text.contains(site.file()));
    }

    #[test]
    fn violation_forwards_message() {
        let violation = ContractViolation::Untracked {
            address: 0x20,
            operation: Operation::Free,
        };

        assert_eq!(
            Diagnostic::Violation(violation).to_string(),
            violation.to_string()
        );
    }

    #[test]
    fn leak_summary_format() {
        let text = Diagnostic::LeakSummary {
            count: 3,
            total_bytes: 60,
        }
        .to_string();

        assert_eq!(text, "leak summary: 60 bytes in 3 blocks");
    }

    #[test]
    fn leak_report_classification() {
        let site = Location::caller();

        assert!(
            Diagnostic::Leak {
                address: 1,
                size: 1,
                site
            }
            .is_leak_report()
        );
        assert!(!Diagnostic::OutOfMemory { size: 1, site }.is_leak_report());
        assert!(!Diagnostic::Violation(ContractViolation::Poisoned).is_leak_report());
    }

    #[test]
    fn arc_forwards_to_inner_sink() {
        let mut mock = MockDiagnosticSink::new();
        mock.expect_emit()
            .withf(|d| matches!(d, Diagnostic::LeakSummary { count: 0, .. }))
            .times(1)
            .return_const(());

        let sink: Arc<dyn DiagnosticSink> = Arc::new(mock);
        sink.emit(&Diagnostic::LeakSummary {
            count: 0,
            total_bytes: 0,
        });
    }

    #[test]
    fn tracing_sink_emits_without_subscriber() {
        TracingSink.emit(&Diagnostic::LeakSummary {
            count: 1,
            total_bytes: 8,
        });
        TracingSink.emit(&Diagnostic::Violation(ContractViolation::Poisoned));
    }
}
