//! Runs registered hooks when the process exits normally.

use std::mem;
use std::sync::{Mutex, Once, PoisonError};

type ExitHook = Box<dyn FnOnce() + Send>;

/// Identifies a hook so that registering the same work twice schedules it once.
pub(crate) type HookKey = (usize, usize);

struct ExitHooks {
    pending: Vec<ExitHook>,
    keys: Vec<HookKey>,
}

static EXIT_HOOKS: Mutex<ExitHooks> = Mutex::new(ExitHooks {
    pending: Vec::new(),
    keys: Vec::new(),
});

static INSTALL: Once = Once::new();

/// Schedules `hook` to run when the process exits via `exit()` or by returning from `main`.
///
/// Hooks run in registration order. Hooks registered after exit processing has started do not
/// run. If a hook with the same `key` was registered before, `hook` is dropped and `false` is
/// returned. Keys are remembered for the lifetime of the process.
pub(crate) fn at_exit(key: HookKey, hook: impl FnOnce() + Send + 'static) -> bool {
    {
        let mut hooks = EXIT_HOOKS.lock().unwrap_or_else(PoisonError::into_inner);

        if hooks.keys.contains(&key) {
            return false;
        }

        hooks.keys.push(key);
        hooks.pending.push(Box::new(hook));
    }

    INSTALL.call_once(|| {
        // SAFETY: The callback is a plain extern "C" function without preconditions.
        let result = unsafe { libc::atexit(run_exit_hooks) };

        if result != 0 {
            tracing::warn!(
                target: "memkit",
                "failed to register exit handler, leak reports will not run at exit"
            );
        }
    });

    true
}

#[cfg_attr(test, mutants::skip)] // Only runs during process exit.
extern "C" fn run_exit_hooks() {
    let hooks = {
        let mut hooks = EXIT_HOOKS.lock().unwrap_or_else(PoisonError::into_inner);
        mem::take(&mut hooks.pending)
    };

    for hook in hooks {
        hook();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Tests that drain the hooks take turns so that each one runs its own hooks.
    static SERIAL: Mutex<()> = Mutex::new(());

    static NEXT_KEY: AtomicUsize = AtomicUsize::new(0);

    /// A key no real registration uses, because no object lives at address `usize::MAX`.
    fn unique_key() -> HookKey {
        (usize::MAX, NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }

    #[test]
    fn registered_hooks_run_once_in_order() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

        let log = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));

        for id in 0..3 {
            let log = Arc::clone(&log);
            let calls = Arc::clone(&calls);

            assert!(at_exit(unique_key(), move || {
                log.lock().unwrap().push(id);
                calls.fetch_add(1, Ordering::Relaxed);
            }));
        }

        // Stands in for process exit. Hooks registered by other tests may run too.
        run_exit_hooks();
        run_exit_hooks();

        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn duplicate_key_is_scheduled_once() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

        let marker = Arc::new(AtomicUsize::new(0));
        let key = unique_key();

        let first = Arc::clone(&marker);
        assert!(at_exit(key, move || {
            first.fetch_add(1, Ordering::Relaxed);
        }));

        let second = Arc::clone(&marker);
        assert!(!at_exit(key, move || {
            second.fetch_add(1, Ordering::Relaxed);
        }));

        run_exit_hooks();

        assert_eq!(marker.load(Ordering::Relaxed), 1);
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
