use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the guard if a previous holder panicked.
#[track_caller]
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, context: &'static str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|err| {
        let caller = std::panic::Location::caller();
        tracing::error!(
            target: "jdi.wire",
            context,
            file = caller.file(),
            line = caller.line(),
            "mutex poisoned; continuing with recovered guard"
        );
        err.into_inner()
    })
}
