use std::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;
use parking_lot::Mutex;

static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);

lazy_static! {
    static ref FINALIZERS: Mutex<Vec<Box<dyn FnOnce() + Send>>> = Mutex::new(Vec::new());
}

/// True once a termination signal has been observed (or
/// [`request_exit`] was called). Every long blocking wait in the stack
/// polls this with a bounded timeout.
pub fn exit_requested() -> bool {
    EXIT_REQUESTED.load(Ordering::Relaxed)
}

/// Cooperative shutdown trigger, also used by tests.
pub fn request_exit() {
    EXIT_REQUESTED.store(true, Ordering::Relaxed);
}

/// Registers a finalizer to run during [`run_finalizers`] at teardown.
/// Lets subsystems hook shutdown without compile-time coupling.
pub fn register_finalizer(f: impl FnOnce() + Send + 'static) {
    FINALIZERS.lock().push(Box::new(f));
}

/// Drains and runs the registered finalizers, newest first. Idempotent:
/// a second call finds the registry empty.
pub fn run_finalizers() {
    let mut finalizers = std::mem::take(&mut *FINALIZERS.lock());
    while let Some(f) = finalizers.pop() {
        f();
    }
}

extern "C" fn handle_signal(signum: i32) {
    // async-signal-safe: only flip the flag
    let _ = signum;
    EXIT_REQUESTED.store(true, Ordering::Relaxed);
}

/// Installs SIGINT/SIGTERM handlers that set the exit flag.
#[cfg(not(windows))]
pub fn install_signal_handlers() -> crate::Result<()> {
    unsafe {
        for sig in [libc::SIGINT, libc::SIGTERM] {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_signal as usize;
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                return Err(crate::Error::Io(format!(
                    "sigaction({sig}): {}",
                    std::io::Error::last_os_error()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
pub fn install_signal_handlers() -> crate::Result<()> {
    Ok(())
}

#[cfg(test)]
mod shutdown_test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_finalizers_run_once_newest_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        for tag in ["first", "second"] {
            let order = order.clone();
            let counter = counter.clone();
            register_finalizer(move || {
                order.lock().push(tag);
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        run_finalizers();
        assert_eq!(*order.lock(), vec!["second", "first"]);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        run_finalizers();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
