use std::sync::atomic::AtomicBool;
#[cfg(unix)]
use std::sync::atomic::Ordering;

/// Global shutdown flag. Set to `true` on first SIGINT/SIGTERM.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Install signal handlers for cooperative shutdown.
///
/// First signal sets [`SHUTDOWN`] and restores the default handler so a
/// second signal terminates immediately.
pub fn install_signal_handlers() {
    #[cfg(unix)]
    {
        // Safety: the handler only sets an atomic bool and restores the
        // default handler.
        unsafe {
            libc::signal(
                libc::SIGTERM,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
            libc::signal(
                libc::SIGINT,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
        }
    }
}

#[cfg(unix)]
extern "C" fn unix_signal_handler(signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
    unsafe {
        libc::signal(signum, libc::SIG_DFL);
    }
}
