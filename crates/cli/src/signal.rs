//! Interrupt delivery.
//!
//! # Safety
//!
//! Installing a handler requires `libc::signal`. The handler only raises an
//! atomic flag, which is async-signal-safe; everything else happens on the
//! main thread at the orchestrator's suspension points.
#![allow(unsafe_code)]

use std::sync::OnceLock;

use endpoint::Interrupt;

static INTERRUPT: OnceLock<Interrupt> = OnceLock::new();

extern "C" fn raise_flag(_signal: libc::c_int) {
    if let Some(interrupt) = INTERRUPT.get() {
        interrupt.raise();
    }
}

/// Routes SIGINT and SIGTERM into the shared cancellation flag.
pub(crate) fn install(interrupt: &Interrupt) {
    if INTERRUPT.set(interrupt.clone()).is_err() {
        return;
    }
    #[cfg(unix)]
    unsafe {
        libc::signal(
            libc::SIGINT,
            raise_flag as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            raise_flag as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
}
