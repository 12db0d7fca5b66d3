//! Process hardening applied before any key material is loaded.
//!
//! - [`disable_core_dumps`]: `RLIMIT_CORE = 0`, so a crash cannot write the
//!   master key or unseal shares to a core file.
//! - [`lock_memory`]: `mlockall(MCL_CURRENT | MCL_FUTURE)`, so key pages are
//!   never swapped out. Needs `CAP_IPC_LOCK` or root.
//!
//! Both are no-ops off Unix.

use std::io;

/// Set the core file size limit to zero.
///
/// # Errors
///
/// Returns the OS error if `setrlimit` fails.
#[cfg(unix)]
pub fn disable_core_dumps() -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid, initialized `rlimit` that outlives the call;
    // `setrlimit` only reads it.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &raw const limit) };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

#[cfg(not(unix))]
pub fn disable_core_dumps() -> io::Result<()> {
    Ok(())
}

/// Pin all current and future pages in RAM.
///
/// # Errors
///
/// Returns the OS error if `mlockall` fails, typically `EPERM`.
#[cfg(unix)]
pub fn lock_memory() -> io::Result<()> {
    // SAFETY: `mlockall` takes only flag bits and touches no caller memory.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

#[cfg(not(unix))]
pub fn lock_memory() -> io::Result<()> {
    Ok(())
}
