//! Process hardening for the runner daemon.
//!
//! The runner holds its private key and buffered job secrets in memory, so
//! before any of that is loaded it:
//!
//! 1. **`disable_core_dumps`** sets `RLIMIT_CORE` to 0 so a crash cannot
//!    write key material to disk.
//! 2. **`lock_memory`** calls `mlockall(MCL_CURRENT | MCL_FUTURE)` so pages
//!    holding secrets are never swapped out.
//!
//! Both are no-ops on non-Unix platforms.

use std::io;

/// Disable core dumps for this process.
///
/// # Errors
///
/// Returns the OS error if `setrlimit` fails.
#[cfg(unix)]
pub fn disable_core_dumps() -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    // SAFETY: `setrlimit` reads the `rlimit` we pass by reference for the
    // duration of the call only, and `rlim` outlives it.
    #[allow(unsafe_code)]
    let result = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &rlim) };

    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn disable_core_dumps() -> io::Result<()> {
    Ok(())
}

/// Pin all current and future pages in RAM.
///
/// Needs `CAP_IPC_LOCK` (or a large enough `RLIMIT_MEMLOCK`) on Linux. Set
/// `CLAWLETS_DISABLE_MLOCK=true` to skip this on development machines.
///
/// # Errors
///
/// Returns the OS error if `mlockall` fails.
#[cfg(unix)]
pub fn lock_memory() -> io::Result<()> {
    // SAFETY: `mlockall` takes only flags and does not touch process memory
    // from Rust's point of view.
    #[allow(unsafe_code)]
    let result = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };

    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn lock_memory() -> io::Result<()> {
    Ok(())
}
