//! Error number definitions.
//!
//! Errno-style codes carried by [`crate::error::MutexError`] and returned by
//! the lock backends. Values match Linux `<errno.h>`.

pub const EPERM: i32 = 1;
pub const ESRCH: i32 = 3;
pub const EINTR: i32 = 4;
pub const EIO: i32 = 5;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const ETIMEDOUT: i32 = 110;

/// Engine-specific: the environment panicked and must be recovered.
pub const DB_RUNRECOVERY: i32 = -30973;

/// Reads the calling thread's last OS error.
///
/// Returns `EAGAIN` when the OS did not report one, so callers never see a
/// zero errno on a failure path.
pub fn last_os_errno() -> i32 {
    match std::io::Error::last_os_error().raw_os_error() {
        Some(0) | None => EAGAIN,
        Some(errno) => errno,
    }
}
