//! Error taxonomy for the mutex subsystem.
//!
//! Four classes, each with a fixed propagation policy:
//!
//! - capacity (`OutOfMutexes`, `RegistryFull`): returned to the caller, never
//!   retried internally;
//! - platform (`InitFailed`, `DestroyFailed`, backend OS errors): init and
//!   destroy failures are returned, an OS error inside lock/unlock panics the
//!   environment and surfaces as `RunRecovery`;
//! - consistency (`NotAllocated`, `NotHeld`, `InvalidHandle`): panics the
//!   environment in strict mode, returned as-is in relaxed mode;
//! - setup (`LayoutMismatch`, `FailchkUnsupported`, `InvalidConfig`, `Io`).

use thiserror::Error;

use crate::errno;

#[derive(Debug, Error)]
pub enum MutexError {
    #[error("unable to allocate a mutex: all {max} slots in use; increase the mutex maximum")]
    OutOfMutexes { max: u32 },
    #[error("thread registry full ({max} entries); increase the configured thread count")]
    RegistryFull { max: u32 },
    #[error("mutex backend initialization failed (errno {errno})")]
    InitFailed { errno: i32 },
    #[error("mutex backend destroy failed (errno {errno})")]
    DestroyFailed { errno: i32 },
    #[error("environment panic: run database recovery")]
    RunRecovery,
    #[error("mutex {id} is not allocated")]
    NotAllocated { id: u32 },
    #[error("unlock of mutex {id} which is not held")]
    NotHeld { id: u32 },
    #[error("mutex handle {id} is outside the region")]
    InvalidHandle { id: u32 },
    #[error("invalid mutex flags {bits:#x}")]
    InvalidFlags { bits: u32 },
    #[error("mutex region layout mismatch: {field}")]
    LayoutMismatch { field: &'static str },
    #[error("failchk requires an is_alive liveness probe")]
    FailchkUnsupported,
    #[error("invalid mutex configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("segment mapping failed: {0}")]
    Io(#[from] std::io::Error),
}

impl MutexError {
    /// True when the environment can no longer be used without recovery.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::RunRecovery)
    }

    /// True for the errors that indicate memory corruption or a logic bug.
    #[must_use]
    pub const fn is_consistency(&self) -> bool {
        matches!(
            self,
            Self::NotAllocated { .. } | Self::NotHeld { .. } | Self::InvalidHandle { .. }
        )
    }

    /// Errno-style code for callers that speak the engine's integer protocol.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::OutOfMutexes { .. } | Self::RegistryFull { .. } => errno::ENOMEM,
            Self::InitFailed { errno } | Self::DestroyFailed { errno } => *errno,
            Self::RunRecovery => errno::DB_RUNRECOVERY,
            Self::NotHeld { .. } => errno::EPERM,
            Self::NotAllocated { .. }
            | Self::InvalidHandle { .. }
            | Self::InvalidFlags { .. }
            | Self::LayoutMismatch { .. }
            | Self::FailchkUnsupported
            | Self::InvalidConfig(_) => errno::EINVAL,
            Self::Io(e) => e.raw_os_error().unwrap_or(errno::EIO),
        }
    }
}
