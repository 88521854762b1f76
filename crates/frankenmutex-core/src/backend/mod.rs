//! Lock primitive backends.
//!
//! A backend supplies the blocking lock that lives inside each mutex slot.
//! Exactly one is selected at compile time as [`SelectedBackend`]:
//!
//! | feature            | target        | backend            |
//! |--------------------|---------------|--------------------|
//! | `pthread-backend`  | unix          | [`pthread::PthreadBackend`] |
//! | `tas-backend`      | any           | [`tas::TasBackend`] |
//! | (none)             | Linux         | [`futex::FutexBackend`] |
//! | (none)             | other         | [`tas::TasBackend`] |
//!
//! The region is generic over the backend, so the hot path is statically
//! dispatched. All backends share the same waiting discipline: spin a bounded
//! number of relaxed loads, then sleep (or park with a timeout) on an
//! exponential [`Backoff`], re-checking the environment panic word on every
//! retry.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::mutex::MutexFlags;
use crate::segment::ShmSafe;

#[cfg(target_os = "linux")]
pub mod futex;
#[cfg(unix)]
#[allow(unsafe_code)]
pub mod pthread;
pub mod tas;

#[cfg(feature = "pthread-backend")]
pub type SelectedBackend = pthread::PthreadBackend;

#[cfg(all(
    not(feature = "pthread-backend"),
    any(feature = "tas-backend", not(target_os = "linux"))
))]
pub type SelectedBackend = tas::TasBackend;

#[cfg(all(
    not(feature = "pthread-backend"),
    not(feature = "tas-backend"),
    target_os = "linux"
))]
pub type SelectedBackend = futex::FutexBackend;

/// First backoff sleep.
pub const BACKOFF_START: Duration = Duration::from_millis(1);
/// Backoff ceiling for slots backing record-level logical locks.
pub const BACKOFF_CAP_LOGICAL: Duration = Duration::from_millis(10);
/// Backoff ceiling for every other slot.
pub const BACKOFF_CAP: Duration = Duration::from_millis(25);

/// Spin iterations per processor when no override is configured.
pub const SPINS_PER_PROCESSOR: u32 = 50;

/// Failure reported by a backend operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    /// Unlock of a lock that was not held.
    NotHeld,
    /// The environment panic word was set while waiting.
    Panicked,
    /// The OS primitive failed with this errno.
    Os(i32),
}

/// Result of a successful blocking acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockAcquired {
    /// False when the first attempt succeeded.
    pub waited: bool,
}

/// Everything a blocking `lock` needs besides the slot state.
pub struct WaitContext<'a> {
    pub flags: MutexFlags,
    pub spins: u32,
    pub panic: &'a AtomicU32,
}

impl WaitContext<'_> {
    #[inline]
    #[must_use]
    pub fn panicked(&self) -> bool {
        self.panic.load(Ordering::Acquire) != 0
    }

    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::for_flags(self.flags)
    }
}

/// Exponential sleep schedule between lock retries.
///
/// Starts at [`BACKOFF_START`] and doubles up to a per-category cap. It bounds
/// CPU burn while a lock is contended; it does not bound how long a waiter
/// waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
}

impl Backoff {
    #[must_use]
    pub const fn new(cap: Duration) -> Self {
        Self {
            next: BACKOFF_START,
            cap,
        }
    }

    #[must_use]
    pub const fn for_flags(flags: MutexFlags) -> Self {
        if flags.contains(MutexFlags::LOGICAL_LOCK) {
            Self::new(BACKOFF_CAP_LOGICAL)
        } else {
            Self::new(BACKOFF_CAP)
        }
    }

    /// Returns the current step and advances the schedule.
    pub fn next_sleep(&mut self) -> Duration {
        let current = self.next;
        self.next = (self.next * 2).min(self.cap);
        current
    }

    pub fn snooze(&mut self) {
        std::thread::sleep(self.next_sleep());
    }
}

/// Spins up to `spins` relaxed loads waiting for `word` to read zero.
///
/// Returns true once a zero is observed, so the caller can attempt its
/// (more expensive) atomic exchange.
#[inline]
pub fn spin_until_clear(word: &AtomicU32, spins: u32) -> bool {
    for _ in 0..spins {
        if word.load(Ordering::Relaxed) == 0 {
            return true;
        }
        std::hint::spin_loop();
    }
    word.load(Ordering::Relaxed) == 0
}

/// Default spin count: [`SPINS_PER_PROCESSOR`] per CPU, or 1 on a uniprocessor
/// where spinning can never observe a release.
#[must_use]
pub fn default_spins() -> u32 {
    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    if cpus <= 1 {
        1
    } else {
        SPINS_PER_PROCESSOR.saturating_mul(u32::try_from(cpus).unwrap_or(u32::MAX))
    }
}

/// Primitive lock stored inside a mutex slot.
///
/// `State` lives in shared memory, so it is zero-valid and manipulated only
/// through `&Self::State`. `init` and `destroy` may make system calls and are
/// never invoked with the region lock held.
pub trait LockBackend: Send + Sync + 'static {
    type State: ShmSafe;

    /// Stable identifier written into the region header; a join by a process
    /// compiled with a different backend is rejected.
    const ID: u32;
    const NAME: &'static str;

    /// Prepares the state in place. On failure the state is left inert.
    fn init(state: &Self::State, flags: MutexFlags) -> Result<(), i32>;

    /// Blocks until the caller exclusively owns the lock.
    fn lock(state: &Self::State, cx: &WaitContext<'_>) -> Result<LockAcquired, BackendError>;

    /// Acquires the lock only if it is free.
    fn try_lock(state: &Self::State, flags: MutexFlags) -> Result<bool, BackendError>;

    /// Releases the lock, waking one waiter.
    fn unlock(state: &Self::State, flags: MutexFlags) -> Result<(), BackendError>;

    /// Releases OS resources. Safe after a failed or partial `init`.
    fn destroy(state: &Self::State) -> Result<(), i32>;

    fn is_locked(state: &Self::State) -> bool;
}
