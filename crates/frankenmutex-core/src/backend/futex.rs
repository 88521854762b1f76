//! Linux futex backend.
//!
//! The lock word has three states: 0 free, 1 held with no waiters, 2 held and
//! possibly contended. Unlock only issues `FUTEX_WAKE` when it swaps out a 2,
//! so the uncontended path never enters the kernel. Waiters park with a
//! timeout equal to the current backoff step; a wake ends the wait early, the
//! timeout guarantees the environment panic word is re-read.
//!
//! Thread-private slots use `FUTEX_PRIVATE_FLAG`; every other slot uses the
//! shared futex namespace so waiters in other processes mapping the same
//! segment are woken.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::{BackendError, LockAcquired, LockBackend, WaitContext, spin_until_clear};
use crate::errno;
use crate::mutex::MutexFlags;
use crate::segment::ShmSafe;

const FREE: u32 = 0;
const HELD: u32 = 1;
const CONTENDED: u32 = 2;

static SPIN_BRANCHES: AtomicU64 = AtomicU64::new(0);
static WAIT_BRANCHES: AtomicU64 = AtomicU64::new(0);
static WAKE_BRANCHES: AtomicU64 = AtomicU64::new(0);

#[repr(C)]
pub struct FutexState {
    word: AtomicU32,
}

// SAFETY: a single atomic, zero means unlocked.
unsafe impl ShmSafe for FutexState {}

pub struct FutexBackend;

fn futex_op(flags: MutexFlags, op: i32) -> i32 {
    if flags.contains(MutexFlags::THREAD_PRIVATE) {
        op | libc::FUTEX_PRIVATE_FLAG
    } else {
        op
    }
}

fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration, flags: MutexFlags) -> i32 {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // SAFETY: futex syscall on a valid, aligned userspace word with a
    // relative timeout that outlives the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            futex_op(flags, libc::FUTEX_WAIT),
            expected,
            &ts as *const libc::timespec,
        )
    };
    if rc == 0 { 0 } else { errno::last_os_errno() }
}

fn futex_wake(word: &AtomicU32, count: i32, flags: MutexFlags) -> i32 {
    // SAFETY: futex syscall on a valid, aligned userspace word.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            futex_op(flags, libc::FUTEX_WAKE),
            count,
        )
    };
    if rc >= 0 { 0 } else { errno::last_os_errno() }
}

impl LockBackend for FutexBackend {
    type State = FutexState;

    const ID: u32 = 0x4655_5431; // "FUT1"
    const NAME: &'static str = "futex";

    fn init(state: &FutexState, _flags: MutexFlags) -> Result<(), i32> {
        state.word.store(FREE, Ordering::Release);
        Ok(())
    }

    fn lock(state: &FutexState, cx: &WaitContext<'_>) -> Result<LockAcquired, BackendError> {
        let word = &state.word;
        if word
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(LockAcquired { waited: false });
        }

        let mut backoff = cx.backoff();
        loop {
            if cx.panicked() {
                return Err(BackendError::Panicked);
            }

            SPIN_BRANCHES.fetch_add(1, Ordering::Relaxed);
            // Someone else may be parked, so take it as contended.
            if spin_until_clear(word, cx.spins)
                && word
                    .compare_exchange(FREE, CONTENDED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return Ok(LockAcquired { waited: true });
            }

            if word.swap(CONTENDED, Ordering::Acquire) == FREE {
                return Ok(LockAcquired { waited: true });
            }

            WAIT_BRANCHES.fetch_add(1, Ordering::Relaxed);
            match futex_wait(word, CONTENDED, backoff.next_sleep(), cx.flags) {
                0 | errno::EINTR | errno::EAGAIN | errno::ETIMEDOUT => continue,
                other => return Err(BackendError::Os(other)),
            }
        }
    }

    fn try_lock(state: &FutexState, _flags: MutexFlags) -> Result<bool, BackendError> {
        Ok(state
            .word
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok())
    }

    fn unlock(state: &FutexState, flags: MutexFlags) -> Result<(), BackendError> {
        match state.word.swap(FREE, Ordering::Release) {
            FREE => Err(BackendError::NotHeld),
            HELD => Ok(()),
            _ => {
                WAKE_BRANCHES.fetch_add(1, Ordering::Relaxed);
                match futex_wake(&state.word, 1, flags) {
                    0 => Ok(()),
                    other => Err(BackendError::Os(other)),
                }
            }
        }
    }

    fn destroy(state: &FutexState) -> Result<(), i32> {
        state.word.store(FREE, Ordering::Release);
        Ok(())
    }

    fn is_locked(state: &FutexState) -> bool {
        state.word.load(Ordering::Acquire) != FREE
    }
}

/// Snapshot of the (spin, wait, wake) branch counters since process start.
#[must_use]
pub fn branch_counters() -> (u64, u64, u64) {
    (
        SPIN_BRANCHES.load(Ordering::Relaxed),
        WAIT_BRANCHES.load(Ordering::Relaxed),
        WAKE_BRANCHES.load(Ordering::Relaxed),
    )
}
