//! Test-and-set spinlock backend.
//!
//! One `AtomicU32` per slot: 0 free, 1 held. Acquisition spins on relaxed
//! loads before issuing the compare-exchange, then falls back to sleeping on
//! the exponential [`Backoff`](super::Backoff). Works in any memory the
//! process can map, including segments shared across processes, and lets any
//! thread release the lock, so self-blocking slots need nothing extra.

use std::sync::atomic::{AtomicU32, Ordering};

use super::{BackendError, LockAcquired, LockBackend, WaitContext, spin_until_clear};
use crate::mutex::MutexFlags;
use crate::segment::ShmSafe;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

#[repr(C)]
pub struct TasState {
    word: AtomicU32,
}

// SAFETY: a single atomic, zero means unlocked.
#[allow(unsafe_code)]
unsafe impl ShmSafe for TasState {}

pub struct TasBackend;

impl TasState {
    #[inline]
    fn try_acquire(&self) -> bool {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl LockBackend for TasBackend {
    type State = TasState;

    const ID: u32 = 0x5441_5331; // "TAS1"
    const NAME: &'static str = "tas";

    fn init(state: &TasState, _flags: MutexFlags) -> Result<(), i32> {
        state.word.store(UNLOCKED, Ordering::Release);
        Ok(())
    }

    fn lock(state: &TasState, cx: &WaitContext<'_>) -> Result<LockAcquired, BackendError> {
        if state.try_acquire() {
            return Ok(LockAcquired { waited: false });
        }
        let mut backoff = cx.backoff();
        loop {
            if cx.panicked() {
                return Err(BackendError::Panicked);
            }
            if spin_until_clear(&state.word, cx.spins) && state.try_acquire() {
                return Ok(LockAcquired { waited: true });
            }
            backoff.snooze();
        }
    }

    fn try_lock(state: &TasState, _flags: MutexFlags) -> Result<bool, BackendError> {
        Ok(state.try_acquire())
    }

    fn unlock(state: &TasState, _flags: MutexFlags) -> Result<(), BackendError> {
        match state.word.swap(UNLOCKED, Ordering::Release) {
            UNLOCKED => Err(BackendError::NotHeld),
            _ => Ok(()),
        }
    }

    fn destroy(state: &TasState) -> Result<(), i32> {
        state.word.store(UNLOCKED, Ordering::Release);
        Ok(())
    }

    fn is_locked(state: &TasState) -> bool {
        state.word.load(Ordering::Acquire) != UNLOCKED
    }
}
