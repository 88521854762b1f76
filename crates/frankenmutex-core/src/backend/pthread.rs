//! Kernel mutex + condition variable backend.
//!
//! Each slot embeds a `pthread_mutex_t`, a `pthread_cond_t` and a `locked`
//! word. The pthread mutex only guards `locked`; the logical lock is `locked`
//! itself, and waiters sleep on the condition variable until it clears. That
//! makes every slot self-blocking: the thread that releases need not be the
//! one that acquired. Slots not flagged thread-private are initialized
//! `PTHREAD_PROCESS_SHARED`.
//!
//! Waits are timed (the current backoff step) so the environment panic word
//! is re-read even if no release ever arrives.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::{BackendError, LockAcquired, LockBackend, WaitContext, spin_until_clear};
use crate::errno;
use crate::mutex::MutexFlags;
use crate::segment::ShmSafe;

#[repr(C)]
pub struct PthreadState {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
    locked: AtomicU32,
    initialized: AtomicU32,
}

// SAFETY: the pthread objects are only touched through the pthread API,
// which synchronizes internally; the words are atomics.
unsafe impl Sync for PthreadState {}
// SAFETY: zeroed pthread objects are never used before `init` sets
// `initialized`, and the struct holds no pointers.
unsafe impl ShmSafe for PthreadState {}

pub struct PthreadBackend;

struct Guard<'a>(&'a PthreadState);

impl<'a> Guard<'a> {
    fn acquire(state: &'a PthreadState) -> Result<Self, BackendError> {
        // SAFETY: mutex initialized by `init` (callers only reach here for
        // allocated slots).
        match unsafe { libc::pthread_mutex_lock(state.mutex.get()) } {
            0 => Ok(Self(state)),
            rc => Err(BackendError::Os(rc)),
        }
    }

    fn wait(&self, timeout: Duration) -> Result<(), BackendError> {
        let deadline = deadline_after(timeout);
        // SAFETY: we hold the mutex; both objects are initialized.
        match unsafe { libc::pthread_cond_timedwait(self.0.cond.get(), self.0.mutex.get(), &deadline) }
        {
            0 | libc::ETIMEDOUT | libc::EINTR => Ok(()),
            rc => Err(BackendError::Os(rc)),
        }
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard holds the mutex.
        let _ = unsafe { libc::pthread_mutex_unlock(self.0.mutex.get()) };
    }
}

fn deadline_after(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: valid out-pointer.
    let _ = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}

fn init_objects(state: &PthreadState, shared: bool) -> Result<(), i32> {
    let pshared = if shared {
        libc::PTHREAD_PROCESS_SHARED
    } else {
        libc::PTHREAD_PROCESS_PRIVATE
    };

    let mut mattr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
    // SAFETY: attribute object initialized before use and destroyed after.
    let rc = unsafe {
        let mut rc = libc::pthread_mutexattr_init(mattr.as_mut_ptr());
        if rc == 0 {
            rc = libc::pthread_mutexattr_setpshared(mattr.as_mut_ptr(), pshared);
            if rc == 0 {
                rc = libc::pthread_mutex_init(state.mutex.get(), mattr.as_ptr());
            }
            libc::pthread_mutexattr_destroy(mattr.as_mut_ptr());
        }
        rc
    };
    if rc != 0 {
        return Err(rc);
    }

    let mut cattr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
    // SAFETY: as above.
    let rc = unsafe {
        let mut rc = libc::pthread_condattr_init(cattr.as_mut_ptr());
        if rc == 0 {
            rc = libc::pthread_condattr_setpshared(cattr.as_mut_ptr(), pshared);
            if rc == 0 {
                rc = libc::pthread_cond_init(state.cond.get(), cattr.as_ptr());
            }
            libc::pthread_condattr_destroy(cattr.as_mut_ptr());
        }
        rc
    };
    if rc != 0 {
        // SAFETY: the mutex was initialized above and nobody else sees it yet.
        let _ = unsafe { libc::pthread_mutex_destroy(state.mutex.get()) };
        return Err(rc);
    }
    Ok(())
}

impl LockBackend for PthreadBackend {
    type State = PthreadState;

    const ID: u32 = 0x5054_4831; // "PTH1"
    const NAME: &'static str = "pthread";

    fn init(state: &PthreadState, flags: MutexFlags) -> Result<(), i32> {
        if state.initialized.load(Ordering::Acquire) != 0 {
            return Err(errno::EBUSY);
        }
        init_objects(state, !flags.contains(MutexFlags::THREAD_PRIVATE))?;
        state.locked.store(0, Ordering::Relaxed);
        state.initialized.store(1, Ordering::Release);
        Ok(())
    }

    fn lock(state: &PthreadState, cx: &WaitContext<'_>) -> Result<LockAcquired, BackendError> {
        spin_until_clear(&state.locked, cx.spins);
        let guard = Guard::acquire(state)?;
        let mut waited = false;
        let mut backoff = cx.backoff();
        while state.locked.load(Ordering::Relaxed) != 0 {
            if cx.panicked() {
                return Err(BackendError::Panicked);
            }
            waited = true;
            guard.wait(backoff.next_sleep())?;
        }
        state.locked.store(1, Ordering::Relaxed);
        drop(guard);
        Ok(LockAcquired { waited })
    }

    fn try_lock(state: &PthreadState, _flags: MutexFlags) -> Result<bool, BackendError> {
        let _guard = Guard::acquire(state)?;
        if state.locked.load(Ordering::Relaxed) != 0 {
            return Ok(false);
        }
        state.locked.store(1, Ordering::Relaxed);
        Ok(true)
    }

    fn unlock(state: &PthreadState, _flags: MutexFlags) -> Result<(), BackendError> {
        let _guard = Guard::acquire(state)?;
        if state.locked.load(Ordering::Relaxed) == 0 {
            return Err(BackendError::NotHeld);
        }
        state.locked.store(0, Ordering::Relaxed);
        // SAFETY: cond initialized; signalling under the mutex.
        match unsafe { libc::pthread_cond_signal(state.cond.get()) } {
            0 => Ok(()),
            rc => Err(BackendError::Os(rc)),
        }
    }

    fn destroy(state: &PthreadState) -> Result<(), i32> {
        if state.initialized.swap(0, Ordering::AcqRel) == 0 {
            return Ok(());
        }
        // SAFETY: both objects were initialized and the slot is being freed,
        // so no thread holds or waits on them.
        let (cond_rc, mutex_rc) = unsafe {
            (
                libc::pthread_cond_destroy(state.cond.get()),
                libc::pthread_mutex_destroy(state.mutex.get()),
            )
        };
        state.locked.store(0, Ordering::Relaxed);
        match (cond_rc, mutex_rc) {
            (0, 0) => Ok(()),
            (0, rc) | (rc, _) => Err(rc),
        }
    }

    fn is_locked(state: &PthreadState) -> bool {
        state.locked.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fresh() -> Box<PthreadState> {
        // SAFETY: PthreadState is zero-valid (ShmSafe contract).
        Box::new(unsafe { MaybeUninit::<PthreadState>::zeroed().assume_init() })
    }

    #[test]
    fn init_lock_unlock_destroy() {
        let s = fresh();
        let panic = AtomicU32::new(0);
        PthreadBackend::init(&s, MutexFlags::THREAD_PRIVATE).unwrap();
        let cx = WaitContext {
            flags: MutexFlags::THREAD_PRIVATE,
            spins: 1,
            panic: &panic,
        };
        assert!(!PthreadBackend::lock(&s, &cx).unwrap().waited);
        assert!(PthreadBackend::is_locked(&s));
        assert!(!PthreadBackend::try_lock(&s, MutexFlags::NONE).unwrap());
        PthreadBackend::unlock(&s, MutexFlags::NONE).unwrap();
        assert_eq!(
            PthreadBackend::unlock(&s, MutexFlags::NONE),
            Err(BackendError::NotHeld)
        );
        PthreadBackend::destroy(&s).unwrap();
        // Second destroy is a no-op.
        PthreadBackend::destroy(&s).unwrap();
    }

    #[test]
    fn another_thread_may_release() {
        let s: Arc<PthreadState> = Arc::from(fresh());
        PthreadBackend::init(&s, MutexFlags::SELF_BLOCK).unwrap();
        assert!(PthreadBackend::try_lock(&s, MutexFlags::SELF_BLOCK).unwrap());

        let releaser = {
            let s = Arc::clone(&s);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                PthreadBackend::unlock(&s, MutexFlags::SELF_BLOCK).unwrap();
            })
        };
        let panic = AtomicU32::new(0);
        let cx = WaitContext {
            flags: MutexFlags::SELF_BLOCK,
            spins: 1,
            panic: &panic,
        };
        assert!(PthreadBackend::lock(&s, &cx).unwrap().waited);
        releaser.join().unwrap();
        PthreadBackend::unlock(&s, MutexFlags::SELF_BLOCK).unwrap();
        PthreadBackend::destroy(&s).unwrap();
    }
}
