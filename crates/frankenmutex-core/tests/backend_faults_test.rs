//! Error paths that only a failing OS primitive can reach, driven through a
//! backend whose init, destroy and lock can be told to fail.

use std::cell::Cell;
use std::collections::BTreeSet;

use frankenmutex_core::backend::tas::{TasBackend, TasState};
use frankenmutex_core::backend::{BackendError, LockAcquired, LockBackend, WaitContext};
use frankenmutex_core::errno;
use frankenmutex_core::log::{LogEmitter, LogEntry, SharedBuffer};
use frankenmutex_core::{
    ConsistencyMode, EnvConfig, MutexEnv, MutexError, MutexFlags, MutexId, MutexTag,
};

// Per test thread, so tests running in parallel do not see each other's
// faults.
thread_local! {
    static FAIL_INIT: Cell<Option<i32>> = const { Cell::new(None) };
    static FAIL_DESTROY: Cell<Option<i32>> = const { Cell::new(None) };
    static FAIL_LOCK: Cell<Option<i32>> = const { Cell::new(None) };
}

struct FaultyBackend;

impl LockBackend for FaultyBackend {
    type State = TasState;

    const ID: u32 = 0x4641_4C54; // "FALT"
    const NAME: &'static str = "faulty";

    fn init(state: &TasState, flags: MutexFlags) -> Result<(), i32> {
        match FAIL_INIT.get() {
            Some(errno) => Err(errno),
            None => TasBackend::init(state, flags),
        }
    }

    fn lock(state: &TasState, cx: &WaitContext<'_>) -> Result<LockAcquired, BackendError> {
        match FAIL_LOCK.get() {
            Some(errno) => Err(BackendError::Os(errno)),
            None => TasBackend::lock(state, cx),
        }
    }

    fn try_lock(state: &TasState, flags: MutexFlags) -> Result<bool, BackendError> {
        TasBackend::try_lock(state, flags)
    }

    fn unlock(state: &TasState, flags: MutexFlags) -> Result<(), BackendError> {
        TasBackend::unlock(state, flags)
    }

    fn destroy(state: &TasState) -> Result<(), i32> {
        let destroyed = TasBackend::destroy(state);
        match FAIL_DESTROY.get() {
            Some(errno) => Err(errno),
            None => destroyed,
        }
    }

    fn is_locked(state: &TasState) -> bool {
        TasBackend::is_locked(state)
    }
}

fn open(buffer: &SharedBuffer, mode: ConsistencyMode) -> MutexEnv<FaultyBackend> {
    MutexEnv::open_private(
        EnvConfig::new()
            .with_mutex_init(4)
            .with_tas_spins(8)
            .with_consistency(mode)
            .with_log(LogEmitter::to_buffer(buffer, "faults")),
    )
    .unwrap()
}

fn ids(raw: &[u32]) -> Vec<MutexId> {
    raw.iter().copied().map(MutexId::from_raw).collect()
}

fn find<'a>(entries: &'a [LogEntry], event: &str) -> &'a LogEntry {
    entries
        .iter()
        .find(|e| e.event == event)
        .unwrap_or_else(|| panic!("no {event} entry in {entries:?}"))
}

#[test]
fn failed_init_puts_the_slot_back_at_the_head() {
    let buffer = SharedBuffer::new();
    let env = open(&buffer, ConsistencyMode::Strict);

    FAIL_INIT.set(Some(errno::EAGAIN));
    assert!(matches!(
        env.alloc(MutexTag::Application, MutexFlags::NONE),
        Err(MutexError::InitFailed { errno: errno::EAGAIN })
    ));
    FAIL_INIT.set(None);

    assert_eq!(env.free_list().unwrap(), ids(&[1, 2, 3, 4]));
    assert!(env.allocated().unwrap().is_empty());
    assert_eq!(env.stats().unwrap().mutex_inuse, 0);
    assert!(!env.is_panicked());

    let entries = buffer.entries();
    let failed = find(&entries, "init_failed");
    assert_eq!(failed.mutex_id, Some(1));
    assert_eq!(failed.errno, Some(errno::EAGAIN));
    assert_eq!(failed.tag.as_deref(), Some(MutexTag::Application.name()));

    // The same slot is handed out once init works again.
    assert_eq!(
        env.alloc(MutexTag::Application, MutexFlags::NONE).unwrap(),
        MutexId::from_raw(1)
    );
}

#[test]
fn failed_destroy_still_reclaims_the_slot() {
    let buffer = SharedBuffer::new();
    let env = open(&buffer, ConsistencyMode::Strict);
    let a = env.alloc(MutexTag::LockRegion, MutexFlags::NONE).unwrap();
    let b = env.alloc(MutexTag::LockRegion, MutexFlags::NONE).unwrap();

    FAIL_DESTROY.set(Some(errno::EBUSY));
    assert!(matches!(
        env.free(a),
        Err(MutexError::DestroyFailed { errno: errno::EBUSY })
    ));
    FAIL_DESTROY.set(None);

    assert_eq!(env.allocated().unwrap(), vec![b]);
    assert_eq!(env.free_list().unwrap(), ids(&[1, 3, 4]));
    assert!(!env.is_panicked());

    let entries = buffer.entries();
    let failed = find(&entries, "destroy_failed");
    assert_eq!(failed.mutex_id, Some(a.raw()));
    assert_eq!(failed.errno, Some(errno::EBUSY));
    assert_eq!(failed.tag.as_deref(), Some(MutexTag::LockRegion.name()));
    assert!(entries.iter().all(|e| e.event != "env_panic"));

    // Reclaimed means a second free is a double free.
    assert!(matches!(env.free(a), Err(MutexError::NotAllocated { .. })));
}

#[test]
fn os_error_from_lock_panics_the_environment() {
    let buffer = SharedBuffer::new();
    let env = open(&buffer, ConsistencyMode::Relaxed);
    let id = env.alloc(MutexTag::MutexTest, MutexFlags::NONE).unwrap();

    FAIL_LOCK.set(Some(errno::EINVAL));
    assert!(matches!(env.lock(id), Err(MutexError::RunRecovery)));
    FAIL_LOCK.set(None);

    assert!(env.is_panicked());
    assert!(matches!(env.lock(id), Err(MutexError::RunRecovery)));
    assert!(matches!(
        env.alloc(MutexTag::MutexTest, MutexFlags::NONE),
        Err(MutexError::RunRecovery)
    ));

    let entries = buffer.entries();
    let failure = find(&entries, "backend_error");
    assert_eq!(failure.mutex_id, Some(id.raw()));
    assert_eq!(failure.errno, Some(errno::EINVAL));
    find(&entries, "env_panic");
}

#[test]
fn free_that_cannot_relink_leaves_the_slot_allocated() {
    let buffer = SharedBuffer::new();
    let env = open(&buffer, ConsistencyMode::Relaxed);
    let id = env.alloc(MutexTag::Application, MutexFlags::NONE).unwrap();

    // Fails the region lock taken for the relink.
    FAIL_LOCK.set(Some(errno::EIO));
    assert!(matches!(env.free(id), Err(MutexError::RunRecovery)));
    FAIL_LOCK.set(None);
    assert!(env.is_panicked());

    let allocated: BTreeSet<_> = env.allocated().unwrap().into_iter().collect();
    let free: BTreeSet<_> = env.free_list().unwrap().into_iter().collect();
    assert!(allocated.contains(&id));
    assert!(!free.contains(&id));
    let all: BTreeSet<_> = allocated.union(&free).copied().collect();
    assert_eq!(all, ids(&[1, 2, 3, 4]).into_iter().collect());

    // Removal destroys it a second time without complaint.
    env.remove().unwrap();
}
