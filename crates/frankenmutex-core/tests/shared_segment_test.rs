#![cfg(unix)]

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use frankenmutex_core::{
    ConsistencyMode, EnvConfig, MutexEnv, MutexError, MutexFlags, MutexTag, ThreadIdentity,
};

fn region_path(name: &str) -> PathBuf {
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let dir = manifest
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("target/conformance/regions");
    fs::create_dir_all(&dir).expect("create region dir");
    let path = dir.join(format!("{name}-{}.region", std::process::id()));
    let _ = fs::remove_file(&path);
    path
}

fn config() -> EnvConfig {
    EnvConfig::new()
        .with_mutex_init(8)
        .with_mutex_max(32)
        .with_tas_spins(16)
        .with_consistency(ConsistencyMode::Strict)
}

#[test]
fn second_mapping_joins_and_observes_the_same_locks() {
    let path = region_path("join");
    let first: MutexEnv = MutexEnv::open_file(config(), &path).unwrap();
    let second: MutexEnv = MutexEnv::open_file(config(), &path).unwrap();
    assert!(first.created());
    assert!(!second.created());
    assert_ne!(first.segment().base_addr(), second.segment().base_addr());

    let id = first.alloc(MutexTag::LockRegion, MutexFlags::NONE).unwrap();
    assert_eq!(second.allocated().unwrap(), vec![id]);

    first.lock(id).unwrap();
    assert!(!second.try_lock(id).unwrap());
    assert_eq!(second.holder(id).unwrap(), Some(ThreadIdentity::current()));
    first.unlock(id).unwrap();
    assert!(second.try_lock(id).unwrap());
    second.unlock(id).unwrap();

    // Slots allocated through either mapping come from one free list.
    let other = second.alloc(MutexTag::LogRegion, MutexFlags::NONE).unwrap();
    assert_ne!(other, id);
    assert_eq!(first.stats().unwrap().mutex_inuse, 2);

    drop(second);
    first.remove().unwrap();
    let _ = fs::remove_file(&path);
}

#[test]
fn joiner_maps_the_recorded_layout_whatever_its_own_settings() {
    let path = region_path("foreign-settings");
    let creator: MutexEnv =
        MutexEnv::open_file(config().with_mutex_max(64).with_thread_count(8), &path).unwrap();
    // Past the creator's initial count, so the region has grown.
    let held: Vec<_> = (0..20)
        .map(|_| creator.alloc(MutexTag::Application, MutexFlags::NONE).unwrap())
        .collect();

    // Smaller capacity and no thread registry of its own.
    let joiner: MutexEnv = MutexEnv::open_file(
        EnvConfig::new()
            .with_mutex_init(2)
            .with_consistency(ConsistencyMode::Strict),
        &path,
    )
    .unwrap();
    assert!(!joiner.created());
    assert_eq!(joiner.segment().len(), creator.segment().len());

    let stats = joiner.stats().unwrap();
    assert_eq!(stats.mutex_max, 64);
    assert_eq!(stats.mutex_count, creator.stats().unwrap().mutex_count);
    assert_eq!(stats.thread_max, 8);
    assert_eq!(joiner.allocated().unwrap(), held);

    let last = *held.last().unwrap();
    joiner.lock(last).unwrap();
    assert!(!creator.try_lock(last).unwrap());
    joiner.unlock(last).unwrap();

    // The creator's registry is used even though the joiner configured none.
    joiner.enter_tracked_section().unwrap();
    assert_eq!(
        creator.thread_state(ThreadIdentity::current()).unwrap(),
        Some(frankenmutex_core::ThreadState::InApi)
    );
    joiner.leave_tracked_section().unwrap();

    drop(joiner);
    creator.remove().unwrap();
    let _ = fs::remove_file(&path);
}

#[test]
fn waiter_on_one_mapping_is_woken_through_the_other() {
    let path = region_path("wake");
    let first: MutexEnv = MutexEnv::open_file(config(), &path).unwrap();
    let second: MutexEnv = MutexEnv::open_file(config(), &path).unwrap();
    let id = first.alloc(MutexTag::MutexTest, MutexFlags::NONE).unwrap();
    let acquired = AtomicBool::new(false);

    first.lock(id).unwrap();
    thread::scope(|s| {
        s.spawn(|| {
            second.lock(id).unwrap();
            acquired.store(true, Ordering::Release);
            second.unlock(id).unwrap();
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::Acquire));
        first.unlock(id).unwrap();
    });
    assert!(acquired.load(Ordering::Acquire));

    let _ = fs::remove_file(&path);
}

#[test]
fn panic_set_through_one_mapping_fails_the_other_fast() {
    let path = region_path("panic");
    let first: MutexEnv = MutexEnv::open_file(config(), &path).unwrap();
    let second: MutexEnv = MutexEnv::open_file(config(), &path).unwrap();
    let id = first.alloc(MutexTag::Application, MutexFlags::NONE).unwrap();

    first.panic_env("corrupted lock table");
    assert!(second.is_panicked());
    assert!(matches!(second.lock(id), Err(MutexError::RunRecovery)));
    assert!(matches!(
        second.alloc(MutexTag::Application, MutexFlags::NONE),
        Err(MutexError::RunRecovery)
    ));

    let _ = fs::remove_file(&path);
}

#[test]
fn joins_reject_early_requests_and_foreign_layouts() {
    let path = region_path("reject");
    let _first: MutexEnv = MutexEnv::open_file(config(), &path).unwrap();

    let mut queued = config();
    queued
        .alloc_early(MutexTag::EnvRegion, MutexFlags::NONE)
        .unwrap();
    assert!(matches!(
        MutexEnv::<frankenmutex_core::SelectedBackend>::open_file(queued, &path),
        Err(MutexError::InvalidConfig(_))
    ));

    // A different slot alignment changes the stride every process computes.
    let misaligned = config().with_align(256);
    assert!(matches!(
        MutexEnv::<frankenmutex_core::SelectedBackend>::open_file(misaligned, &path),
        Err(MutexError::LayoutMismatch { field: "slot size" })
    ));

    let _ = fs::remove_file(&path);
}

#[test]
fn removed_region_can_be_recreated() {
    let path = region_path("recreate");
    let first: MutexEnv = MutexEnv::open_file(config(), &path).unwrap();
    first.alloc(MutexTag::Application, MutexFlags::NONE).unwrap();
    first.remove().unwrap();

    let again: MutexEnv = MutexEnv::open_file(config(), &path).unwrap();
    assert!(again.created());
    assert!(again.allocated().unwrap().is_empty());

    let _ = fs::remove_file(&path);
}
