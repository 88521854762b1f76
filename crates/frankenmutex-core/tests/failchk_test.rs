use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use frankenmutex_core::log::{LogEmitter, SharedBuffer};
use frankenmutex_core::{
    ConsistencyMode, EnvConfig, FailchkParticipant, Finding, LivenessProbe, MutexEnv, MutexError,
    MutexFlags, MutexTag, ThreadIdentity, ThreadState,
};

fn workspace_root() -> PathBuf {
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest.parent().unwrap().parent().unwrap().to_path_buf()
}

/// Simulated process table: the environment sees whatever identity is
/// current, and the probe reports the listed pids dead.
#[derive(Clone)]
struct World {
    current: Arc<Mutex<ThreadIdentity>>,
    dead: Arc<Mutex<HashSet<u32>>>,
}

impl World {
    fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(ThreadIdentity::new(1, 1))),
            dead: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn become_(&self, pid: u32, tid: u64) {
        *self.current.lock() = ThreadIdentity::new(pid, tid);
    }

    fn kill(&self, pid: u32) {
        self.dead.lock().insert(pid);
    }

    fn revive(&self, pid: u32) {
        self.dead.lock().remove(&pid);
    }
}

impl LivenessProbe for World {
    fn is_alive(&self, id: ThreadIdentity) -> bool {
        !self.dead.lock().contains(&id.pid)
    }
}

fn open(world: &World, threads: u32, buffer: &SharedBuffer) -> MutexEnv {
    let current = world.current.clone();
    MutexEnv::open_private(
        EnvConfig::new()
            .with_mutex_init(8)
            .with_tas_spins(8)
            .with_thread_count(threads)
            .with_thread_id(move || *current.lock())
            .with_is_alive(world.clone())
            .with_consistency(ConsistencyMode::Strict)
            .with_log(LogEmitter::to_buffer(buffer, "failchk")),
    )
    .unwrap()
}

struct Recorder {
    name: &'static str,
    calls: Arc<AtomicUsize>,
    order: Arc<Mutex<Vec<&'static str>>>,
    findings: Vec<Finding>,
}

impl FailchkParticipant for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn failchk(&self, _probe: &dyn LivenessProbe) -> Result<Vec<Finding>, MutexError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        self.order.lock().push(self.name);
        Ok(self.findings.clone())
    }
}

fn recorder(
    name: &'static str,
    order: &Arc<Mutex<Vec<&'static str>>>,
    findings: Vec<Finding>,
) -> (Arc<Recorder>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let participant = Arc::new(Recorder {
        name,
        calls: calls.clone(),
        order: order.clone(),
        findings,
    });
    (participant, calls)
}

#[test]
fn thread_dead_in_api_is_fatal_and_skips_participants() {
    let root = workspace_root();
    let out_dir = root.join("target/conformance");
    fs::create_dir_all(&out_dir).expect("create target/conformance");
    let report_path = out_dir.join("mutex_failchk_died_in_api.report.json");

    let world = World::new();
    let buffer = SharedBuffer::new();
    let env = open(&world, 8, &buffer);
    let order = Arc::new(Mutex::new(Vec::new()));
    let (lock_mgr, lock_calls) = recorder("lock", &order, Vec::new());
    env.register_participant(lock_mgr);

    world.become_(100, 7);
    env.enter_tracked_section().unwrap();
    world.become_(1, 1);
    world.kill(100);

    let victim = ThreadIdentity::new(100, 7);
    let report = env.run_failure_check(&world).unwrap();
    assert!(report.must_recover);
    assert_eq!(
        report.fatal().cloned().collect::<Vec<_>>(),
        vec![Finding::DiedInApi { identity: victim }]
    );
    assert!(report.participants_run.is_empty());
    assert_eq!(lock_calls.load(Ordering::Acquire), 0);
    assert!(env.is_panicked());
    // Reported, never silently reclaimed.
    assert_eq!(env.thread_state(victim).unwrap(), Some(ThreadState::InApi));

    assert!(matches!(
        env.run_failure_check(&world),
        Err(MutexError::RunRecovery)
    ));

    let entries = buffer.entries();
    let died = entries
        .iter()
        .find(|e| e.event == "failchk_died_in_api")
        .expect("died-in-api finding logged");
    assert_eq!((died.pid, died.tid), (Some(100), Some(7)));
    assert!(entries.iter().any(|e| e.event == "env_panic"));

    fs::write(&report_path, serde_json::to_string_pretty(&report).unwrap())
        .expect("write report json");
}

#[test]
fn dead_blocked_and_out_entries_are_neutralized_when_pool_is_full() {
    let world = World::new();
    let buffer = SharedBuffer::new();
    let env = open(&world, 2, &buffer);

    world.become_(200, 1);
    env.enter_tracked_section().unwrap();
    env.leave_tracked_section().unwrap();
    world.become_(201, 1);
    env.enter_blocking_section().unwrap();
    world.become_(1, 1);
    world.kill(200);
    world.kill(201);

    let order = Arc::new(Mutex::new(Vec::new()));
    let (lock_mgr, lock_calls) = recorder("lock", &order, Vec::new());
    env.register_participant(lock_mgr);

    let report = env.run_failure_check(&world).unwrap();
    assert!(!report.must_recover);
    assert!(report.findings.contains(&Finding::EntryReclaimed {
        identity: ThreadIdentity::new(200, 1)
    }));
    assert!(report.findings.contains(&Finding::DiedBlocked {
        identity: ThreadIdentity::new(201, 1)
    }));
    assert_eq!(report.participants_run, vec!["lock".to_string()]);
    assert_eq!(lock_calls.load(Ordering::Acquire), 1);
    assert!(!env.is_panicked());

    assert_eq!(
        env.thread_state(ThreadIdentity::new(200, 1)).unwrap(),
        Some(ThreadState::NotInUse)
    );
    assert_eq!(
        env.thread_state(ThreadIdentity::new(201, 1)).unwrap(),
        Some(ThreadState::BlockedDead)
    );

    // A second pass finds nothing new.
    let again = env.run_failure_check(&world).unwrap();
    assert!(again.is_clean());
}

#[test]
fn out_entries_are_left_alone_while_pool_has_room() {
    let world = World::new();
    let buffer = SharedBuffer::new();
    let env = open(&world, 4, &buffer);

    world.become_(300, 1);
    {
        let _section = env.track().unwrap();
        assert_eq!(
            env.thread_state(ThreadIdentity::new(300, 1)).unwrap(),
            Some(ThreadState::InApi)
        );
    }
    assert_eq!(
        env.thread_state(ThreadIdentity::new(300, 1)).unwrap(),
        Some(ThreadState::Out)
    );
    world.kill(300);

    let report = env.run_failure_check(&world).unwrap();
    assert!(report.is_clean());
    assert_eq!(
        env.thread_state(ThreadIdentity::new(300, 1)).unwrap(),
        Some(ThreadState::Out)
    );
}

#[test]
fn full_registry_reuses_only_dead_out_entries() {
    let world = World::new();
    let buffer = SharedBuffer::new();
    let env = open(&world, 2, &buffer);

    world.become_(400, 1);
    env.enter_tracked_section().unwrap();
    env.leave_tracked_section().unwrap();
    world.become_(401, 1);
    env.enter_tracked_section().unwrap();

    world.become_(402, 1);
    assert!(matches!(
        env.enter_tracked_section(),
        Err(MutexError::RegistryFull { max: 2 })
    ));
    assert!(!env.is_panicked());
    assert!(buffer.entries().iter().any(|e| e.event == "registry_full"));

    // 401 is dead but still inside the engine: its entry is never taken.
    world.kill(401);
    assert!(matches!(
        env.enter_tracked_section(),
        Err(MutexError::RegistryFull { max: 2 })
    ));

    world.revive(401);
    world.kill(400);
    env.enter_tracked_section().unwrap();
    assert_eq!(
        env.thread_state(ThreadIdentity::new(402, 1)).unwrap(),
        Some(ThreadState::InApi)
    );
    assert_eq!(env.thread_state(ThreadIdentity::new(400, 1)).unwrap(), None);
    assert_eq!(env.stats().unwrap().thread_count, 2);
}

#[test]
fn thread_private_mutexes_of_dead_processes_are_freed() {
    let world = World::new();
    let buffer = SharedBuffer::new();
    let env = open(&world, 4, &buffer);

    world.become_(500, 1);
    let private = env
        .alloc(MutexTag::MpoolBufferHeader, MutexFlags::THREAD_PRIVATE)
        .unwrap();
    let shared = env.alloc(MutexTag::MpoolRegion, MutexFlags::NONE).unwrap();
    world.become_(1, 1);
    let survivor = env
        .alloc(MutexTag::MpoolBufferHeader, MutexFlags::THREAD_PRIVATE)
        .unwrap();
    world.kill(500);

    let report = env.run_failure_check(&world).unwrap();
    assert_eq!(
        report.findings,
        vec![Finding::MutexReclaimed {
            id: private,
            tag: Some(MutexTag::MpoolBufferHeader),
            alloc_pid: 500,
        }]
    );
    let allocated = env.allocated().unwrap();
    assert!(!allocated.contains(&private));
    assert!(allocated.contains(&shared));
    assert!(allocated.contains(&survivor));
    assert_eq!(env.free_list().unwrap().first(), Some(&private));
}

#[test]
fn participants_run_in_order_and_a_fatal_finding_stops_the_rest() {
    let world = World::new();
    let buffer = SharedBuffer::new();
    let env = open(&world, 4, &buffer);
    let order = Arc::new(Mutex::new(Vec::new()));

    let note = Finding::Participant {
        source: "lock".into(),
        identity: Some(ThreadIdentity::new(600, 2)),
        detail: "released 3 locks".into(),
        fatal: false,
    };
    let fatal = Finding::Participant {
        source: "txn".into(),
        identity: Some(ThreadIdentity::new(600, 2)),
        detail: "active transaction cannot be aborted".into(),
        fatal: true,
    };
    let (lock_mgr, _) = recorder("lock", &order, vec![note.clone()]);
    let (txn_mgr, _) = recorder("txn", &order, vec![fatal.clone()]);
    let (rep_mgr, rep_calls) = recorder("rep", &order, Vec::new());
    env.register_participant(lock_mgr);
    env.register_participant(txn_mgr);
    env.register_participant(rep_mgr);

    let report = env.run_failure_check(&world).unwrap();
    assert_eq!(*order.lock(), vec!["lock", "txn"]);
    assert_eq!(report.participants_run, vec!["lock", "txn"]);
    assert_eq!(report.findings, vec![note, fatal]);
    assert!(report.must_recover);
    assert_eq!(rep_calls.load(Ordering::Acquire), 0);
    assert!(env.is_panicked());
}
