//! Failure checker: finds threads and mutexes abandoned by dead processes.
//!
//! `MutexEnv::run_failure_check` drives the sequence:
//!
//! 1. [`scan_threads`] walks the registry under the region lock. A dead
//!    thread found `InApi` is fatal: it may hold internal locks in an
//!    unknown state, so running any further recovery could hang on them.
//!    The environment is panicked and the remaining steps are skipped.
//! 2. Registered [`FailchkParticipant`]s (lock and transaction managers) run
//!    in registration order.
//! 3. Thread-private mutexes whose allocating process is dead are freed.
//!
//! Findings are reported, never thrown.

use serde::Serialize;

use crate::backend::LockBackend;
use crate::error::MutexError;
use crate::mutex::{MutexId, MutexTag};
use crate::region::RegionLocked;
use crate::thread_registry::{Registry, ThreadIdentity, ThreadState};

/// Host-supplied liveness test.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, id: ThreadIdentity) -> bool;

    /// Whether the process `pid` is alive at all.
    fn is_process_alive(&self, pid: u32) -> bool {
        self.is_alive(ThreadIdentity::new(pid, 0))
    }
}

impl<F> LivenessProbe for F
where
    F: Fn(ThreadIdentity) -> bool + Send + Sync,
{
    fn is_alive(&self, id: ThreadIdentity) -> bool {
        self(id)
    }
}

/// Probe backed by the operating system.
///
/// A process is alive unless `kill(pid, 0)` fails with `ESRCH`. On Linux a
/// thread is additionally checked through `/proc/<pid>/task/<tid>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLiveness;

impl LivenessProbe for OsLiveness {
    fn is_alive(&self, id: ThreadIdentity) -> bool {
        if !process_alive(id.pid) {
            return false;
        }
        #[cfg(target_os = "linux")]
        if id.tid != 0 {
            return std::path::Path::new(&format!("/proc/{}/task/{}", id.pid, id.tid)).exists();
        }
        true
    }

    fn is_process_alive(&self, pid: u32) -> bool {
        process_alive(pid)
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence check only.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    crate::errno::last_os_errno() != crate::errno::ESRCH
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// External subsystem with its own abandoned-state cleanup.
pub trait FailchkParticipant: Send + Sync {
    fn name(&self) -> &str;

    /// Releases state held by threads `probe` reports dead.
    fn failchk(&self, probe: &dyn LivenessProbe) -> Result<Vec<Finding>, MutexError>;
}

/// One failure-check result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    /// A dead thread was inside the engine. Fatal.
    DiedInApi { identity: ThreadIdentity },
    /// A dead thread was parked in a blocking call; its entry is now `BlockedDead`.
    DiedBlocked { identity: ThreadIdentity },
    /// A dead `Out` entry was returned to the pool.
    EntryReclaimed { identity: ThreadIdentity },
    /// A thread-private mutex of a dead process was freed.
    MutexReclaimed {
        id: MutexId,
        tag: Option<MutexTag>,
        alloc_pid: u32,
    },
    /// Reported by a participant.
    Participant {
        source: String,
        identity: Option<ThreadIdentity>,
        detail: String,
        fatal: bool,
    },
}

impl Finding {
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::DiedInApi { .. } => true,
            Self::Participant { fatal, .. } => *fatal,
            _ => false,
        }
    }

    /// Log event name.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            Self::DiedInApi { .. } => "failchk_died_in_api",
            Self::DiedBlocked { .. } => "failchk_died_blocked",
            Self::EntryReclaimed { .. } => "failchk_entry_reclaimed",
            Self::MutexReclaimed { .. } => "failchk_mutex_reclaimed",
            Self::Participant { .. } => "failchk_participant",
        }
    }

    #[must_use]
    pub fn identity(&self) -> Option<ThreadIdentity> {
        match self {
            Self::DiedInApi { identity }
            | Self::DiedBlocked { identity }
            | Self::EntryReclaimed { identity } => Some(*identity),
            Self::Participant { identity, .. } => *identity,
            Self::MutexReclaimed { .. } => None,
        }
    }
}

/// Outcome of `MutexEnv::run_failure_check`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailchkReport {
    pub findings: Vec<Finding>,
    /// The environment was panicked and must be recovered.
    pub must_recover: bool,
    /// Participants invoked, in order. Empty when the thread scan was fatal.
    pub participants_run: Vec<String>,
}

impl FailchkReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn fatal(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.is_fatal())
    }
}

/// Registry pass of the failure check.
///
/// - `NotInUse` and `BlockedDead` entries are skipped.
/// - Entries whose owner `probe` reports alive are skipped.
/// - A dead `InApi` entry yields [`Finding::DiedInApi`]; its state is left
///   untouched so the evidence survives until recovery.
/// - A dead `Blocked` entry becomes `BlockedDead`.
/// - `Out` entries are left alone while the pool has room; once it is full a
///   dead one is returned to `NotInUse`.
pub fn scan_threads<B: LockBackend>(
    registry: &Registry<'_>,
    _locked: &RegionLocked<'_, B>,
    probe: &dyn LivenessProbe,
) -> Result<Vec<Finding>, MutexError> {
    let pool_full = registry.count() >= registry.max();
    let mut findings = Vec::new();
    for entry in registry.entries() {
        let entry = entry?;
        let state = entry.state();
        if matches!(state, ThreadState::NotInUse | ThreadState::BlockedDead) {
            continue;
        }
        if state == ThreadState::Out && !pool_full {
            continue;
        }
        let identity = entry.identity();
        if probe.is_alive(identity) {
            continue;
        }
        match state {
            ThreadState::InApi => findings.push(Finding::DiedInApi { identity }),
            ThreadState::Blocked => {
                if entry.transition(ThreadState::Blocked, ThreadState::BlockedDead) {
                    findings.push(Finding::DiedBlocked { identity });
                }
            }
            ThreadState::Out => {
                if entry.transition(ThreadState::Out, ThreadState::NotInUse) {
                    findings.push(Finding::EntryReclaimed { identity });
                }
            }
            ThreadState::NotInUse | ThreadState::BlockedDead => {}
        }
    }
    Ok(findings)
}
