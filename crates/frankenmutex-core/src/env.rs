//! Mutex environment: the public allocate/lock/unlock/free surface.
//!
//! A [`MutexEnv`] is one process's handle on a mutex region. Several handles,
//! in one process or many, may share a region by mapping the same
//! [`Segment`]. The first handle creates the region; the rest join it.
//!
//! Error propagation:
//! - capacity and destroy errors are returned;
//! - a backend OS error inside lock/unlock panics the environment and is
//!   returned as `RunRecovery`;
//! - consistency violations are logged, and in strict mode also panic the
//!   environment.
//!
//! Once the panic word is set every attached process fails fast: `lock`,
//! `unlock`, `alloc` and registry calls return `RunRecovery`, and threads
//! already waiting abort on their next retry.

use std::fmt::Write as _;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::backend::{BackendError, LockBackend, SelectedBackend, WaitContext};
use crate::config::{ConsistencyMode, EnvConfig, ThreadIdFn};
use crate::error::MutexError;
use crate::failchk::{self, FailchkParticipant, FailchkReport, Finding, LivenessProbe};
use crate::log::{LogEmitter, LogEntry, LogLevel};
use crate::mutex::{MutexFlags, MutexId, MutexTag};
use crate::region::{
    MutexSlot, MutexStat, Region, RegionHeader, RegionLayout, RegionLocked, RegionStats,
};
use crate::segment::Segment;
use crate::thread_registry::{ThreadIdentity, ThreadState};

pub struct MutexEnv<B: LockBackend = SelectedBackend> {
    segment: Segment,
    name: String,
    mode: ConsistencyMode,
    stats: bool,
    created: bool,
    thread_id: Option<ThreadIdFn>,
    probe: Option<Arc<dyn LivenessProbe>>,
    log: parking_lot::Mutex<Option<LogEmitter>>,
    participants: parking_lot::Mutex<Vec<Arc<dyn FailchkParticipant>>>,
    _backend: PhantomData<B>,
}

impl<B: LockBackend> MutexEnv<B> {
    /// Bytes of segment a region built from `config` needs.
    pub fn region_size(config: &EnvConfig) -> Result<usize, MutexError> {
        Ok(RegionLayout::compute::<B>(&config.limits()?)?.total)
    }

    /// Creates the region in `segment`, or joins the one already there.
    ///
    /// Early allocations queued on `config` are drained right after creation;
    /// the `i`-th gets handle `i + 1`. Queued requests on a join are an error.
    pub fn open(mut config: EnvConfig, segment: Segment) -> Result<Self, MutexError> {
        let limits = config.limits()?;
        let early = std::mem::take(&mut config.early);
        let mut env = Self {
            segment,
            mode: config.consistency_mode(),
            name: config.name,
            stats: config.stats,
            created: false,
            thread_id: config.thread_id,
            probe: config.is_alive,
            log: parking_lot::Mutex::new(config.log),
            participants: parking_lot::Mutex::new(Vec::new()),
            _backend: PhantomData,
        };

        if Region::<B>::is_initialized(&env.segment)? {
            if !early.is_empty() {
                return Err(MutexError::InvalidConfig(
                    "early allocations require creating the region",
                ));
            }
            let layout = RegionLayout::compute::<B>(&limits)?;
            let region = Region::<B>::join(&env.segment, layout.slot_size)?;
            let stats = region.stats()?;
            env.log(
                env.entry(LogLevel::Info, "region_join")
                    .with_details(serde_json::json!({
                        "backend": B::NAME,
                        "mutex_count": stats.mutex_count,
                        "mutex_max": stats.mutex_max,
                        "base": env.segment.base_addr(),
                    })),
            );
        } else {
            let layout = RegionLayout::compute::<B>(&limits)?;
            Region::<B>::create(&env.segment, &limits, &layout)?;
            env.created = true;
            env.log(
                env.entry(LogLevel::Info, "region_create")
                    .with_details(serde_json::json!({
                        "backend": B::NAME,
                        "mutex_init": limits.mutex_init,
                        "mutex_max": limits.mutex_max,
                        "align": limits.align,
                        "slot_size": layout.slot_size,
                        "thread_count": limits.thread_count,
                        "region_size": layout.total,
                    })),
            );
        }

        for (index, request) in early.iter().enumerate() {
            let id = env.alloc(request.tag, request.flags)?;
            if id.raw() as usize != index + 1 {
                return Err(MutexError::LayoutMismatch {
                    field: "early allocation order",
                });
            }
        }
        Ok(env)
    }

    /// Environment in process-private heap memory.
    pub fn open_private(config: EnvConfig) -> Result<Self, MutexError> {
        let len = Self::region_size(&config)?;
        Self::open(config, Segment::private(len)?)
    }

    /// Environment in a file mapped shared; every process opening the same
    /// path attaches to the same region.
    ///
    /// A joiner maps the length recorded in the region header, so its own
    /// capacity and registry settings need not match the creator's.
    #[cfg(unix)]
    pub fn open_file(config: EnvConfig, path: &std::path::Path) -> Result<Self, MutexError> {
        let len = {
            let header = Segment::open_file(path, size_of::<RegionHeader>())?;
            match Region::<B>::recorded_len(&header)? {
                Some(len) => len,
                None => Self::region_size(&config)?,
            }
        };
        Self::open(config, Segment::open_file(path, len)?)
    }

    /// True when this handle created the region.
    #[must_use]
    pub fn created(&self) -> bool {
        self.created
    }

    #[must_use]
    pub fn mode(&self) -> ConsistencyMode {
        self.mode
    }

    #[must_use]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    fn region(&self) -> Result<Region<'_, B>, MutexError> {
        Region::attach(&self.segment)
    }

    fn identity(&self) -> ThreadIdentity {
        self.thread_id
            .as_ref()
            .map_or_else(ThreadIdentity::current, |f| f())
    }

    // -----------------------------------------------------------------------
    // Logging and escalation
    // -----------------------------------------------------------------------

    fn entry(&self, level: LogLevel, event: &str) -> LogEntry {
        LogEntry::new("", level, event).with_mode(self.mode.as_str())
    }

    fn log(&self, entry: LogEntry) {
        let mut guard = self.log.lock();
        if let Some(emitter) = guard.as_mut() {
            // Logging never changes the outcome of a mutex operation.
            let _ = emitter.emit_entry(entry);
            let _ = emitter.flush();
        }
    }

    /// Sets the region panic word. Every attached process fails fast from
    /// now on.
    pub fn panic_env(&self, reason: &str) {
        if let Ok(region) = self.region()
            && region.set_panic()
        {
            let me = self.identity();
            self.log(
                self.entry(LogLevel::Fatal, "env_panic")
                    .with_identity(me.pid, me.tid)
                    .with_details(serde_json::json!({ "reason": reason })),
            );
        }
    }

    #[must_use]
    pub fn is_panicked(&self) -> bool {
        self.region().is_ok_and(|r| r.is_panicked())
    }

    fn check_panic(&self, region: &Region<'_, B>) -> Result<(), MutexError> {
        if region.is_panicked() {
            Err(MutexError::RunRecovery)
        } else {
            Ok(())
        }
    }

    fn consistency(&self, err: MutexError) -> MutexError {
        let mut entry = self
            .entry(LogLevel::Error, "consistency_violation")
            .with_errno(err.errno())
            .with_details(serde_json::json!({ "error": err.to_string() }));
        if let MutexError::NotAllocated { id }
        | MutexError::NotHeld { id }
        | MutexError::InvalidHandle { id } = err
            && id != 0
        {
            entry = entry.with_mutex(id);
        }
        self.log(entry);
        if self.mode.escalates() {
            self.panic_env("consistency violation");
        }
        err
    }

    fn backend_failure(&self, id: MutexId, err: BackendError) -> MutexError {
        match err {
            BackendError::Panicked => MutexError::RunRecovery,
            BackendError::NotHeld => self.consistency(MutexError::NotHeld { id: id.raw() }),
            BackendError::Os(errno) => {
                self.log(
                    self.entry(LogLevel::Fatal, "backend_error")
                        .with_mutex(id.raw())
                        .with_errno(errno),
                );
                self.panic_env("mutex backend error");
                MutexError::RunRecovery
            }
        }
    }

    fn lock_region<'r>(&self, region: &Region<'r, B>) -> Result<RegionLocked<'r, B>, MutexError> {
        region.lock_region().map_err(|e| match e {
            BackendError::Panicked => MutexError::RunRecovery,
            BackendError::NotHeld | BackendError::Os(_) => {
                self.backend_failure(MutexId::INVALID, e)
            }
        })
    }

    fn allocated_slot<'r>(
        &self,
        region: &Region<'r, B>,
        id: MutexId,
    ) -> Result<&'r MutexSlot<B::State>, MutexError> {
        let slot = region.slot(id).map_err(|_| {
            self.consistency(MutexError::InvalidHandle { id: id.raw() })
        })?;
        if !slot.flags().contains(MutexFlags::ALLOCATED) {
            return Err(self.consistency(MutexError::NotAllocated { id: id.raw() }));
        }
        Ok(slot)
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocates a mutex. Pops the free list (growing the region if it is
    /// empty and the reservation allows), then initializes the backend with
    /// the region lock released.
    pub fn alloc(&self, tag: MutexTag, flags: MutexFlags) -> Result<MutexId, MutexError> {
        if !flags.is_requestable() {
            return Err(MutexError::InvalidFlags { bits: flags.bits() });
        }
        let region = self.region()?;
        self.check_panic(&region)?;

        let (id, growth) = {
            let locked = self.lock_region(&region)?;
            match region.pop_free(&locked)? {
                Some(id) => (id, None),
                None => match region.grow(&locked)? {
                    Some(growth) => match region.pop_free(&locked)? {
                        Some(id) => (id, Some(growth)),
                        None => {
                            return Err(MutexError::LayoutMismatch {
                                field: "free list after growth",
                            });
                        }
                    },
                    None => {
                        drop(locked);
                        let max = region.slot_max();
                        self.log(
                            self.entry(LogLevel::Error, "out_of_mutexes")
                                .with_tag(tag.name())
                                .with_errno(crate::errno::ENOMEM)
                                .with_details(serde_json::json!({ "max": max })),
                        );
                        return Err(MutexError::OutOfMutexes { max });
                    }
                },
            }
        };
        if let Some(growth) = growth {
            self.log(
                self.entry(LogLevel::Info, "region_grow")
                    .with_details(serde_json::json!({ "from": growth.from, "to": growth.to })),
            );
        }

        let slot = region.slot(id)?;
        slot.assign(tag, flags, self.identity().pid);
        if let Err(errno) = B::init(slot.state(), flags) {
            {
                let locked = self.lock_region(&region)?;
                region.push_free(&locked, id)?;
            }
            self.log(
                self.entry(LogLevel::Error, "init_failed")
                    .with_mutex(id.raw())
                    .with_tag(tag.name())
                    .with_errno(errno),
            );
            return Err(MutexError::InitFailed { errno });
        }
        Ok(id)
    }

    /// Returns a mutex to the region.
    ///
    /// The backend is destroyed before the slot is relinked. A destroy error
    /// is logged and returned, but the slot is reclaimed regardless. Freeing
    /// a slot that is not allocated is a consistency violation. If the region
    /// lock cannot be taken for the relink, the slot stays allocated.
    pub fn free(&self, id: MutexId) -> Result<(), MutexError> {
        if !id.is_valid() {
            return Ok(());
        }
        let region = self.region()?;
        let slot = region
            .slot(id)
            .map_err(|_| self.consistency(MutexError::InvalidHandle { id: id.raw() }))?;
        let previous = slot.take_allocated();
        if !previous.contains(MutexFlags::ALLOCATED) {
            return Err(self.consistency(MutexError::NotAllocated { id: id.raw() }));
        }
        let tag = slot.tag();
        let destroyed = B::destroy(slot.state());
        slot.clear_owner();
        let relinked = self
            .lock_region(&region)
            .and_then(|locked| region.push_free(&locked, id));
        if let Err(err) = relinked {
            // Not on the free list: leave it allocated so a later free or
            // remove finds it. `destroy` tolerates a second call.
            slot.set_flags(previous);
            return Err(err);
        }

        destroyed.map_err(|errno| {
            let mut entry = self
                .entry(LogLevel::Warn, "destroy_failed")
                .with_mutex(id.raw())
                .with_errno(errno);
            if let Some(tag) = tag {
                entry = entry.with_tag(tag.name());
            }
            self.log(entry);
            MutexError::DestroyFailed { errno }
        })
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    /// Blocks until the caller holds `id`. The invalid handle is a no-op.
    pub fn lock(&self, id: MutexId) -> Result<(), MutexError> {
        if !id.is_valid() {
            return Ok(());
        }
        let region = self.region()?;
        self.check_panic(&region)?;
        let slot = self.allocated_slot(&region, id)?;
        let cx = WaitContext {
            flags: slot.flags(),
            spins: region.spins(),
            panic: region.panic_word(),
        };
        let acquired = B::lock(slot.state(), &cx).map_err(|e| self.backend_failure(id, e))?;
        slot.record_owner(self.identity());
        if self.stats {
            slot.count_acquire(acquired.waited);
        }
        Ok(())
    }

    /// Acquires `id` only if it is free. The invalid handle always succeeds.
    pub fn try_lock(&self, id: MutexId) -> Result<bool, MutexError> {
        if !id.is_valid() {
            return Ok(true);
        }
        let region = self.region()?;
        self.check_panic(&region)?;
        let slot = self.allocated_slot(&region, id)?;
        let acquired = B::try_lock(slot.state(), slot.flags())
            .map_err(|e| self.backend_failure(id, e))?;
        if acquired {
            slot.record_owner(self.identity());
            if self.stats {
                slot.count_acquire(false);
            }
        }
        Ok(acquired)
    }

    /// Releases `id`, waking one waiter. The invalid handle is a no-op.
    pub fn unlock(&self, id: MutexId) -> Result<(), MutexError> {
        if !id.is_valid() {
            return Ok(());
        }
        let region = self.region()?;
        self.check_panic(&region)?;
        let slot = self.allocated_slot(&region, id)?;
        let owner = slot.owner();
        slot.clear_owner();
        B::unlock(slot.state(), slot.flags()).map_err(|e| {
            if let Some(owner) = owner {
                slot.record_owner(owner);
            }
            self.backend_failure(id, e)
        })
    }

    /// Locks `id` and returns a guard that unlocks on drop.
    pub fn guard(&self, id: MutexId) -> Result<SlotGuard<'_, B>, MutexError> {
        self.lock(id)?;
        Ok(SlotGuard {
            env: self,
            id,
            armed: true,
        })
    }

    /// Current holder of `id`, or `None` when it is unlocked. A diagnostic
    /// probe: bad handles are returned, not escalated.
    ///
    /// The owner is recorded just after the backend grants the lock and
    /// cleared just before it is released, so a holder that is mid-way
    /// through `lock` or `unlock` may be reported as `None` even though the
    /// mutex is held. Callers needing a definite answer use `try_lock`.
    pub fn holder(&self, id: MutexId) -> Result<Option<ThreadIdentity>, MutexError> {
        let region = self.region()?;
        let slot = region.slot(id)?;
        if !slot.flags().contains(MutexFlags::ALLOCATED) {
            return Err(MutexError::NotAllocated { id: id.raw() });
        }
        Ok(if B::is_locked(slot.state()) {
            slot.owner()
        } else {
            None
        })
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> Result<RegionStats, MutexError> {
        self.region()?.stats()
    }

    pub fn mutex_stat(&self, id: MutexId) -> Result<MutexStat, MutexError> {
        let region = self.region()?;
        let slot = region.slot(id)?;
        let locked = B::is_locked(slot.state());
        let (wait, nowait) = slot.counters();
        Ok(MutexStat {
            id,
            flags: slot.flags(),
            tag: slot.tag().map(MutexTag::name),
            alloc_pid: slot.alloc_pid(),
            locked,
            holder: if locked { slot.owner() } else { None },
            wait,
            nowait,
        })
    }

    /// Resets the high-water mark and all wait counters.
    pub fn clear_stats(&self) -> Result<(), MutexError> {
        let region = self.region()?;
        let locked = self.lock_region(&region)?;
        region.clear_stats(&locked)
    }

    pub fn set_tas_spins(&self, spins: u32) -> Result<(), MutexError> {
        self.region()?.set_spins(spins);
        Ok(())
    }

    /// Free-list contents from head to tail.
    pub fn free_list(&self) -> Result<Vec<MutexId>, MutexError> {
        let region = self.region()?;
        let locked = self.lock_region(&region)?;
        region.free_list(&locked)
    }

    /// Handles currently allocated, ascending.
    pub fn allocated(&self) -> Result<Vec<MutexId>, MutexError> {
        let region = self.region()?;
        let mut out = Vec::new();
        for raw in 1..=region.slot_count() {
            let id = MutexId::from_raw(raw);
            if region.slot(id)?.flags().contains(MutexFlags::ALLOCATED) {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// Human-readable dump of region and per-mutex statistics.
    pub fn stat_print(&self) -> Result<String, MutexError> {
        let stats = self.stats()?;
        let mut out = String::new();
        let _ = writeln!(out, "Mutex region ({} backend)", stats.backend);
        let _ = writeln!(out, "{:>10}\tMutex alignment", stats.align);
        let _ = writeln!(out, "{:>10}\tMutex test-and-set spins", stats.tas_spins);
        let _ = writeln!(out, "{:>10}\tInitial mutex count", stats.mutex_init);
        let _ = writeln!(out, "{:>10}\tMutex count", stats.mutex_count);
        let _ = writeln!(out, "{:>10}\tMutex max", stats.mutex_max);
        let _ = writeln!(out, "{:>10}\tMutex free count", stats.mutex_free);
        let _ = writeln!(out, "{:>10}\tMutex in-use count", stats.mutex_inuse);
        let _ = writeln!(out, "{:>10}\tMutex maximum in-use count", stats.mutex_inuse_max);
        let _ = writeln!(out, "{:>10}\tRegion lock waits", stats.region_wait);
        let _ = writeln!(out, "{:>10}\tRegion lock no-waits", stats.region_nowait);
        let _ = writeln!(out, "{:>10}\tRegion size", stats.region_size);
        if stats.thread_max != 0 {
            let _ = writeln!(
                out,
                "{:>10}\tThread registry entries (of {})",
                stats.thread_count, stats.thread_max
            );
        }
        for id in self.allocated()? {
            let stat = self.mutex_stat(id)?;
            let holder = stat
                .holder
                .map_or_else(|| "-".to_string(), |h| h.to_string());
            let _ = writeln!(
                out,
                "mutex {:>5}  {:<24} wait {:>8}  nowait {:>8}  {}",
                id.raw(),
                stat.tag.unwrap_or("unknown"),
                stat.wait,
                stat.nowait,
                if stat.locked {
                    format!("locked by {holder}")
                } else {
                    "unlocked".to_string()
                },
            );
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Thread registry
    // -----------------------------------------------------------------------

    fn set_thread_state(&self, state: ThreadState) -> Result<(), MutexError> {
        let region = self.region()?;
        self.check_panic(&region)?;
        let Some(registry) = region.registry()? else {
            return Ok(());
        };
        let me = self.identity();
        // An entry found without the lock can only be reused once its owner
        // is dead or it is `NotInUse`; the latter goes through the lock.
        if let Some(entry) = registry.find(me)?
            && entry.state() != ThreadState::NotInUse
        {
            entry.set_state(state);
            return Ok(());
        }
        let locked = self.lock_region(&region)?;
        match registry.insert(me, state, &locked, self.probe.as_deref()) {
            Ok(_) => Ok(()),
            Err(err) => {
                drop(locked);
                if let MutexError::RegistryFull { max } = err {
                    self.log(
                        self.entry(LogLevel::Error, "registry_full")
                            .with_identity(me.pid, me.tid)
                            .with_details(serde_json::json!({ "max": max })),
                    );
                }
                Err(err)
            }
        }
    }

    /// Marks the calling thread as executing inside the engine. A no-op
    /// without a thread registry.
    pub fn enter_tracked_section(&self) -> Result<(), MutexError> {
        self.set_thread_state(ThreadState::InApi)
    }

    /// Marks the calling thread as parked in a blocking engine call.
    pub fn enter_blocking_section(&self) -> Result<(), MutexError> {
        self.set_thread_state(ThreadState::Blocked)
    }

    /// Marks the calling thread as out of the engine.
    pub fn leave_tracked_section(&self) -> Result<(), MutexError> {
        let region = self.region()?;
        let Some(registry) = region.registry()? else {
            return Ok(());
        };
        if let Some(entry) = registry.find(self.identity())? {
            entry.set_state(ThreadState::Out);
        }
        Ok(())
    }

    /// Enters a tracked section that is left when the guard drops.
    pub fn track(&self) -> Result<TrackedSection<'_, B>, MutexError> {
        self.enter_tracked_section()?;
        Ok(TrackedSection { env: self })
    }

    /// Registry state of `id`, if it has an entry.
    pub fn thread_state(&self, id: ThreadIdentity) -> Result<Option<ThreadState>, MutexError> {
        let region = self.region()?;
        let Some(registry) = region.registry()? else {
            return Ok(None);
        };
        Ok(registry.find(id)?.map(|e| e.state()))
    }

    // -----------------------------------------------------------------------
    // Failure check
    // -----------------------------------------------------------------------

    /// Adds a subsystem to run after the thread scan, in registration order.
    pub fn register_participant(&self, participant: Arc<dyn FailchkParticipant>) {
        self.participants.lock().push(participant);
    }

    /// Finds and neutralizes state abandoned by dead threads.
    ///
    /// The thread scan always runs first. If it finds a thread that died
    /// inside the engine, the environment is panicked and participants are
    /// not invoked: recovery could block on locks that thread held.
    pub fn run_failure_check(&self, probe: &dyn LivenessProbe) -> Result<FailchkReport, MutexError> {
        let region = self.region()?;
        self.check_panic(&region)?;
        let Some(registry) = region.registry()? else {
            return Err(MutexError::FailchkUnsupported);
        };

        let mut report = FailchkReport::default();
        let threads = {
            let locked = self.lock_region(&region)?;
            failchk::scan_threads(&registry, &locked, probe)?
        };
        self.record_findings(&mut report, threads);
        if report.must_recover {
            self.panic_env("thread died inside the api");
            return Ok(report);
        }

        let participants = self.participants.lock().clone();
        for participant in participants {
            let findings = participant.failchk(probe)?;
            report.participants_run.push(participant.name().to_string());
            self.record_findings(&mut report, findings);
            if report.must_recover {
                self.panic_env("failchk participant reported a fatal finding");
                return Ok(report);
            }
        }

        let mut reclaimed = Vec::new();
        for raw in 1..=region.slot_count() {
            let id = MutexId::from_raw(raw);
            let slot = region.slot(id)?;
            let flags = slot.flags();
            if flags.contains(MutexFlags::ALLOCATED | MutexFlags::THREAD_PRIVATE)
                && !probe.is_process_alive(slot.alloc_pid())
            {
                let finding = Finding::MutexReclaimed {
                    id,
                    tag: slot.tag(),
                    alloc_pid: slot.alloc_pid(),
                };
                match self.free(id) {
                    Ok(()) | Err(MutexError::DestroyFailed { .. }) => reclaimed.push(finding),
                    Err(err) => return Err(err),
                }
            }
        }
        self.record_findings(&mut report, reclaimed);
        Ok(report)
    }

    fn record_findings(&self, report: &mut FailchkReport, findings: Vec<Finding>) {
        for finding in findings {
            let level = if finding.is_fatal() {
                LogLevel::Fatal
            } else {
                LogLevel::Warn
            };
            let mut entry = self.entry(level, finding.event());
            if let Some(who) = finding.identity() {
                entry = entry.with_identity(who.pid, who.tid);
            }
            if let Finding::MutexReclaimed { id, .. } = &finding {
                entry = entry.with_mutex(id.raw());
            }
            if let Ok(details) = serde_json::to_value(&finding) {
                entry = entry.with_details(details);
            }
            self.log(entry);
            report.must_recover |= finding.is_fatal();
            report.findings.push(finding);
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Permanently removes the region: destroys every allocated mutex and the
    /// region lock, then clears the header so the segment can be reused.
    ///
    /// Every mutex is destroyed even if some fail; the first failure is
    /// returned as `DestroyFailed`.
    pub fn remove(self) -> Result<(), MutexError> {
        let region = self.region()?;
        let mut first_error = None;
        for raw in 1..=region.slot_count() {
            let slot = region.slot(MutexId::from_raw(raw))?;
            if slot.take_allocated().contains(MutexFlags::ALLOCATED)
                && let Err(errno) = B::destroy(slot.state())
            {
                first_error.get_or_insert(errno);
            }
        }
        if let Err(errno) = region.destroy_region_lock() {
            first_error.get_or_insert(errno);
        }
        region.clear_magic();
        self.log(self.entry(LogLevel::Info, "region_remove"));
        match first_error {
            Some(errno) => Err(MutexError::DestroyFailed { errno }),
            None => Ok(()),
        }
    }
}

impl<B: LockBackend> std::fmt::Debug for MutexEnv<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexEnv")
            .field("name", &self.name)
            .field("backend", &B::NAME)
            .field("mode", &self.mode)
            .field("created", &self.created)
            .field("segment", &self.segment)
            .finish_non_exhaustive()
    }
}

/// Holds a mutex until dropped.
#[must_use = "the mutex is released when the guard drops"]
pub struct SlotGuard<'a, B: LockBackend = SelectedBackend> {
    env: &'a MutexEnv<B>,
    id: MutexId,
    armed: bool,
}

impl<B: LockBackend> SlotGuard<'_, B> {
    #[must_use]
    pub fn id(&self) -> MutexId {
        self.id
    }

    /// Releases now, reporting any error the drop would swallow.
    pub fn unlock(mut self) -> Result<(), MutexError> {
        self.armed = false;
        self.env.unlock(self.id)
    }
}

impl<B: LockBackend> Drop for SlotGuard<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.env.unlock(self.id);
        }
    }
}

/// Tracked section left when dropped.
#[must_use = "the tracked section ends when the guard drops"]
pub struct TrackedSection<'a, B: LockBackend = SelectedBackend> {
    env: &'a MutexEnv<B>,
}

impl<B: LockBackend> Drop for TrackedSection<'_, B> {
    fn drop(&mut self) {
        let _ = self.env.leave_tracked_section();
    }
}
