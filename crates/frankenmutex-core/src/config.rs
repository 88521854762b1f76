//! Environment configuration.
//!
//! The consistency mode is set via the `FRANKENMUTEX_MODE` environment
//! variable and may be overridden per environment on [`EnvConfig`]:
//! - `strict` (default): a consistency violation (unlock of an unheld mutex,
//!   double free, out-of-range handle) panics the environment. Every attached
//!   process then fails fast with `RunRecovery`.
//! - `relaxed`: the violation is logged and returned to the caller; the
//!   environment stays usable.
//!
//! `FRANKENMUTEX_TAS_SPINS` overrides the default spin count.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::backend;
use crate::error::MutexError;
use crate::failchk::LivenessProbe;
use crate::log::LogEmitter;
use crate::mutex::{MutexFlags, MutexId, MutexTag};
use crate::segment::SEGMENT_ALIGN;
use crate::thread_registry::ThreadIdentity;

/// Slots initialized at creation when no count is configured.
pub const DEFAULT_MUTEX_INIT: u32 = 256;
/// Registry pool size when a liveness probe is configured without a count.
pub const DEFAULT_THREAD_COUNT: u32 = 64;
/// Largest slot count a region may reserve.
pub const MAX_MUTEX_COUNT: u32 = 1 << 24;

/// How consistency violations are handled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsistencyMode {
    /// Violations panic the environment.
    #[default]
    Strict,
    /// Violations are logged and returned.
    Relaxed,
}

impl ConsistencyMode {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "relaxed" | "production" | "off" => Self::Relaxed,
            _ => Self::Strict,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Relaxed => "relaxed",
        }
    }

    /// Returns true if a consistency violation must panic the environment.
    #[must_use]
    pub const fn escalates(self) -> bool {
        matches!(self, Self::Strict)
    }
}

// Atomic cache: 0=unresolved, 1=Strict, 2=Relaxed, 255=resolving.
static CACHED_MODE: AtomicU8 = AtomicU8::new(0);

const MODE_UNRESOLVED: u8 = 0;
const MODE_STRICT: u8 = 1;
const MODE_RELAXED: u8 = 2;
const MODE_RESOLVING: u8 = 255;

fn mode_to_u8(mode: ConsistencyMode) -> u8 {
    match mode {
        ConsistencyMode::Strict => MODE_STRICT,
        ConsistencyMode::Relaxed => MODE_RELAXED,
    }
}

fn u8_to_mode(v: u8) -> ConsistencyMode {
    match v {
        MODE_RELAXED => ConsistencyMode::Relaxed,
        _ => ConsistencyMode::Strict,
    }
}

/// Process-wide default mode (reads `FRANKENMUTEX_MODE` on first call, caches
/// thereafter).
///
/// Concurrent first callers that lose the race to resolve see `Strict` until
/// the winner publishes.
#[must_use]
pub fn consistency_mode() -> ConsistencyMode {
    let cached = CACHED_MODE.load(Ordering::Relaxed);
    if cached != MODE_UNRESOLVED && cached != MODE_RESOLVING {
        return u8_to_mode(cached);
    }
    if cached == MODE_RESOLVING {
        return ConsistencyMode::Strict;
    }

    if CACHED_MODE
        .compare_exchange(
            MODE_UNRESOLVED,
            MODE_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_MODE.load(Ordering::Relaxed);
        return if v != MODE_UNRESOLVED && v != MODE_RESOLVING {
            u8_to_mode(v)
        } else {
            ConsistencyMode::Strict
        };
    }

    let mode = std::env::var("FRANKENMUTEX_MODE")
        .map(|v| ConsistencyMode::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_MODE.store(mode_to_u8(mode), Ordering::Release);
    mode
}

fn parse_spins(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok().filter(|&n| n > 0)
}

/// Spin count from `FRANKENMUTEX_TAS_SPINS`, if set to a positive integer.
#[must_use]
pub fn tas_spins_override() -> Option<u32> {
    std::env::var("FRANKENMUTEX_TAS_SPINS")
        .ok()
        .and_then(|v| parse_spins(&v))
}

/// Host hook returning the calling thread's identity.
pub type ThreadIdFn = Arc<dyn Fn() -> ThreadIdentity + Send + Sync>;

/// A mutex requested before the region exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarlyRequest {
    pub tag: MutexTag,
    pub flags: MutexFlags,
}

/// Validated numeric limits derived from an [`EnvConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub mutex_init: u32,
    pub mutex_max: u32,
    /// 0 selects the automatic increment.
    pub mutex_increment: u32,
    pub align: usize,
    pub tas_spins: u32,
    /// 0 means no thread registry.
    pub thread_count: u32,
}

/// Builder for a mutex environment.
pub struct EnvConfig {
    pub(crate) name: String,
    pub(crate) mutex_init: u32,
    pub(crate) mutex_max: Option<u32>,
    pub(crate) mutex_increment: Option<u32>,
    pub(crate) align: usize,
    pub(crate) tas_spins: Option<u32>,
    pub(crate) thread_count: Option<u32>,
    pub(crate) thread_id: Option<ThreadIdFn>,
    pub(crate) is_alive: Option<Arc<dyn LivenessProbe>>,
    pub(crate) consistency: Option<ConsistencyMode>,
    pub(crate) stats: bool,
    pub(crate) log: Option<LogEmitter>,
    pub(crate) early: Vec<EarlyRequest>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "env".to_string(),
            mutex_init: DEFAULT_MUTEX_INIT,
            mutex_max: None,
            mutex_increment: None,
            align: size_of::<usize>(),
            tas_spins: None,
            thread_count: None,
            thread_id: None,
            is_alive: None,
            consistency: None,
            stats: true,
            log: None,
            early: Vec::new(),
        }
    }

    /// Name used as the trace-id prefix in logs.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Slots initialized at creation. Also the maximum unless
    /// [`with_mutex_max`](Self::with_mutex_max) raises it.
    #[must_use]
    pub fn with_mutex_init(mut self, count: u32) -> Self {
        self.mutex_init = count;
        self
    }

    /// Slots reserved for growth.
    #[must_use]
    pub fn with_mutex_max(mut self, count: u32) -> Self {
        self.mutex_max = Some(count);
        self
    }

    /// Slots added per growth step.
    #[must_use]
    pub fn with_mutex_increment(mut self, count: u32) -> Self {
        self.mutex_increment = Some(count);
        self
    }

    /// Slot alignment; a power of two no larger than the segment alignment.
    #[must_use]
    pub fn with_align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    #[must_use]
    pub fn with_tas_spins(mut self, spins: u32) -> Self {
        self.tas_spins = Some(spins);
        self
    }

    /// Thread registry pool size.
    #[must_use]
    pub fn with_thread_count(mut self, count: u32) -> Self {
        self.thread_count = Some(count);
        self
    }

    /// Identity hook used for registry entries and owner records.
    #[must_use]
    pub fn with_thread_id<F>(mut self, f: F) -> Self
    where
        F: Fn() -> ThreadIdentity + Send + Sync + 'static,
    {
        self.thread_id = Some(Arc::new(f));
        self
    }

    /// Liveness probe used by the registry and the failure checker.
    #[must_use]
    pub fn with_is_alive<P>(mut self, probe: P) -> Self
    where
        P: LivenessProbe + 'static,
    {
        self.is_alive = Some(Arc::new(probe));
        self
    }

    #[must_use]
    pub fn with_consistency(mut self, mode: ConsistencyMode) -> Self {
        self.consistency = Some(mode);
        self
    }

    /// Toggles per-slot wait counters.
    #[must_use]
    pub fn with_stats(mut self, enabled: bool) -> Self {
        self.stats = enabled;
        self
    }

    #[must_use]
    pub fn with_log(mut self, emitter: LogEmitter) -> Self {
        self.log = Some(emitter);
        self
    }

    /// Queues a mutex to be allocated as soon as the region is created.
    ///
    /// The `i`-th queued request (0-based) is assigned handle `i + 1`.
    pub fn alloc_early(&mut self, tag: MutexTag, flags: MutexFlags) -> Result<MutexId, MutexError> {
        if !flags.is_requestable() {
            return Err(MutexError::InvalidFlags { bits: flags.bits() });
        }
        let next = u32::try_from(self.early.len() + 1)
            .map_err(|_| MutexError::InvalidConfig("too many early allocations"))?;
        self.early.push(EarlyRequest { tag, flags });
        Ok(MutexId::from_raw(next))
    }

    #[must_use]
    pub fn early_requests(&self) -> &[EarlyRequest] {
        &self.early
    }

    #[must_use]
    pub fn consistency_mode(&self) -> ConsistencyMode {
        self.consistency.unwrap_or_else(consistency_mode)
    }

    /// Checks the configuration and derives the region limits.
    pub fn limits(&self) -> Result<Limits, MutexError> {
        if self.mutex_init == 0 {
            return Err(MutexError::InvalidConfig("mutex_init must be at least 1"));
        }
        let mutex_max = self.mutex_max.unwrap_or(self.mutex_init);
        if mutex_max < self.mutex_init {
            return Err(MutexError::InvalidConfig("mutex_max below mutex_init"));
        }
        if mutex_max > MAX_MUTEX_COUNT {
            return Err(MutexError::InvalidConfig("mutex_max too large"));
        }
        if !self.align.is_power_of_two() || self.align > SEGMENT_ALIGN {
            return Err(MutexError::InvalidConfig(
                "align must be a power of two no larger than 4096",
            ));
        }
        if self.early.len() > mutex_max as usize {
            return Err(MutexError::InvalidConfig(
                "more early allocations than mutex_max",
            ));
        }
        if self.thread_id.is_some() && self.is_alive.is_none() {
            return Err(MutexError::FailchkUnsupported);
        }

        let tas_spins = self
            .tas_spins
            .or_else(tas_spins_override)
            .unwrap_or_else(backend::default_spins);
        if tas_spins == 0 {
            return Err(MutexError::InvalidConfig("tas_spins must be at least 1"));
        }

        let thread_count = match (self.thread_count, &self.is_alive) {
            (Some(n), _) => n,
            (None, Some(_)) => DEFAULT_THREAD_COUNT,
            (None, None) => 0,
        };

        Ok(Limits {
            mutex_init: self.mutex_init,
            mutex_max,
            mutex_increment: self.mutex_increment.unwrap_or(0),
            align: self.align,
            tas_spins,
            thread_count,
        })
    }
}

impl std::fmt::Debug for EnvConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvConfig")
            .field("name", &self.name)
            .field("mutex_init", &self.mutex_init)
            .field("mutex_max", &self.mutex_max)
            .field("mutex_increment", &self.mutex_increment)
            .field("align", &self.align)
            .field("tas_spins", &self.tas_spins)
            .field("thread_count", &self.thread_count)
            .field("thread_id", &self.thread_id.is_some())
            .field("is_alive", &self.is_alive.is_some())
            .field("consistency", &self.consistency)
            .field("early", &self.early.len())
            .finish_non_exhaustive()
    }
}
