//! Mutex handles, allocation flags and subsystem tags.

use serde::Serialize;

/// Handle to one slot of the mutex region.
///
/// Slot 0 is reserved: [`MutexId::INVALID`] is accepted by `lock`, `unlock`
/// and `free` as a no-op, which is how subsystems run with mutexes disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct MutexId(u32);

impl MutexId {
    pub const INVALID: Self = Self(0);

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for MutexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-slot flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct MutexFlags(u32);

impl MutexFlags {
    pub const NONE: Self = Self(0);
    /// Slot is handed out. Set and cleared by the region only.
    pub const ALLOCATED: Self = Self(0x01);
    /// Backs a record-level logical lock (shorter backoff cap).
    pub const LOGICAL_LOCK: Self = Self(0x02);
    /// Never shared across processes; reclaimed by failchk when the
    /// allocating process dies.
    pub const THREAD_PRIVATE: Self = Self(0x04);
    /// Waiters park on the slot itself; any thread may release it.
    pub const SELF_BLOCK: Self = Self(0x08);

    /// Flags a caller may request from `alloc`.
    pub const REQUESTABLE: Self =
        Self(Self::LOGICAL_LOCK.0 | Self::THREAD_PRIVATE.0 | Self::SELF_BLOCK.0);

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub const fn is_requestable(self) -> bool {
        self.0 & !Self::REQUESTABLE.0 == 0
    }
}

impl std::ops::BitOr for MutexFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Which subsystem owns a slot. Recorded for statistics and failchk reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum MutexTag {
    Application = 1,
    DbHandle,
    EnvDbList,
    EnvHandle,
    EnvRegion,
    LockRegion,
    LogicalLock,
    LogFilename,
    LogFlush,
    LogHandle,
    LogRegion,
    MpoolFileHandle,
    MpoolBufferHeader,
    MpoolFileBucket,
    MpoolHandle,
    MpoolHashBucket,
    MpoolRegion,
    MutexRegion,
    MutexTest,
    RepDatabase,
    RepRegion,
    Sequence,
    TxnActive,
    TxnChkpt,
    TxnCommit,
    TxnRegion,
}

impl MutexTag {
    const ALL: [Self; 26] = [
        Self::Application,
        Self::DbHandle,
        Self::EnvDbList,
        Self::EnvHandle,
        Self::EnvRegion,
        Self::LockRegion,
        Self::LogicalLock,
        Self::LogFilename,
        Self::LogFlush,
        Self::LogHandle,
        Self::LogRegion,
        Self::MpoolFileHandle,
        Self::MpoolBufferHeader,
        Self::MpoolFileBucket,
        Self::MpoolHandle,
        Self::MpoolHashBucket,
        Self::MpoolRegion,
        Self::MutexRegion,
        Self::MutexTest,
        Self::RepDatabase,
        Self::RepRegion,
        Self::Sequence,
        Self::TxnActive,
        Self::TxnChkpt,
        Self::TxnCommit,
        Self::TxnRegion,
    ];

    #[must_use]
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Decodes a tag read back from a slot; 0 and unknown values give `None`.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|tag| tag.raw() == raw)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Application => "application allocated",
            Self::DbHandle => "db handle",
            Self::EnvDbList => "env dblist",
            Self::EnvHandle => "env handle",
            Self::EnvRegion => "env region",
            Self::LockRegion => "lock region",
            Self::LogicalLock => "logical lock",
            Self::LogFilename => "log filename",
            Self::LogFlush => "log flush",
            Self::LogHandle => "log handle",
            Self::LogRegion => "log region",
            Self::MpoolFileHandle => "mpoolfile handle",
            Self::MpoolBufferHeader => "mpool buffer",
            Self::MpoolFileBucket => "mpool filehandle",
            Self::MpoolHandle => "mpool handle",
            Self::MpoolHashBucket => "mpool hash bucket",
            Self::MpoolRegion => "mpool region",
            Self::MutexRegion => "mutex region",
            Self::MutexTest => "mutex test",
            Self::RepDatabase => "replication database",
            Self::RepRegion => "replication region",
            Self::Sequence => "sequence",
            Self::TxnActive => "txn active list",
            Self::TxnChkpt => "transaction checkpoint",
            Self::TxnCommit => "txn commit",
            Self::TxnRegion => "txn region",
        }
    }
}
