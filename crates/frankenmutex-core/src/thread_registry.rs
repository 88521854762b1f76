//! Thread-liveness registry.
//!
//! A hash table of (pid, tid) identities stored in the region segment, one
//! entry per thread that has ever entered a tracked section. The failure
//! checker cross-references it against a liveness probe to find threads that
//! died inside the engine.
//!
//! Layout inside the segment, starting at the registry offset:
//!
//! ```text
//! RegistryHeader | bucket heads: [AtomicU32; nbuckets] | entries: [ThreadEntry; max]
//! ```
//!
//! Bucket heads and entry links store `index + 1`, so 0 ends a chain. Entries
//! are only ever appended or relinked with the region lock held; lookups walk
//! the chains without it, bounded by the pool size.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use crate::backend::LockBackend;
use crate::error::MutexError;
use crate::failchk::LivenessProbe;
use crate::region::RegionLocked;
use crate::segment::{Segment, ShOff, ShmSafe, align_up};

/// Process id + kernel thread id of a registry participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ThreadIdentity {
    pub pid: u32,
    pub tid: u64,
}

impl ThreadIdentity {
    #[must_use]
    pub const fn new(pid: u32, tid: u64) -> Self {
        Self { pid, tid }
    }

    /// Identity of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            tid: current_tid(),
        }
    }

    fn bucket(self, nbuckets: u32) -> u32 {
        ((u64::from(self.pid) ^ self.tid) % u64::from(nbuckets.max(1))) as u32
    }
}

impl std::fmt::Display for ThreadIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.pid, self.tid)
    }
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn current_tid() -> u64 {
    // SAFETY: gettid has no preconditions.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    tid as u64
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> u64 {
    use std::cell::Cell;

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static SELF_ID: Cell<u64> = const { Cell::new(0) };
    }
    SELF_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

/// Registry entry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum ThreadState {
    NotInUse = 0,
    /// Executing inside the engine.
    InApi = 1,
    /// Left the engine; eligible for reuse once its owner is confirmed dead.
    Out = 2,
    /// Parked in a blocking engine call.
    Blocked = 3,
    /// A blocked thread the failure checker found dead.
    BlockedDead = 4,
}

impl ThreadState {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::InApi,
            2 => Self::Out,
            3 => Self::Blocked,
            4 => Self::BlockedDead,
            _ => Self::NotInUse,
        }
    }
}

#[repr(C)]
pub struct RegistryHeader {
    nbuckets: AtomicU32,
    max: AtomicU32,
    count: AtomicU32,
    _reserved: AtomicU32,
    buckets_off: AtomicU64,
    entries_off: AtomicU64,
}

// SAFETY: repr(C) atomics only.
#[allow(unsafe_code)]
unsafe impl ShmSafe for RegistryHeader {}

#[repr(C)]
pub struct ThreadEntry {
    pid: AtomicU32,
    state: AtomicU32,
    tid: AtomicU64,
    next: AtomicU32,
    _pad: AtomicU32,
}

// SAFETY: repr(C) atomics only.
#[allow(unsafe_code)]
unsafe impl ShmSafe for ThreadEntry {}

impl ThreadEntry {
    #[must_use]
    pub fn identity(&self) -> ThreadIdentity {
        ThreadIdentity {
            pid: self.pid.load(Ordering::Acquire),
            tid: self.tid.load(Ordering::Acquire),
        }
    }

    #[must_use]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Owner-side transition.
    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Checker-side transition; fails if the owner moved the entry meanwhile.
    pub fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// Bucket counts: a prime near each power of two.
const TABLE_SIZES: [(u32, u32); 16] = [
    (32, 37),
    (64, 67),
    (128, 131),
    (256, 257),
    (512, 521),
    (1024, 1031),
    (2048, 2053),
    (4096, 4099),
    (8192, 8191),
    (16384, 16381),
    (32768, 32771),
    (65536, 65537),
    (131_072, 131_071),
    (262_144, 262_147),
    (524_288, 524_287),
    (1_048_576, 1_048_573),
];

/// Prime bucket count for a pool of `threads` entries.
#[must_use]
pub fn table_size(threads: u32) -> u32 {
    TABLE_SIZES
        .iter()
        .find(|(power, _)| *power >= threads)
        .map_or(TABLE_SIZES[TABLE_SIZES.len() - 1].1, |&(_, prime)| prime)
}

/// Bytes the registry needs for a pool of `threads` entries.
#[must_use]
pub fn layout_size(threads: u32) -> usize {
    offsets(threads).2
}

// (buckets, entries, end) relative to the registry start.
fn offsets(threads: u32) -> (usize, usize, usize) {
    let buckets = align_up(size_of::<RegistryHeader>(), align_of::<AtomicU32>());
    let nbuckets = table_size(threads) as usize;
    let entries = align_up(
        buckets + nbuckets * size_of::<AtomicU32>(),
        align_of::<ThreadEntry>(),
    );
    let end = entries + threads as usize * size_of::<ThreadEntry>();
    (buckets, entries, end)
}

/// View of the registry inside a mapped segment.
pub struct Registry<'a> {
    seg: &'a Segment,
    hdr: &'a RegistryHeader,
    buckets: ShOff<AtomicU32>,
    entries: ShOff<ThreadEntry>,
    nbuckets: u32,
    max: u32,
}

impl<'a> Registry<'a> {
    /// Writes the registry header. The range must already be zeroed.
    pub(crate) fn create(seg: &'a Segment, at: u64, threads: u32) -> Result<Self, MutexError> {
        let hdr: &RegistryHeader = seg.resolve(ShOff::new(at))?;
        let (buckets, entries, _) = offsets(threads);
        hdr.nbuckets.store(table_size(threads), Ordering::Relaxed);
        hdr.max.store(threads, Ordering::Relaxed);
        hdr.count.store(0, Ordering::Relaxed);
        hdr.buckets_off.store(at + buckets as u64, Ordering::Relaxed);
        hdr.entries_off
            .store(at + entries as u64, Ordering::Release);
        Self::attach(seg, at)
    }

    pub(crate) fn attach(seg: &'a Segment, at: u64) -> Result<Self, MutexError> {
        let hdr: &RegistryHeader = seg.resolve(ShOff::new(at))?;
        let registry = Self {
            seg,
            hdr,
            buckets: ShOff::new(hdr.buckets_off.load(Ordering::Acquire)),
            entries: ShOff::new(hdr.entries_off.load(Ordering::Acquire)),
            nbuckets: hdr.nbuckets.load(Ordering::Acquire),
            max: hdr.max.load(Ordering::Acquire),
        };
        if registry.nbuckets == 0 {
            return Err(MutexError::LayoutMismatch {
                field: "registry buckets",
            });
        }
        Ok(registry)
    }

    #[must_use]
    pub fn max(&self) -> u32 {
        self.max
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.hdr.count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn nbuckets(&self) -> u32 {
        self.nbuckets
    }

    fn bucket(&self, index: u32) -> Result<&'a AtomicU32, MutexError> {
        self.seg
            .resolve(self.buckets.index(u64::from(index), size_of::<AtomicU32>() as u64))
    }

    /// Entry at pool index `index` (0-based).
    pub fn entry(&self, index: u32) -> Result<&'a ThreadEntry, MutexError> {
        if index >= self.max {
            return Err(MutexError::LayoutMismatch {
                field: "registry entry index",
            });
        }
        self.seg
            .resolve(self.entries.index(u64::from(index), size_of::<ThreadEntry>() as u64))
    }

    /// Lock-free lookup. May miss an entry being relinked concurrently; the
    /// locked re-check in [`insert`](Self::insert) covers that.
    pub fn find(&self, id: ThreadIdentity) -> Result<Option<&'a ThreadEntry>, MutexError> {
        let mut link = self.bucket(id.bucket(self.nbuckets))?.load(Ordering::Acquire);
        let mut steps = 0;
        while link != 0 && steps <= self.max {
            let entry = self.entry(link - 1)?;
            if entry.identity() == id {
                return Ok(Some(entry));
            }
            link = entry.next.load(Ordering::Acquire);
            steps += 1;
        }
        Ok(None)
    }

    /// Returns the entry for `id` in `state`, creating one if needed.
    ///
    /// A new entry takes the next unused pool slot. When the pool is full, a
    /// `NotInUse` entry is reused, or an `Out` entry whose owner `probe`
    /// reports dead. Entries of live or in-API threads are never taken.
    ///
    /// `state` is stored before the region lock is released, so an entry is
    /// never visible as `NotInUse` under the identity of a live thread.
    pub fn insert<B: LockBackend>(
        &self,
        id: ThreadIdentity,
        state: ThreadState,
        _locked: &RegionLocked<'_, B>,
        probe: Option<&dyn LivenessProbe>,
    ) -> Result<&'a ThreadEntry, MutexError> {
        if let Some(entry) = self.find(id)? {
            entry.set_state(state);
            return Ok(entry);
        }

        let count = self.count();
        if count < self.max {
            let entry = self.entry(count)?;
            entry.pid.store(id.pid, Ordering::Relaxed);
            entry.tid.store(id.tid, Ordering::Relaxed);
            entry.set_state(state);
            self.link(count, id)?;
            self.hdr.count.store(count + 1, Ordering::Release);
            return Ok(entry);
        }

        for index in 0..self.max {
            let entry = self.entry(index)?;
            let reusable = match entry.state() {
                ThreadState::NotInUse => true,
                ThreadState::Out => probe.is_some_and(|p| !p.is_alive(entry.identity())),
                _ => false,
            };
            if reusable {
                self.unlink(index, entry.identity())?;
                entry.pid.store(id.pid, Ordering::Relaxed);
                entry.tid.store(id.tid, Ordering::Relaxed);
                entry.set_state(state);
                self.link(index, id)?;
                return Ok(entry);
            }
        }

        Err(MutexError::RegistryFull { max: self.max })
    }

    fn link(&self, index: u32, id: ThreadIdentity) -> Result<(), MutexError> {
        let head = self.bucket(id.bucket(self.nbuckets))?;
        let entry = self.entry(index)?;
        entry.next.store(head.load(Ordering::Acquire), Ordering::Relaxed);
        head.store(index + 1, Ordering::Release);
        Ok(())
    }

    fn unlink(&self, index: u32, id: ThreadIdentity) -> Result<(), MutexError> {
        let head = self.bucket(id.bucket(self.nbuckets))?;
        let target = index + 1;
        let after = self.entry(index)?.next.load(Ordering::Acquire);

        if head.load(Ordering::Acquire) == target {
            head.store(after, Ordering::Release);
            return Ok(());
        }
        let mut link = head.load(Ordering::Acquire);
        let mut steps = 0;
        while link != 0 && steps <= self.max {
            let entry = self.entry(link - 1)?;
            let next = entry.next.load(Ordering::Acquire);
            if next == target {
                entry.next.store(after, Ordering::Release);
                return Ok(());
            }
            link = next;
            steps += 1;
        }
        Err(MutexError::LayoutMismatch {
            field: "registry chain",
        })
    }

    /// Entries handed out so far, in pool order.
    pub fn entries(&self) -> impl Iterator<Item = Result<&'a ThreadEntry, MutexError>> + '_ {
        (0..self.count()).map(move |index| self.entry(index))
    }
}
