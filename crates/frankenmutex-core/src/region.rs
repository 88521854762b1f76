//! Mutex region: header, slot array and free list inside a segment.
//!
//! ```text
//! offset 0          RegionHeader
//! slot_off          slot 0: the region lock (never handed out)
//! slot_off + i*sz   slot i, i in 1..=slot_max
//! registry_off      thread registry (absent when thread_count is 0)
//! ```
//!
//! Every offset is relative to the segment start, so a process that maps the
//! segment at any address can locate everything from the header alone. Slot
//! memory for the full `slot_max` is reserved at creation; only `slot_count`
//! slots are linked into the free list, the rest are added by [`Region::grow`].
//!
//! The free list, counters and registry are mutated only while holding the
//! region lock, witnessed by a [`RegionLocked`] token.

#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use crate::backend::{BackendError, LockBackend, WaitContext};
use crate::config::Limits;
use crate::error::MutexError;
use crate::mutex::{MutexFlags, MutexId, MutexTag};
use crate::segment::{Segment, ShOff, ShmSafe, align_up};
use crate::thread_registry::{self, Registry, ThreadIdentity};

/// "FXMUTRG1"
pub const REGION_MAGIC: u64 = 0x4658_4d55_5452_4731;
pub const REGION_VERSION: u32 = 1;
/// Smallest automatic growth step.
pub const MIN_INCREMENT: u32 = 8;

#[repr(C)]
pub struct RegionHeader {
    magic: AtomicU64,
    version: AtomicU32,
    backend_id: AtomicU32,
    align: AtomicU32,
    slot_size: AtomicU32,
    slot_init: AtomicU32,
    slot_max: AtomicU32,
    slot_count: AtomicU32,
    increment: AtomicU32,
    tas_spins: AtomicU32,
    panic: AtomicU32,
    free_head: AtomicU32,
    free_count: AtomicU32,
    inuse: AtomicU32,
    inuse_max: AtomicU32,
    region_lock_off: AtomicU64,
    slot_off: AtomicU64,
    registry_off: AtomicU64,
    segment_len: AtomicU64,
    region_wait: AtomicU64,
    region_nowait: AtomicU64,
}

// SAFETY: repr(C) atomics only.
unsafe impl ShmSafe for RegionHeader {}

#[repr(C)]
pub struct SlotHeader {
    flags: AtomicU32,
    tag: AtomicU32,
    next_free: AtomicU32,
    alloc_pid: AtomicU32,
    owner_pid: AtomicU32,
    _pad: AtomicU32,
    owner_tid: AtomicU64,
    wait: AtomicU64,
    nowait: AtomicU64,
}

#[repr(C)]
pub struct MutexSlot<S> {
    hdr: SlotHeader,
    state: S,
}

// SAFETY: a repr(C) pair of ShmSafe parts.
unsafe impl<S: ShmSafe> ShmSafe for MutexSlot<S> {}

impl<S> MutexSlot<S> {
    /// Backend lock state.
    pub fn state(&self) -> &S {
        &self.state
    }

    #[must_use]
    pub fn flags(&self) -> MutexFlags {
        MutexFlags::from_bits(self.hdr.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: MutexFlags) {
        self.hdr.flags.store(flags.bits(), Ordering::Release);
    }

    /// Clears `allocated` and returns the flags it replaced.
    pub(crate) fn take_allocated(&self) -> MutexFlags {
        MutexFlags::from_bits(
            self.hdr
                .flags
                .fetch_and(!MutexFlags::ALLOCATED.bits(), Ordering::AcqRel),
        )
    }

    #[must_use]
    pub fn tag(&self) -> Option<MutexTag> {
        MutexTag::from_raw(self.hdr.tag.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn alloc_pid(&self) -> u32 {
        self.hdr.alloc_pid.load(Ordering::Relaxed)
    }

    pub(crate) fn assign(&self, tag: MutexTag, flags: MutexFlags, pid: u32) {
        self.hdr.tag.store(tag.raw(), Ordering::Relaxed);
        self.hdr.alloc_pid.store(pid, Ordering::Relaxed);
        self.hdr.wait.store(0, Ordering::Relaxed);
        self.hdr.nowait.store(0, Ordering::Relaxed);
        self.clear_owner();
        self.set_flags(flags.union(MutexFlags::ALLOCATED));
    }

    /// Recorded holder. Diagnostic only: the two words are not read atomically
    /// together.
    #[must_use]
    pub fn owner(&self) -> Option<ThreadIdentity> {
        match self.hdr.owner_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(ThreadIdentity::new(
                pid,
                self.hdr.owner_tid.load(Ordering::Relaxed),
            )),
        }
    }

    pub(crate) fn record_owner(&self, id: ThreadIdentity) {
        self.hdr.owner_tid.store(id.tid, Ordering::Relaxed);
        self.hdr.owner_pid.store(id.pid, Ordering::Release);
    }

    pub(crate) fn clear_owner(&self) {
        self.hdr.owner_pid.store(0, Ordering::Release);
        self.hdr.owner_tid.store(0, Ordering::Relaxed);
    }

    pub(crate) fn count_acquire(&self, waited: bool) {
        let counter = if waited {
            &self.hdr.wait
        } else {
            &self.hdr.nowait
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// (wait, nowait)
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        (
            self.hdr.wait.load(Ordering::Relaxed),
            self.hdr.nowait.load(Ordering::Relaxed),
        )
    }
}

/// Byte layout of a region for a given backend and set of limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub slot_size: usize,
    pub slot_off: usize,
    pub slot_max: u32,
    pub registry_off: usize,
    pub registry_len: usize,
    pub total: usize,
}

fn slot_size<B: LockBackend>(align: usize) -> usize {
    let slot_align = align.max(align_of::<MutexSlot<B::State>>());
    align_up(size_of::<MutexSlot<B::State>>(), slot_align)
}

impl RegionLayout {
    pub fn compute<B: LockBackend>(limits: &Limits) -> Result<Self, MutexError> {
        let slot_align = limits.align.max(align_of::<MutexSlot<B::State>>());
        let slot_size = slot_size::<B>(limits.align);
        let slot_off = align_up(size_of::<RegionHeader>(), slot_align);
        // Slot 0 holds the region lock.
        let slots_len = (limits.mutex_max as usize + 1)
            .checked_mul(slot_size)
            .ok_or(MutexError::InvalidConfig("mutex region too large"))?;
        let slots_end = slot_off + slots_len;

        let (registry_off, registry_len) = if limits.thread_count == 0 {
            (0, 0)
        } else {
            (
                align_up(slots_end, align_of::<u64>()),
                thread_registry::layout_size(limits.thread_count),
            )
        };
        let total = if registry_len == 0 {
            slots_end
        } else {
            registry_off + registry_len
        };
        if u32::try_from(slot_size).is_err() {
            return Err(MutexError::InvalidConfig("mutex slot too large"));
        }
        Ok(Self {
            slot_size,
            slot_off,
            slot_max: limits.mutex_max,
            registry_off,
            registry_len,
            total,
        })
    }
}

/// Proof that the region lock is held. Releases it on drop.
pub struct RegionLocked<'a, B: LockBackend> {
    state: &'a B::State,
    panic: &'a AtomicU32,
    waited: bool,
    _backend: PhantomData<B>,
}

impl<'a, B: LockBackend> RegionLocked<'a, B> {
    pub(crate) fn acquire(state: &'a B::State, cx: &WaitContext<'a>) -> Result<Self, BackendError> {
        let acquired = B::lock(state, cx)?;
        Ok(Self {
            state,
            panic: cx.panic,
            waited: acquired.waited,
            _backend: PhantomData,
        })
    }

    #[must_use]
    pub fn waited(&self) -> bool {
        self.waited
    }
}

impl<B: LockBackend> Drop for RegionLocked<'_, B> {
    fn drop(&mut self) {
        // A region lock that cannot be released wedges every process.
        if B::unlock(self.state, MutexFlags::NONE).is_err() {
            self.panic.store(1, Ordering::Release);
        }
    }
}

/// Slots added by one growth step: `from + 1 ..= to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Growth {
    pub from: u32,
    pub to: u32,
}

/// Region-wide statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionStats {
    pub backend: &'static str,
    pub align: u32,
    pub tas_spins: u32,
    pub mutex_init: u32,
    pub mutex_count: u32,
    pub mutex_max: u32,
    pub mutex_free: u32,
    pub mutex_inuse: u32,
    pub mutex_inuse_max: u32,
    pub region_wait: u64,
    pub region_nowait: u64,
    pub region_size: u64,
    pub thread_max: u32,
    pub thread_count: u32,
}

/// Per-mutex statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutexStat {
    pub id: MutexId,
    pub flags: MutexFlags,
    pub tag: Option<&'static str>,
    pub alloc_pid: u32,
    pub locked: bool,
    pub holder: Option<ThreadIdentity>,
    pub wait: u64,
    pub nowait: u64,
}

/// View of an initialized region.
pub struct Region<'a, B: LockBackend> {
    seg: &'a Segment,
    hdr: &'a RegionHeader,
    slot_off: ShOff<MutexSlot<B::State>>,
    slot_size: u64,
}

impl<'a, B: LockBackend> Region<'a, B> {
    /// Whether the segment already holds a published region.
    pub fn is_initialized(seg: &Segment) -> Result<bool, MutexError> {
        let hdr: &RegionHeader = seg.resolve(ShOff::new(0))?;
        match hdr.magic.load(Ordering::Acquire) {
            0 => Ok(false),
            REGION_MAGIC => Ok(true),
            _ => Err(MutexError::LayoutMismatch { field: "magic" }),
        }
    }

    /// Segment length the creator recorded, or `None` if no region has been
    /// published in `seg` yet. Needs only the header to be mapped.
    pub fn recorded_len(seg: &Segment) -> Result<Option<usize>, MutexError> {
        if !Self::is_initialized(seg)? {
            return Ok(None);
        }
        let hdr: &RegionHeader = seg.resolve(ShOff::new(0))?;
        usize::try_from(hdr.segment_len.load(Ordering::Relaxed))
            .map(Some)
            .map_err(|_| MutexError::LayoutMismatch {
                field: "segment length",
            })
    }

    /// Lays out a fresh region and publishes it.
    ///
    /// The caller must be the only process touching the segment until this
    /// returns; concurrent creators are not arbitrated here.
    pub(crate) fn create(
        seg: &'a Segment,
        limits: &Limits,
        layout: &RegionLayout,
    ) -> Result<Self, MutexError> {
        if seg.len() < layout.total {
            return Err(MutexError::InvalidConfig(
                "segment smaller than the region layout",
            ));
        }
        // SAFETY: exclusive access is the documented contract, and nothing
        // has been resolved from this segment yet.
        unsafe { seg.zero_range(0, layout.total)? };

        let hdr: &RegionHeader = seg.resolve(ShOff::new(0))?;
        let as_u32 = |v: usize| {
            u32::try_from(v).map_err(|_| MutexError::InvalidConfig("region field overflows u32"))
        };
        hdr.version.store(REGION_VERSION, Ordering::Relaxed);
        hdr.backend_id.store(B::ID, Ordering::Relaxed);
        hdr.align.store(as_u32(limits.align)?, Ordering::Relaxed);
        hdr.slot_size.store(as_u32(layout.slot_size)?, Ordering::Relaxed);
        hdr.slot_init.store(limits.mutex_init, Ordering::Relaxed);
        hdr.slot_max.store(limits.mutex_max, Ordering::Relaxed);
        hdr.increment.store(limits.mutex_increment, Ordering::Relaxed);
        hdr.tas_spins.store(limits.tas_spins, Ordering::Relaxed);
        hdr.region_lock_off
            .store(layout.slot_off as u64, Ordering::Relaxed);
        hdr.slot_off.store(layout.slot_off as u64, Ordering::Relaxed);
        hdr.registry_off
            .store(layout.registry_off as u64, Ordering::Relaxed);
        hdr.segment_len.store(layout.total as u64, Ordering::Relaxed);

        let region = Self::attach(seg)?;
        let lock = region.slot_raw(0)?;
        lock.assign(MutexTag::MutexRegion, MutexFlags::NONE, std::process::id());
        B::init(&lock.state, MutexFlags::NONE).map_err(|errno| MutexError::InitFailed { errno })?;

        region.link_range(1, limits.mutex_init, 0)?;
        hdr.free_head.store(1, Ordering::Relaxed);
        hdr.free_count.store(limits.mutex_init, Ordering::Relaxed);
        hdr.slot_count.store(limits.mutex_init, Ordering::Relaxed);

        if layout.registry_len != 0 {
            Registry::create(seg, layout.registry_off as u64, limits.thread_count)?;
        }

        hdr.magic.store(REGION_MAGIC, Ordering::Release);
        Ok(region)
    }

    /// Validates a published region created by another handle or process.
    ///
    /// `stride` is the slot size the joiner computed from its own
    /// configuration; it must match the creator's.
    pub(crate) fn join(seg: &'a Segment, stride: usize) -> Result<Self, MutexError> {
        let hdr: &RegionHeader = seg.resolve(ShOff::new(0))?;
        if hdr.magic.load(Ordering::Acquire) != REGION_MAGIC {
            return Err(MutexError::LayoutMismatch { field: "magic" });
        }
        if hdr.version.load(Ordering::Relaxed) != REGION_VERSION {
            return Err(MutexError::LayoutMismatch { field: "version" });
        }
        if hdr.backend_id.load(Ordering::Relaxed) != B::ID {
            return Err(MutexError::LayoutMismatch { field: "backend" });
        }
        let align = hdr.align.load(Ordering::Relaxed) as usize;
        let stored = hdr.slot_size.load(Ordering::Relaxed) as usize;
        if !align.is_power_of_two() || slot_size::<B>(align) != stored || stride != stored {
            return Err(MutexError::LayoutMismatch { field: "slot size" });
        }
        if hdr.segment_len.load(Ordering::Relaxed) > seg.len() as u64 {
            return Err(MutexError::LayoutMismatch {
                field: "segment length",
            });
        }
        Self::attach(seg)
    }

    /// Cheap view over a region already validated by `create` or `join`.
    pub(crate) fn attach(seg: &'a Segment) -> Result<Self, MutexError> {
        let hdr: &RegionHeader = seg.resolve(ShOff::new(0))?;
        Ok(Self {
            seg,
            hdr,
            slot_off: ShOff::new(hdr.slot_off.load(Ordering::Relaxed)),
            slot_size: u64::from(hdr.slot_size.load(Ordering::Relaxed)),
        })
    }

    fn slot_raw(&self, index: u32) -> Result<&'a MutexSlot<B::State>, MutexError> {
        if index > self.slot_max() {
            return Err(MutexError::InvalidHandle { id: index });
        }
        self.seg
            .resolve(self.slot_off.index(u64::from(index), self.slot_size))
    }

    /// Slot behind a user handle; rejects 0 and handles past the current count.
    pub fn slot(&self, id: MutexId) -> Result<&'a MutexSlot<B::State>, MutexError> {
        if !id.is_valid() || id.raw() > self.slot_count() {
            return Err(MutexError::InvalidHandle { id: id.raw() });
        }
        self.slot_raw(id.raw())
    }

    #[must_use]
    pub fn slot_count(&self) -> u32 {
        self.hdr.slot_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn slot_max(&self) -> u32 {
        self.hdr.slot_max.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn spins(&self) -> u32 {
        self.hdr.tas_spins.load(Ordering::Relaxed).max(1)
    }

    pub fn set_spins(&self, spins: u32) {
        self.hdr.tas_spins.store(spins.max(1), Ordering::Relaxed);
    }

    #[must_use]
    pub fn panic_word(&self) -> &'a AtomicU32 {
        &self.hdr.panic
    }

    #[must_use]
    pub fn is_panicked(&self) -> bool {
        self.hdr.panic.load(Ordering::Acquire) != 0
    }

    /// Sets the panic word; returns false if it was already set.
    pub fn set_panic(&self) -> bool {
        self.hdr.panic.swap(1, Ordering::AcqRel) == 0
    }

    pub(crate) fn clear_magic(&self) {
        self.hdr.magic.store(0, Ordering::Release);
    }

    pub fn lock_region(&self) -> Result<RegionLocked<'a, B>, BackendError> {
        let lock = self
            .slot_raw(0)
            .map_err(|_| BackendError::Os(crate::errno::EINVAL))?;
        let cx = WaitContext {
            flags: MutexFlags::NONE,
            spins: self.spins(),
            panic: &self.hdr.panic,
        };
        let locked = RegionLocked::acquire(&lock.state, &cx)?;
        let counter = if locked.waited() {
            &self.hdr.region_wait
        } else {
            &self.hdr.region_nowait
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(locked)
    }

    // Links `first..=last` in ascending order, the last pointing at `tail`.
    fn link_range(&self, first: u32, last: u32, tail: u32) -> Result<(), MutexError> {
        for id in first..=last {
            let next = if id == last { tail } else { id + 1 };
            let slot = self.slot_raw(id)?;
            slot.hdr.next_free.store(next, Ordering::Relaxed);
            slot.hdr.flags.store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Pops the free-list head and marks it allocated.
    pub fn pop_free(&self, _locked: &RegionLocked<'_, B>) -> Result<Option<MutexId>, MutexError> {
        let head = self.hdr.free_head.load(Ordering::Relaxed);
        if head == 0 {
            return Ok(None);
        }
        let slot = self.slot_raw(head)?;
        self.hdr
            .free_head
            .store(slot.hdr.next_free.load(Ordering::Relaxed), Ordering::Relaxed);
        slot.hdr.next_free.store(0, Ordering::Relaxed);
        slot.set_flags(MutexFlags::ALLOCATED);

        self.hdr.free_count.fetch_sub(1, Ordering::Relaxed);
        let inuse = self.hdr.inuse.fetch_add(1, Ordering::Relaxed) + 1;
        self.hdr.inuse_max.fetch_max(inuse, Ordering::Relaxed);
        Ok(Some(MutexId::from_raw(head)))
    }

    /// Pushes `id` back as the new free-list head.
    pub fn push_free(&self, _locked: &RegionLocked<'_, B>, id: MutexId) -> Result<(), MutexError> {
        let slot = self.slot(id)?;
        slot.hdr.flags.store(0, Ordering::Release);
        slot.hdr.tag.store(0, Ordering::Relaxed);
        slot.hdr.alloc_pid.store(0, Ordering::Relaxed);
        slot.hdr
            .next_free
            .store(self.hdr.free_head.load(Ordering::Relaxed), Ordering::Relaxed);
        self.hdr.free_head.store(id.raw(), Ordering::Relaxed);
        self.hdr.free_count.fetch_add(1, Ordering::Relaxed);
        self.hdr.inuse.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Links the next increment of reserved slots into the free list.
    ///
    /// The step is the configured increment, or half the current count (at
    /// least [`MIN_INCREMENT`]), clamped to the remaining reservation.
    pub fn grow(&self, _locked: &RegionLocked<'_, B>) -> Result<Option<Growth>, MutexError> {
        let count = self.slot_count();
        let max = self.slot_max();
        if count >= max {
            return Ok(None);
        }
        let step = match self.hdr.increment.load(Ordering::Relaxed) {
            0 => (count / 2).max(MIN_INCREMENT),
            n => n,
        }
        .min(max - count);

        let to = count + step;
        self.link_range(count + 1, to, self.hdr.free_head.load(Ordering::Relaxed))?;
        self.hdr.free_head.store(count + 1, Ordering::Relaxed);
        self.hdr.free_count.fetch_add(step, Ordering::Relaxed);
        self.hdr.slot_count.store(to, Ordering::Release);
        Ok(Some(Growth { from: count, to }))
    }

    /// Free-list contents from head to tail.
    pub fn free_list(&self, _locked: &RegionLocked<'_, B>) -> Result<Vec<MutexId>, MutexError> {
        let mut out = Vec::new();
        let mut link = self.hdr.free_head.load(Ordering::Relaxed);
        while link != 0 {
            if out.len() > self.slot_count() as usize {
                return Err(MutexError::LayoutMismatch {
                    field: "free list cycle",
                });
            }
            out.push(MutexId::from_raw(link));
            link = self.slot(MutexId::from_raw(link))?
                .hdr
                .next_free
                .load(Ordering::Relaxed);
        }
        Ok(out)
    }

    pub fn registry(&self) -> Result<Option<Registry<'a>>, MutexError> {
        match self.hdr.registry_off.load(Ordering::Relaxed) {
            0 => Ok(None),
            off => Registry::attach(self.seg, off).map(Some),
        }
    }

    pub fn clear_stats(&self, _locked: &RegionLocked<'_, B>) -> Result<(), MutexError> {
        self.hdr
            .inuse_max
            .store(self.hdr.inuse.load(Ordering::Relaxed), Ordering::Relaxed);
        self.hdr.region_wait.store(0, Ordering::Relaxed);
        self.hdr.region_nowait.store(0, Ordering::Relaxed);
        for raw in 1..=self.slot_count() {
            let slot = self.slot_raw(raw)?;
            slot.hdr.wait.store(0, Ordering::Relaxed);
            slot.hdr.nowait.store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<RegionStats, MutexError> {
        let (thread_max, thread_count) = match self.registry()? {
            Some(reg) => (reg.max(), reg.count()),
            None => (0, 0),
        };
        Ok(RegionStats {
            backend: B::NAME,
            align: self.hdr.align.load(Ordering::Relaxed),
            tas_spins: self.spins(),
            mutex_init: self.hdr.slot_init.load(Ordering::Relaxed),
            mutex_count: self.slot_count(),
            mutex_max: self.slot_max(),
            mutex_free: self.hdr.free_count.load(Ordering::Relaxed),
            mutex_inuse: self.hdr.inuse.load(Ordering::Relaxed),
            mutex_inuse_max: self.hdr.inuse_max.load(Ordering::Relaxed),
            region_wait: self.hdr.region_wait.load(Ordering::Relaxed),
            region_nowait: self.hdr.region_nowait.load(Ordering::Relaxed),
            region_size: self.hdr.segment_len.load(Ordering::Relaxed),
            thread_max,
            thread_count,
        })
    }

    /// Destroys the region lock; the region is unusable afterwards.
    pub(crate) fn destroy_region_lock(&self) -> Result<(), i32> {
        let lock = self.slot_raw(0).map_err(|e| e.errno())?;
        B::destroy(&lock.state)
    }
}
