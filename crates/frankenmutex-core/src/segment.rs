//! Memory segments that hold a mutex region.
//!
//! A segment is a contiguous, zero-initialized byte range that one or more
//! processes map, possibly at different base addresses. Nothing stored inside
//! a segment is a pointer: structures refer to each other through [`ShOff`]
//! offsets that each process resolves against its own mapping base.
//!
//! Only types implementing [`ShmSafe`] may be resolved. Those are `repr(C)`
//! aggregates of atomics (or of OS primitives wrapped in `UnsafeCell`) for
//! which the all-zero bit pattern is a valid value, so a freshly mapped
//! segment never exposes an invalid object.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64};

use crate::error::MutexError;

/// Base alignment of every segment. Region alignment overrides may not exceed it.
pub const SEGMENT_ALIGN: usize = 4096;

/// Marker for types that may live inside a shared segment.
///
/// # Safety
///
/// Implementors must be `repr(C)` (or `repr(transparent)`), valid when all
/// bytes are zero, contain no pointers, and be mutated only through interior
/// mutability that is sound across threads and processes.
pub unsafe trait ShmSafe: Sync {}

// SAFETY: atomics are zero-valid, pointer-free and internally synchronized.
unsafe impl ShmSafe for AtomicU32 {}
// SAFETY: as above.
unsafe impl ShmSafe for AtomicU64 {}

/// Typed byte offset from the start of a segment.
#[repr(transparent)]
pub struct ShOff<T> {
    raw: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ShOff<T> {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.raw
    }

    /// Offset of the `index`-th element of an array of `stride`-byte elements
    /// starting at `self`.
    #[must_use]
    pub const fn index(self, index: u64, stride: u64) -> Self {
        Self::new(self.raw + index * stride)
    }
}

impl<T> Clone for ShOff<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ShOff<T> {}

impl<T> std::fmt::Debug for ShOff<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShOff({:#x})", self.raw)
    }
}

impl<T> PartialEq for ShOff<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for ShOff<T> {}

enum Backing {
    Heap(Layout),
    #[cfg(unix)]
    Mapped,
}

/// A mapped (or heap-allocated) region of memory.
pub struct Segment {
    base: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// SAFETY: the segment owns its mapping; all access to its contents goes
// through `ShmSafe` types, which are `Sync` and internally synchronized.
unsafe impl Send for Segment {}
// SAFETY: as above.
unsafe impl Sync for Segment {}

impl Segment {
    /// Process-private segment backed by the heap.
    pub fn private(len: usize) -> Result<Self, MutexError> {
        if len == 0 {
            return Err(MutexError::InvalidConfig("segment length must be non-zero"));
        }
        let layout = Layout::from_size_align(len, SEGMENT_ALIGN)
            .map_err(|_| MutexError::InvalidConfig("segment length overflows"))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or_else(|| {
            MutexError::Io(std::io::Error::from(std::io::ErrorKind::OutOfMemory))
        })?;
        Ok(Self {
            base,
            len,
            backing: Backing::Heap(layout),
        })
    }

    /// Anonymous shared mapping, inherited by children across `fork`.
    #[cfg(unix)]
    pub fn shared_anonymous(len: usize) -> Result<Self, MutexError> {
        if len == 0 {
            return Err(MutexError::InvalidConfig("segment length must be non-zero"));
        }
        // SAFETY: anonymous mapping request with no fixed address.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        Self::from_mmap(raw, len)
    }

    /// Maps `path` shared read/write, growing the file to `len` bytes if it is
    /// shorter. Every process that maps the same file sees the same region.
    #[cfg(unix)]
    pub fn open_file(path: &std::path::Path, len: usize) -> Result<Self, MutexError> {
        use std::os::fd::AsRawFd;

        if len == 0 {
            return Err(MutexError::InvalidConfig("segment length must be non-zero"));
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }
        // SAFETY: fd is open read/write and the file is at least `len` bytes.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        // The mapping keeps the file contents alive after `file` closes.
        Self::from_mmap(raw, len)
    }

    #[cfg(unix)]
    fn from_mmap(raw: *mut libc::c_void, len: usize) -> Result<Self, MutexError> {
        if raw == libc::MAP_FAILED {
            return Err(MutexError::Io(std::io::Error::last_os_error()));
        }
        let base = NonNull::new(raw.cast::<u8>())
            .ok_or(MutexError::InvalidConfig("mmap returned a null mapping"))?;
        Ok(Self {
            base,
            len,
            backing: Backing::Mapped,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address this process mapped the segment at. Diagnostics only: never
    /// store it inside the segment.
    #[must_use]
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Resolves `off` to a reference valid for the lifetime of the mapping.
    pub fn resolve<T: ShmSafe>(&self, off: ShOff<T>) -> Result<&T, MutexError> {
        let start = usize::try_from(off.raw)
            .map_err(|_| MutexError::LayoutMismatch { field: "offset" })?;
        let end = start
            .checked_add(size_of::<T>())
            .ok_or(MutexError::LayoutMismatch { field: "offset" })?;
        if end > self.len {
            return Err(MutexError::LayoutMismatch {
                field: "offset out of segment",
            });
        }
        // SAFETY: `start + size_of::<T>() <= len`, so the pointer stays in the mapping.
        let ptr = unsafe { self.base.as_ptr().add(start) };
        if !(ptr as usize).is_multiple_of(align_of::<T>()) {
            return Err(MutexError::LayoutMismatch {
                field: "misaligned offset",
            });
        }
        // SAFETY: in bounds, aligned, and `T: ShmSafe` is valid for any bit
        // pattern reachable in the segment (zeroed or written through `T`).
        Ok(unsafe { &*ptr.cast::<T>() })
    }

    /// Zeroes `[start, start + len)`.
    ///
    /// # Safety
    ///
    /// No other thread or process may access the range concurrently, and no
    /// reference previously returned by [`Segment::resolve`] into the range
    /// may be used while the write is in progress.
    pub(crate) unsafe fn zero_range(&self, start: usize, len: usize) -> Result<(), MutexError> {
        let end = start
            .checked_add(len)
            .ok_or(MutexError::LayoutMismatch { field: "zero range" })?;
        if end > self.len {
            return Err(MutexError::LayoutMismatch { field: "zero range" });
        }
        // SAFETY: bounds checked above; exclusivity is the caller's contract.
        unsafe { std::ptr::write_bytes(self.base.as_ptr().add(start), 0, len) };
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        match self.backing {
            // SAFETY: allocated in `private` with exactly this layout.
            Backing::Heap(layout) => unsafe { std::alloc::dealloc(self.base.as_ptr(), layout) },
            #[cfg(unix)]
            Backing::Mapped => {
                // SAFETY: mapping created by `from_mmap` with this length.
                let _ = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
            }
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("base", &format_args!("{:#x}", self.base_addr()))
            .field("len", &self.len)
            .finish()
    }
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
