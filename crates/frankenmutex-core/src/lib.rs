//! # frankenmutex-core
//!
//! Shared-memory mutex region for an embedded storage engine.
//!
//! A region lives in a [`Segment`] that one or more processes map. It holds
//! a fixed-stride array of mutex slots handed out by integer [`MutexId`], a
//! free list guarded by a region lock, and an optional thread-liveness
//! registry used by the failure checker to find state abandoned by dead
//! processes.
//!
//! ```no_run
//! use frankenmutex_core::{EnvConfig, MutexEnv, MutexFlags, MutexTag};
//!
//! let env: MutexEnv = MutexEnv::open_private(EnvConfig::new().with_mutex_init(16))?;
//! let id = env.alloc(MutexTag::Application, MutexFlags::NONE)?;
//! {
//!     let _held = env.guard(id)?;
//! }
//! env.free(id)?;
//! # Ok::<(), frankenmutex_core::MutexError>(())
//! ```
//!
//! `unsafe` is confined to the modules that touch raw memory or the OS:
//! [`segment`], [`region`] and the lock [`backend`]s.

#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod env;
pub mod errno;
pub mod error;
pub mod failchk;
pub mod log;
pub mod mutex;
pub mod region;
pub mod segment;
pub mod thread_registry;

pub use backend::{LockBackend, SelectedBackend};
pub use config::{ConsistencyMode, EnvConfig};
pub use env::{MutexEnv, SlotGuard, TrackedSection};
pub use error::MutexError;
pub use failchk::{FailchkParticipant, FailchkReport, Finding, LivenessProbe, OsLiveness};
pub use mutex::{MutexFlags, MutexId, MutexTag};
pub use region::{MutexStat, RegionStats};
pub use segment::Segment;
pub use thread_registry::{ThreadIdentity, ThreadState};
