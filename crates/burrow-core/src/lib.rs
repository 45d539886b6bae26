//! # burrow-core
//!
//! Live introspection of a running game process: attach by pid or name,
//! identify the build, and read or write its data structures through typed
//! overlays whose offsets come from a per-version table.
//!
//! This crate provides:
//! - Process attachment with identification against a [`VersionTable`]
//! - Nestable suspend/resume with guaranteed release ([`SuspendGuard`])
//! - Typed reads and writes over any [`MemoryAccess`] ([`TypedMemory`])
//! - Overlays for the runtime's strings, vectors and class names
//! - Virtual method hooks with chaining ([`HookRegistry`])
//!
//! ## Example
//!
//! ```rust
//! use burrow_core::descriptor::VersionInfo;
//! use burrow_core::memory_map::Permissions;
//! use burrow_core::overlay::{FieldView, TypedMemory};
//! use burrow_core::platform::mock::MockProcess;
//! use burrow_core::types::Address;
//! use burrow_core::Context;
//!
//! let target = MockProcess::builder(7)
//!     .region(0x1000, 0x100, Permissions::READ_WRITE, None)
//!     .fingerprint("ab12")
//!     .build();
//!
//! let mut info = VersionInfo::new("test build").with_fingerprint("ab12");
//! info.root_mut().group_mut("creature").set_offset("x_offset", 0x10);
//!
//! let mut context = Context::new();
//! context.add_version(info);
//! let process = context.attach_backend(Box::new(target))?;
//!
//! let creature = process.descriptor()?.group("creature")?;
//! let view = FieldView::new(&process, Address::new(0x1000), creature);
//! view.write::<u32>("x_offset", 0x2A)?;
//! assert_eq!(process.read_u32(Address::new(0x1010))?, 0x2A);
//! # Ok::<(), burrow_core::BurrowError>(())
//! ```
//!
//! ## Platform Support
//!
//! - **Linux**: procfs memory files and `SIGSTOP`/`SIGCONT`
//! - **macOS**: Mach task ports (`task_for_pid`, `task_suspend`, `mach_vm_*`)
//! - Everything else builds the overlays and the simulated target only
//!
//! ## Why unsafe code is needed
//!
//! Talking to another process means calling kernel interfaces (Mach traps,
//! `kill`, `mprotect`) and, for hooks, writing into our own read-only pages.
//! Those calls are wrapped in safe functions wherever the contract can be
//! checked; [`hook::patch_memory`] and [`hook::LocalMemory::new`] stay
//! `unsafe` because only the caller can vouch for the address.

#![allow(unsafe_code)] // Required for Mach, signals and page protection

pub mod backend;
pub mod container;
pub mod context;
pub mod coordination;
pub mod descriptor;
pub mod error;
pub mod hexdump;
pub mod hook;
pub mod memory_map;
pub mod overlay;
pub mod platform;
pub mod process;
pub mod types;

pub use container::RemoteVector;
pub use context::{Context, TargetSelector};
pub use coordination::{RunState, SuspendGuard, Suspendable};
pub use descriptor::{OffsetGroup, VersionInfo, VersionTable};
// Re-export commonly used types
pub use error::{BurrowError, Result};
pub use hook::{HookRegistry, VMethodHook};
pub use overlay::{FieldView, MemoryAccess, StringLayout, TypedMemory};
pub use process::Process;
pub use types::{Address, PointerWidth, ProcessId};
