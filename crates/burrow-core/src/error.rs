//! # Error Types
//!
//! Every fallible operation in the core returns [`BurrowError`].
//!
//! We use `thiserror` to derive the `Error` trait and the display strings.
//! The core never prints diagnostics itself; it hands these values back and
//! lets the consuming tool decide how to report them.
//!
//! ## Error Categories
//!
//! 1. **Attach errors**: `ProcessNotFound`, `AmbiguousTarget`, `PermissionDenied`,
//!    `AttachFailed`, `AlreadyAttached`, `TracedElsewhere`
//! 2. **Lifecycle errors**: `NotAttached`, `ProcessExited`, `SuspendFailed`,
//!    `ResumeFailed`, `NotSuspended`
//! 3. **Configuration errors**: `MissingDefinition`, `UnsetDefinition`,
//!    `InvalidDefinition`, `UnknownVersion`, `Config`
//! 4. **I/O errors**: `MemoryRead`, `MemoryWrite`, `Io`
//! 5. **Structural errors**: `CorruptContainer`, `IndexOutOfBounds`, `CapacityExceeded`
//! 6. **Hook errors**: `HookMismatch`, `HookFailed`

use std::fmt;

use thiserror::Error;

use crate::types::Address;

/// Which kind of descriptor entry a failed lookup asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinitionKind
{
    /// A nested group
    Group,
    /// A relative byte offset inside a structure
    Offset,
    /// An absolute address in the target image
    Address,
    /// An unsigned constant (thresholds, sizes, flags)
    HexValue,
    /// A free-form string value
    String,
}

impl fmt::Display for DefinitionKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            DefinitionKind::Group => "group",
            DefinitionKind::Offset => "offset",
            DefinitionKind::Address => "address",
            DefinitionKind::HexValue => "hex value",
            DefinitionKind::String => "string",
        };
        f.write_str(name)
    }
}

/// Main error type for burrow operations
///
/// Configuration variants always carry the fully-qualified group name and the
/// key that was looked up, so that "this build of the game is not supported"
/// can be diagnosed from the error alone.
#[derive(Error, Debug)]
pub enum BurrowError
{
    /// No running process matched the selector
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    /// More than one running process matched a name selector
    ///
    /// The caller has to pick one of the listed PIDs explicitly.
    #[error("Ambiguous target '{name}': matching PIDs {pids:?}")]
    AmbiguousTarget
    {
        /// The name that was searched for
        name: String,
        /// Every PID that matched
        pids: Vec<u32>,
    },

    /// The OS refused access to the target process
    ///
    /// On Linux this usually means `ptrace_scope` or a different owner; on macOS
    /// `task_for_pid()` needs root or the debugger entitlement.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Failed to attach to a process for a reason not covered by a more specific variant
    #[error("Failed to attach to process: {0}")]
    AttachFailed(String),

    /// This context already holds an attachment to the process
    #[error("Process {0} is already attached by this context")]
    AlreadyAttached(u32),

    /// Another debugger is already tracing the process
    #[error("Process {pid} is already traced by PID {tracer}")]
    TracedElsewhere
    {
        /// Target process
        pid: u32,
        /// The tracer reported by the OS
        tracer: u32,
    },

    /// The handle has been detached
    #[error("Not attached to a process")]
    NotAttached,

    /// The target process went away
    ///
    /// Once this is reported every further call on the same handle fails with
    /// it immediately instead of touching the OS again.
    #[error("Process {0} has exited")]
    ProcessExited(u32),

    /// Failed to stop the target process
    #[error("Failed to suspend process: {0}")]
    SuspendFailed(String),

    /// Failed to restart the target process
    #[error("Failed to resume process: {0}")]
    ResumeFailed(String),

    /// `resume()` was called while the suspend depth was already zero
    #[error("Resume called while the process is not suspended")]
    NotSuspended,

    /// A descriptor lookup named something the loaded table does not contain
    #[error("Missing {kind} definition: {group}{key}")]
    MissingDefinition
    {
        /// What kind of entry was requested
        kind: DefinitionKind,
        /// Fully-qualified group name, dot-terminated (`"creature."`)
        group: String,
        /// The requested key
        key: String,
    },

    /// The entry is declared but no value has been supplied for this build
    #[error("Unset {kind} definition: {group}{key}")]
    UnsetDefinition
    {
        /// What kind of entry was requested
        kind: DefinitionKind,
        /// Fully-qualified group name
        group: String,
        /// The requested key
        key: String,
    },

    /// The entry is explicitly marked as not existing in this build
    #[error("Invalid {kind} definition: {group}{key}")]
    InvalidDefinition
    {
        /// What kind of entry was requested
        kind: DefinitionKind,
        /// Fully-qualified group name
        group: String,
        /// The requested key
        key: String,
    },

    /// No version descriptor matches the target executable
    #[error("Unknown target version (fingerprint {0})")]
    UnknownVersion(String),

    /// A version table could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reading target memory failed
    ///
    /// Never papered over with zero-filled data: typed overlays sit on top of
    /// raw reads and a silently wrong value corrupts everything built on it.
    #[error("Failed to read {length} bytes at {address}: {details}")]
    MemoryRead
    {
        /// Start of the requested range
        address: Address,
        /// Requested byte count
        length: usize,
        /// OS-level reason
        details: String,
    },

    /// Writing target memory failed
    #[error("Failed to write {length} bytes at {address}: {details}")]
    MemoryWrite
    {
        /// Start of the requested range
        address: Address,
        /// Requested byte count
        length: usize,
        /// OS-level reason
        details: String,
    },

    /// A remote container header violates `begin <= end <= capacity_end`
    /// or its used span is not a multiple of the element size
    #[error("Corrupt container at {address}: {details}")]
    CorruptContainer
    {
        /// Address of the three-word header
        address: Address,
        /// Which invariant failed
        details: String,
    },

    /// Index past the end of a remote container
    #[error("Index {index} out of bounds (len {len})")]
    IndexOutOfBounds
    {
        /// Requested index
        index: usize,
        /// Current element count
        len: usize,
    },

    /// A write needs more room than the remote allocation provides
    ///
    /// The core never allocates inside the target process, so growth past the
    /// existing capacity is refused.
    #[error("Capacity exceeded: need {needed}, have {capacity}")]
    CapacityExceeded
    {
        /// Required element or byte count
        needed: usize,
        /// Available element or byte count
        capacity: usize,
    },

    /// A vtable slot did not hold the expected original function
    #[error("Hook mismatch at {slot}: expected 0x{expected:x}, found 0x{found:x}")]
    HookMismatch
    {
        /// Address of the vtable slot
        slot: Address,
        /// Function pointer the hook was built against
        expected: u64,
        /// Function pointer actually present
        found: u64,
    },

    /// Changing page protection or patching code failed
    #[error("Hook operation failed: {0}")]
    HookFailed(String),

    /// Invalid argument passed to a core function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The host platform has no backend for this operation
    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),

    /// I/O error from the host side (procfs, configuration files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BurrowError
{
    /// `true` for the descriptor lookup failures.
    pub fn is_definition_error(&self) -> bool
    {
        matches!(
            self,
            BurrowError::MissingDefinition { .. }
                | BurrowError::UnsetDefinition { .. }
                | BurrowError::InvalidDefinition { .. }
        )
    }

    /// `true` when the target process no longer exists.
    pub fn is_process_gone(&self) -> bool
    {
        matches!(self, BurrowError::ProcessExited(_))
    }
}

impl From<toml::de::Error> for BurrowError
{
    fn from(err: toml::de::Error) -> Self
    {
        BurrowError::Config(err.to_string())
    }
}

/// Convenience type alias for `Result<T, BurrowError>`
///
/// ```rust
/// use burrow_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, BurrowError>;
