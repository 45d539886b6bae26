//! Process, thread, and target-build identity types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

/// Process identifier (PID)
///
/// ## Example
///
/// ```rust
/// use burrow_core::types::ProcessId;
///
/// let pid = ProcessId::from(12345);
/// assert_eq!(u32::from(pid), 12345);
/// assert_eq!(pid.to_string(), "12345");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier
///
/// The representation is platform-specific:
///
/// - **Linux**: kernel TID from `/proc/<pid>/task`
/// - **macOS**: Mach thread port name
///
/// It is stored as a `u64` so the rest of the crate never sees the native type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Raw platform value.
    pub fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

/// Size of a pointer in the target process
///
/// A 64-bit host can inspect a 32-bit target, so every pointer-sized read in
/// the overlay layers goes through this instead of `usize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerWidth
{
    /// 32-bit target
    Four,
    /// 64-bit target
    Eight,
}

impl PointerWidth
{
    /// Width of the host process.
    pub const fn host() -> Self
    {
        if cfg!(target_pointer_width = "64") {
            PointerWidth::Eight
        } else {
            PointerWidth::Four
        }
    }

    /// Pointer size in bytes.
    pub const fn bytes(self) -> usize
    {
        match self {
            PointerWidth::Four => 4,
            PointerWidth::Eight => 8,
        }
    }
}

impl fmt::Display for PointerWidth
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}-bit", self.bytes() * 8)
    }
}

/// Operating system a target build was compiled for
///
/// Descriptor tables carry this so that layouts that differ between the
/// Windows and Unix builds of the game (strings, RTTI) can be chosen per build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOs
{
    /// Linux build (GNU toolchain)
    Linux,
    /// macOS build
    #[serde(alias = "darwin")]
    Macos,
    /// Windows build (MSVC toolchain)
    Windows,
}

impl TargetOs
{
    /// OS the host was compiled for, if it is one we model.
    pub const fn host() -> Option<Self>
    {
        if cfg!(target_os = "linux") {
            Some(TargetOs::Linux)
        } else if cfg!(target_os = "macos") {
            Some(TargetOs::Macos)
        } else if cfg!(target_os = "windows") {
            Some(TargetOs::Windows)
        } else {
            None
        }
    }
}

impl FromStr for TargetOs
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "linux" => Ok(TargetOs::Linux),
            "macos" | "darwin" | "osx" => Ok(TargetOs::Macos),
            "windows" | "win32" | "win64" => Ok(TargetOs::Windows),
            _ => Err(format!("Unknown target OS: {s}")),
        }
    }
}

impl fmt::Display for TargetOs
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            TargetOs::Linux => "linux",
            TargetOs::Macos => "macos",
            TargetOs::Windows => "windows",
        };
        f.write_str(name)
    }
}

/// One entry of a process enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo
{
    /// Process ID
    pub pid: ProcessId,
    /// Short process name (`comm` on Linux)
    pub name: String,
    /// Full path of the executable, when the OS lets us see it
    pub executable: Option<PathBuf>,
}
