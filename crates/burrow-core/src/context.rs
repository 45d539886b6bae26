//! # Context
//!
//! The explicit owner of everything that would otherwise be a process-wide
//! singleton: the known version table and the set of targets attached through
//! it. Two contexts never share state, so tests and tools can create as many
//! as they like.
//!
//! ## Attaching
//!
//! 1. Resolve the [`TargetSelector`] to one PID (zero or several name matches
//!    are errors)
//! 2. Refuse a second concurrent attachment to the same PID
//! 3. Open the host backend
//! 4. Fingerprint the executable and pick the matching [`VersionInfo`]
//! 5. Rebase the descriptor's addresses to where the image is really mapped
//!
//! An unknown executable still attaches; only
//! [`Process::descriptor`](crate::process::Process::descriptor) fails.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::backend::{self, ProcessBackend};
use crate::descriptor::{VersionInfo, VersionTable};
use crate::error::{BurrowError, Result};
use crate::process::Process;
use crate::types::ProcessId;

type Registry = Arc<Mutex<HashSet<ProcessId>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashSet<ProcessId>>
{
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How to find the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector
{
    /// A known process ID
    Pid(ProcessId),
    /// An exact process or executable name; must match exactly one process
    Name(String),
}

impl From<ProcessId> for TargetSelector
{
    fn from(pid: ProcessId) -> Self
    {
        TargetSelector::Pid(pid)
    }
}

impl From<&str> for TargetSelector
{
    /// All-digit input is a PID, anything else a name.
    fn from(text: &str) -> Self
    {
        match text.parse::<u32>() {
            Ok(pid) => TargetSelector::Pid(ProcessId(pid)),
            Err(_) => TargetSelector::Name(text.to_string()),
        }
    }
}

impl fmt::Display for TargetSelector
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            TargetSelector::Pid(pid) => write!(f, "pid {pid}"),
            TargetSelector::Name(name) => write!(f, "'{name}'"),
        }
    }
}

/// Marks a PID as attached until dropped
#[derive(Debug)]
pub(crate) struct Registration
{
    pid: ProcessId,
    registry: Registry,
}

impl Drop for Registration
{
    fn drop(&mut self)
    {
        lock(&self.registry).remove(&self.pid);
    }
}

/// Version table plus the attachments made through it
#[derive(Debug, Default)]
pub struct Context
{
    versions: VersionTable,
    attached: Registry,
}

impl Context
{
    /// Context without any known versions.
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Context that identifies targets against `versions`.
    pub fn with_versions(versions: VersionTable) -> Self
    {
        Self {
            versions,
            attached: Registry::default(),
        }
    }

    /// Known versions
    pub fn versions(&self) -> &VersionTable
    {
        &self.versions
    }

    /// Add a version to the table used by later attaches.
    pub fn add_version(&mut self, info: VersionInfo)
    {
        self.versions.push(info);
    }

    /// `true` while a [`Process`] from this context holds `pid`.
    pub fn is_attached(&self, pid: ProcessId) -> bool
    {
        lock(&self.attached).contains(&pid)
    }

    /// PIDs currently attached through this context, sorted.
    pub fn attached_pids(&self) -> Vec<ProcessId>
    {
        let mut pids: Vec<_> = lock(&self.attached).iter().copied().collect();
        pids.sort();
        pids
    }

    /// Turn a selector into exactly one PID.
    ///
    /// ## Errors
    ///
    /// - `ProcessNotFound`: no process has that name
    /// - `AmbiguousTarget`: several do; the error lists them
    pub fn resolve(&self, selector: &TargetSelector) -> Result<ProcessId>
    {
        match selector {
            TargetSelector::Pid(pid) => Ok(*pid),
            TargetSelector::Name(name) => {
                let matches = backend::find_processes(name)?;
                match matches.as_slice() {
                    [] => Err(BurrowError::ProcessNotFound(name.clone())),
                    [only] => Ok(only.pid),
                    many => Err(BurrowError::AmbiguousTarget {
                        name: name.clone(),
                        pids: many.iter().map(|info| info.pid.0).collect(),
                    }),
                }
            }
        }
    }

    /// Attach to the process `selector` designates.
    ///
    /// ## Errors
    ///
    /// Selector resolution errors, `AlreadyAttached`, or attach errors from
    /// the host backend.
    pub fn attach(&self, selector: impl Into<TargetSelector>) -> Result<Process>
    {
        let selector = selector.into();
        let pid = self.resolve(&selector)?;
        let registration = self.register(pid)?;
        let backend = backend::open(pid)?;
        info!(%pid, target = %selector, "attached");
        Ok(self.identify(backend, registration))
    }

    /// Attach through an already opened backend.
    ///
    /// Used for simulated targets and for tools running inside the target.
    pub fn attach_backend(&self, backend: Box<dyn ProcessBackend>) -> Result<Process>
    {
        let registration = self.register(backend.pid())?;
        Ok(self.identify(backend, registration))
    }

    fn register(&self, pid: ProcessId) -> Result<Registration>
    {
        if !lock(&self.attached).insert(pid) {
            return Err(BurrowError::AlreadyAttached(pid.0));
        }
        Ok(Registration {
            pid,
            registry: Arc::clone(&self.attached),
        })
    }

    fn identify(&self, backend: Box<dyn ProcessBackend>, registration: Registration) -> Process
    {
        let fingerprint = match backend.fingerprint() {
            Ok(fingerprint) => Some(fingerprint),
            Err(e) => {
                warn!(pid = %backend.pid(), error = %e, "could not fingerprint target executable");
                None
            }
        };
        let process = Process::from_backend(backend).with_registration(registration);

        let mut descriptor = fingerprint
            .as_deref()
            .and_then(|fingerprint| self.versions.find_by_fingerprint(fingerprint))
            .cloned();

        match descriptor.as_mut() {
            Some(info) => {
                if info.base().is_some() {
                    match process.image_base() {
                        Ok(Some(base)) => {
                            let delta = info.rebase_to(base);
                            debug!(version = info.version(), delta, "rebased descriptor");
                        }
                        Ok(None) => debug!(version = info.version(), "image mapping not found; addresses left as declared"),
                        Err(e) => warn!(error = %e, "could not locate image base; addresses left as declared"),
                    }
                }
                info!(pid = %process.pid(), version = info.version(), "identified target version");
            }
            None => {
                debug!(pid = %process.pid(), fingerprint = fingerprint.as_deref().unwrap_or("-"), "no matching version");
            }
        }

        process.with_identity(fingerprint, descriptor)
    }
}
