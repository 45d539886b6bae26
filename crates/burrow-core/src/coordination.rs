//! # Suspend Coordination
//!
//! Makes "stop the target, mutate several things, restart it" composable
//! across nested and concurrent callers.
//!
//! ## State machine
//!
//! ```text
//! Running       --suspend--> Suspended(1)    real OS stop
//! Suspended(N)  --suspend--> Suspended(N+1)
//! Suspended(N)  --resume---> Suspended(N-1)  for N > 1
//! Suspended(1)  --resume---> Running         real OS continue
//! any           --force----> Running         real OS continue if it was suspended
//! ```
//!
//! The target is stopped for the union of all outstanding suspend requests:
//! one caller releasing its scope never resumes the target while another
//! still holds one.
//!
//! [`SuspendCounter`] is the pure state machine. Its two-step
//! `plan_*`/`commit` API lets the owner perform the OS call between planning
//! and committing, so a failed stop or continue leaves the depth untouched.
//! [`Process`](crate::process::Process) holds the counter under a mutex that
//! stays locked across the OS call, which serializes transitions.
//!
//! [`SuspendGuard`] is the scoped token handed to callers.
//!
//! ## Caller-side races
//!
//! The core serializes suspend/resume transitions only. Two caller threads
//! mutating the same remote structure must coordinate between themselves;
//! holding a suspend scope stops the target, not other callers.

use std::fmt;

use tracing::warn;

use crate::error::{BurrowError, Result};

/// Run state of an attached target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState
{
    /// Executing normally
    Running,
    /// Stopped, with the number of outstanding suspend requests (always ≥ 1)
    Suspended(u32),
}

impl RunState
{
    /// `true` if the target is stopped.
    pub fn is_suspended(self) -> bool
    {
        matches!(self, RunState::Suspended(_))
    }
}

impl fmt::Display for RunState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            RunState::Running => f.write_str("running"),
            RunState::Suspended(depth) => write!(f, "suspended (depth {depth})"),
        }
    }
}

/// What a planned transition requires from the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition
{
    /// 0 → 1: stop the target
    Stop,
    /// N → N+1: nothing to do
    Nest,
    /// N → N-1 with N > 1: nothing to do
    Unnest,
    /// 1 → 0: continue the target
    Continue,
}

impl Transition
{
    /// `true` if the OS has to be involved.
    pub fn needs_os_call(self) -> bool
    {
        matches!(self, Transition::Stop | Transition::Continue)
    }
}

/// Nesting depth of suspend requests
///
/// ```rust
/// use burrow_core::coordination::{RunState, SuspendCounter, Transition};
///
/// let mut counter = SuspendCounter::new();
/// let first = counter.plan_suspend();
/// assert_eq!(first, Transition::Stop);
/// counter.commit(first);
///
/// let second = counter.plan_suspend();
/// assert_eq!(second, Transition::Nest);
/// counter.commit(second);
/// assert_eq!(counter.state(), RunState::Suspended(2));
///
/// let back = counter.plan_resume()?;
/// assert_eq!(back, Transition::Unnest);
/// counter.commit(back);
/// # Ok::<(), burrow_core::BurrowError>(())
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuspendCounter
{
    depth: u32,
}

impl SuspendCounter
{
    /// Counter for a running target
    pub const fn new() -> Self
    {
        Self { depth: 0 }
    }

    /// Current nesting depth
    pub fn depth(&self) -> u32
    {
        self.depth
    }

    /// Current state
    pub fn state(&self) -> RunState
    {
        if self.depth == 0 {
            RunState::Running
        } else {
            RunState::Suspended(self.depth)
        }
    }

    /// Transition a suspend request would cause.
    pub fn plan_suspend(&self) -> Transition
    {
        if self.depth == 0 {
            Transition::Stop
        } else {
            Transition::Nest
        }
    }

    /// Transition a resume request would cause.
    ///
    /// ## Errors
    ///
    /// `NotSuspended` if the depth is already zero.
    pub fn plan_resume(&self) -> Result<Transition>
    {
        match self.depth {
            0 => Err(BurrowError::NotSuspended),
            1 => Ok(Transition::Continue),
            _ => Ok(Transition::Unnest),
        }
    }

    /// Apply a planned transition once its OS call (if any) succeeded.
    pub fn commit(&mut self, transition: Transition)
    {
        match transition {
            Transition::Stop | Transition::Nest => self.depth = self.depth.saturating_add(1),
            Transition::Unnest | Transition::Continue => self.depth = self.depth.saturating_sub(1),
        }
    }

    /// Drop every outstanding request.
    ///
    /// Returns `true` if the target was suspended and needs a real continue.
    pub fn force(&mut self) -> bool
    {
        let was_suspended = self.depth > 0;
        self.depth = 0;
        was_suspended
    }
}

/// Something that can be suspended and resumed with nesting semantics
pub trait Suspendable
{
    /// Add one suspend request.
    fn suspend(&self) -> Result<()>;

    /// Remove one suspend request.
    fn resume(&self) -> Result<()>;
}

/// Scoped suspend token
///
/// Created by [`SuspendGuard::new`] (or
/// [`Process::suspend_scope`](crate::process::Process::suspend_scope)). Holds
/// one suspend request and gives it back on drop. Drop cannot report errors,
/// so a failed resume there is only logged; call [`SuspendGuard::release`] to
/// see it.
#[must_use = "the target resumes as soon as the guard is dropped"]
pub struct SuspendGuard<'a>
{
    target: &'a dyn Suspendable,
    active: bool,
}

impl<'a> SuspendGuard<'a>
{
    /// Suspend `target` for the lifetime of the guard.
    ///
    /// ## Errors
    ///
    /// Whatever `target.suspend()` returns; no guard exists in that case.
    pub fn new(target: &'a dyn Suspendable) -> Result<Self>
    {
        target.suspend()?;
        Ok(Self { target, active: true })
    }

    /// Give the suspend request back now and report the outcome.
    pub fn release(mut self) -> Result<()>
    {
        self.active = false;
        self.target.resume()
    }
}

impl fmt::Debug for SuspendGuard<'_>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("SuspendGuard").field("active", &self.active).finish()
    }
}

impl Drop for SuspendGuard<'_>
{
    fn drop(&mut self)
    {
        if self.active {
            self.active = false;
            if let Err(e) = self.target.resume() {
                warn!(error = %e, "failed to resume target when suspend scope ended");
            }
        }
    }
}

#[cfg(test)]
mod tests
{
    use std::sync::Mutex;

    use super::*;

    /// Counter plus a log of OS-level calls
    #[derive(Default)]
    struct Recorder
    {
        inner: Mutex<(SuspendCounter, Vec<&'static str>)>,
    }

    impl Suspendable for Recorder
    {
        fn suspend(&self) -> Result<()>
        {
            let mut inner = self.inner.lock().unwrap();
            let transition = inner.0.plan_suspend();
            if transition == Transition::Stop {
                inner.1.push("stop");
            }
            inner.0.commit(transition);
            Ok(())
        }

        fn resume(&self) -> Result<()>
        {
            let mut inner = self.inner.lock().unwrap();
            let transition = inner.0.plan_resume()?;
            if transition == Transition::Continue {
                inner.1.push("cont");
            }
            inner.0.commit(transition);
            Ok(())
        }
    }

    #[test]
    fn os_state_tracks_depth()
    {
        let mut counter = SuspendCounter::new();
        let mut os_stopped = false;

        // suspend, suspend, resume -> still suspended
        for step in ["s", "s", "r"] {
            let transition = if step == "s" {
                counter.plan_suspend()
            } else {
                counter.plan_resume().unwrap()
            };
            match transition {
                Transition::Stop => os_stopped = true,
                Transition::Continue => os_stopped = false,
                Transition::Nest | Transition::Unnest => {}
            }
            counter.commit(transition);
            assert_eq!(os_stopped, counter.depth() > 0);
        }
        assert_eq!(counter.state(), RunState::Suspended(1));

        // resume, resume -> running, then a caller error
        let last = counter.plan_resume().unwrap();
        assert_eq!(last, Transition::Continue);
        counter.commit(last);
        assert_eq!(counter.state(), RunState::Running);
        assert!(matches!(counter.plan_resume(), Err(BurrowError::NotSuspended)));
    }

    #[test]
    fn uncommitted_plans_change_nothing()
    {
        let counter = SuspendCounter::new();
        assert_eq!(counter.plan_suspend(), Transition::Stop);
        assert_eq!(counter.plan_suspend(), Transition::Stop);
        assert_eq!(counter.depth(), 0);
    }

    #[test]
    fn force_reports_whether_continue_is_needed()
    {
        let mut counter = SuspendCounter::new();
        assert!(!counter.force());
        counter.commit(counter.plan_suspend());
        counter.commit(counter.plan_suspend());
        assert!(counter.force());
        assert_eq!(counter.state(), RunState::Running);
    }

    #[test]
    fn nested_guards_stop_once()
    {
        let recorder = Recorder::default();
        {
            let _outer = SuspendGuard::new(&recorder).unwrap();
            {
                let _inner = SuspendGuard::new(&recorder).unwrap();
            }
            assert_eq!(recorder.inner.lock().unwrap().0.depth(), 1);
        }
        let inner = recorder.inner.lock().unwrap();
        assert_eq!(inner.1, vec!["stop", "cont"]);
        assert_eq!(inner.0.state(), RunState::Running);
    }

    #[test]
    fn explicit_release_reports_errors()
    {
        let recorder = Recorder::default();
        let guard = SuspendGuard::new(&recorder).unwrap();
        guard.release().unwrap();
        assert_eq!(recorder.inner.lock().unwrap().0.depth(), 0);
        // the guard is consumed; nothing is resumed twice
        assert!(recorder.resume().is_err());
    }
}
