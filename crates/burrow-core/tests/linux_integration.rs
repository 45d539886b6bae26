//! Integration tests for the Linux backend
//!
//! These tests require:
//! - Running on Linux (`#[cfg(target_os = "linux")]`)
//! - Permission to open `/proc/<pid>/mem` of a child process (the default
//!   with Yama `ptrace_scope` 0 or 1)
//! - A `sleep` binary on `PATH`
//!
//! Tests skip themselves when the environment refuses access.

#![cfg(target_os = "linux")]

use std::fs;
use std::process::{Child, Command};

use burrow_core::error::BurrowError;
use burrow_core::overlay::TypedMemory;
use burrow_core::types::ProcessId;
use burrow_core::{Context, Process, RunState, TargetSelector};

/// A `sleep` child that is killed when dropped
struct Sleeper(Child);

impl Sleeper
{
    fn spawn() -> Self
    {
        Self(Command::new("sleep").arg("30").spawn().expect("failed to spawn sleep"))
    }

    fn pid(&self) -> ProcessId
    {
        ProcessId(self.0.id())
    }
}

impl Drop for Sleeper
{
    fn drop(&mut self)
    {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn attach_or_skip(context: &Context, pid: ProcessId) -> Option<Process>
{
    match context.attach(pid) {
        Ok(process) => Some(process),
        Err(BurrowError::PermissionDenied(reason)) => {
            eprintln!("skipping: {reason}");
            None
        }
        Err(other) => panic!("attach failed: {other}"),
    }
}

fn task_state(pid: ProcessId) -> char
{
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).unwrap();
    let after_comm = &stat[stat.rfind(')').unwrap() + 1..];
    after_comm.trim_start().chars().next().unwrap()
}

#[test]
fn test_attach_suspend_read_detach()
{
    let child = Sleeper::spawn();
    let context = Context::new();
    let Some(process) = attach_or_skip(&context, child.pid()) else {
        return;
    };
    assert!(context.is_attached(child.pid()));
    assert!(process.fingerprint().is_some());
    // no versions loaded
    assert!(matches!(process.descriptor(), Err(BurrowError::UnknownVersion(_))));

    // may be a multi-call binary, so only the shape is checked
    assert!(process.executable().unwrap().is_absolute());
    let base = process.image_base().unwrap().expect("sleep has an image mapping");

    {
        let _scope = process.suspend_scope().unwrap();
        assert_eq!(process.run_state(), RunState::Suspended(1));
        assert_eq!(task_state(child.pid()), 'T');

        // every ELF image starts with its magic
        let magic = process.read_bytes(base, 4).unwrap();
        assert_eq!(magic, b"\x7fELF");
        assert_eq!(process.read_u32(base).unwrap(), u32::from_le_bytes(*b"\x7fELF"));
    }
    assert_eq!(process.run_state(), RunState::Running);
    assert_ne!(task_state(child.pid()), 'T');

    assert!(process.detach().unwrap());
    assert!(!process.detach().unwrap());
    assert!(!context.is_attached(child.pid()));
}

#[test]
fn test_regions_and_threads()
{
    let child = Sleeper::spawn();
    let context = Context::new();
    let Some(process) = attach_or_skip(&context, child.pid()) else {
        return;
    };

    let map = process.memory_map().unwrap();
    assert!(!map.is_empty());
    assert!(map.iter().any(|region| region.permissions.execute));
    assert!(map.iter().any(|region| region.kind == burrow_core::memory_map::RegionKind::Stack));

    let threads = process.threads().unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].raw(), u64::from(child.pid().0));
}

#[test]
fn test_second_attach_is_refused()
{
    let child = Sleeper::spawn();
    let context = Context::new();
    let Some(_process) = attach_or_skip(&context, child.pid()) else {
        return;
    };
    assert!(matches!(
        context.attach(TargetSelector::Pid(child.pid())),
        Err(BurrowError::AlreadyAttached(pid)) if pid == child.pid().0
    ));

    // a separate context is independent
    let other = Context::new();
    let second = other.attach(child.pid()).unwrap();
    assert!(second.detach().unwrap());
}

#[test]
fn test_exit_is_detected()
{
    let mut child = Sleeper::spawn();
    let context = Context::new();
    let Some(process) = attach_or_skip(&context, child.pid()) else {
        return;
    };

    child.0.kill().unwrap();
    child.0.wait().unwrap();

    assert!(!process.is_alive());
    assert!(process.suspend().unwrap_err().is_process_gone());
    assert!(process.detach().unwrap());
}

#[test]
fn test_unknown_pid()
{
    let context = Context::new();
    assert!(matches!(
        context.attach(ProcessId(u32::MAX - 1)),
        Err(BurrowError::ProcessNotFound(_))
    ));
}
