//! # Linux Backend
//!
//! Process access through procfs and job-control signals.
//!
//! ## How it works
//!
//! - **Memory**: `/proc/<pid>/mem` opened read-write, accessed with positional
//!   `pread`/`pwrite` so concurrent readers never share a file cursor.
//! - **Suspend**: `SIGSTOP` to the process, then poll every
//!   `/proc/<pid>/task/<tid>/stat` until each thread reports `T`. If that
//!   confirmation fails the stop is undone with `SIGCONT` before the error is
//!   returned. Resume is `SIGCONT`.
//! - **Ranges**: `/proc/<pid>/maps`, parsed by [`parse_proc_maps`].
//! - **Threads**: the entries of `/proc/<pid>/task`.
//! - **Pointer width**: the ELF class byte of `/proc/<pid>/exe`.
//!
//! `ptrace` is deliberately not used: a ptrace attachment belongs to the one
//! OS thread that made it, while a [`Process`](crate::process::Process) is
//! shared between caller threads.
//!
//! ## Permissions
//!
//! Opening `/proc/<pid>/mem` needs the same access check as `PTRACE_ATTACH`.
//! With Yama's `ptrace_scope = 1` (the default on most distributions) only a
//! parent may attach to its child unless the caller has `CAP_SYS_PTRACE`.
//!
//! ## References
//!
//! - [proc(5) man page](https://man7.org/linux/man-pages/man5/proc.5.html)
//! - [Yama LSM](https://www.kernel.org/doc/html/latest/admin-guide/LSM/Yama.html)

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::backend::ProcessBackend;
use crate::descriptor::fingerprint_file;
use crate::error::{BurrowError, Result};
use crate::memory_map::{parse_proc_maps, MemoryRegion};
use crate::types::{Address, PointerWidth, ProcessId, ProcessInfo, ThreadId};

/// How long `stop()` waits for every thread to report stopped
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll interval while waiting for threads to stop
const STOP_POLL: Duration = Duration::from_millis(1);

/// One look at the thread states after `SIGSTOP`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopProbe
{
    Stopped,
    Pending,
    Gone,
}

/// Poll `probe` until the target is stopped or `timeout` passes.
///
/// The stop signal has already been delivered when this runs. Any failure
/// other than the target exiting sends it `resume` before returning, so a
/// failed suspend never leaves the process frozen.
fn await_stop<P, C>(pid: ProcessId, timeout: Duration, mut probe: P, resume: C) -> Result<()>
where
    P: FnMut() -> Result<StopProbe>,
    C: FnOnce() -> Result<()>,
{
    let deadline = Instant::now() + timeout;
    let outcome = loop {
        match probe() {
            Ok(StopProbe::Stopped) => {
                trace!(%pid, "all threads stopped");
                return Ok(());
            }
            Ok(StopProbe::Gone) => return Err(BurrowError::ProcessExited(pid.0)),
            Ok(StopProbe::Pending) => {}
            Err(e) => break e,
        }
        if Instant::now() >= deadline {
            break BurrowError::SuspendFailed(format!("threads of {pid} did not stop within {timeout:?}"));
        }
        thread::sleep(STOP_POLL);
    };

    match resume() {
        Ok(()) => debug!(%pid, error = %outcome, "suspend failed, stop signal undone"),
        Err(e) => warn!(%pid, error = %e, "suspend failed and SIGCONT could not be delivered"),
    }
    Err(outcome)
}

/// A process opened through procfs
#[derive(Debug)]
pub struct LinuxProcess
{
    pid: ProcessId,
    mem: File,
    width: PointerWidth,
    exe: PathBuf,
}

impl LinuxProcess
{
    /// Open `pid` for inspection.
    ///
    /// ## Errors
    ///
    /// - `ProcessNotFound`: no such process
    /// - `TracedElsewhere`: another process holds a ptrace attachment
    /// - `PermissionDenied`: `/proc/<pid>/mem` cannot be opened for writing
    /// - `AttachFailed`: any other failure
    pub fn attach(pid: ProcessId) -> Result<Self>
    {
        let root = proc_path(pid, "");
        if !root.exists() {
            return Err(BurrowError::ProcessNotFound(format!("pid {pid}")));
        }

        let tracer = tracer_pid(pid)?;
        if tracer != 0 && tracer != std::process::id() {
            return Err(BurrowError::TracedElsewhere { pid: pid.0, tracer });
        }

        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .open(proc_path(pid, "mem"))
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => BurrowError::ProcessNotFound(format!("pid {pid}")),
                ErrorKind::PermissionDenied => BurrowError::PermissionDenied(format!(
                    "cannot open /proc/{pid}/mem ({e}); check /proc/sys/kernel/yama/ptrace_scope or run with CAP_SYS_PTRACE"
                )),
                _ => BurrowError::AttachFailed(format!("open /proc/{pid}/mem: {e}")),
            })?;

        let exe = fs::read_link(proc_path(pid, "exe"))
            .map_err(|e| BurrowError::AttachFailed(format!("read /proc/{pid}/exe: {e}")))?;
        let width = elf_pointer_width(&proc_path(pid, "exe")).unwrap_or_else(|e| {
            warn!(%pid, error = %e, "could not read ELF class, assuming host pointer width");
            PointerWidth::host()
        });

        debug!(%pid, exe = %exe.display(), %width, "opened process");
        Ok(Self { pid, mem, width, exe })
    }

    fn gone_or<F>(&self, fallback: F) -> BurrowError
    where
        F: FnOnce() -> BurrowError,
    {
        if self.is_alive() {
            fallback()
        } else {
            BurrowError::ProcessExited(self.pid.0)
        }
    }

    fn signal(&self, signal: libc::c_int) -> io::Result<()>
    {
        let pid = libc::pid_t::try_from(self.pid.0)
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: kill has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn all_threads_stopped(&self) -> Result<bool>
    {
        let threads = self.threads()?;
        if threads.is_empty() {
            return Ok(false);
        }
        for tid in threads {
            let stat = proc_path(self.pid, &format!("task/{}/stat", tid.raw()));
            match fs::read_to_string(&stat) {
                Ok(text) => {
                    if !matches!(stat_state(&text), Some('T' | 't')) {
                        return Ok(false);
                    }
                }
                // thread exited between listing and reading
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

impl ProcessBackend for LinuxProcess
{
    fn pid(&self) -> ProcessId
    {
        self.pid
    }

    fn pointer_width(&self) -> PointerWidth
    {
        self.width
    }

    fn is_alive(&self) -> bool
    {
        match fs::read_to_string(proc_path(self.pid, "stat")) {
            Ok(text) => !matches!(stat_state(&text), Some('Z' | 'X') | None),
            Err(_) => false,
        }
    }

    fn stop(&self) -> Result<()>
    {
        self.signal(libc::SIGSTOP).map_err(|e| match e.raw_os_error() {
            Some(libc::ESRCH) => BurrowError::ProcessExited(self.pid.0),
            Some(libc::EPERM) => BurrowError::PermissionDenied(format!("SIGSTOP to {}: {e}", self.pid)),
            _ => BurrowError::SuspendFailed(format!("SIGSTOP to {}: {e}", self.pid)),
        })?;

        await_stop(
            self.pid,
            STOP_TIMEOUT,
            || {
                if !self.is_alive() {
                    return Ok(StopProbe::Gone);
                }
                Ok(if self.all_threads_stopped()? {
                    StopProbe::Stopped
                } else {
                    StopProbe::Pending
                })
            },
            || self.cont(),
        )
    }

    fn cont(&self) -> Result<()>
    {
        self.signal(libc::SIGCONT).map_err(|e| match e.raw_os_error() {
            Some(libc::ESRCH) => BurrowError::ProcessExited(self.pid.0),
            _ => BurrowError::ResumeFailed(format!("SIGCONT to {}: {e}", self.pid)),
        })
    }

    fn read_into(&self, address: Address, buffer: &mut [u8]) -> Result<()>
    {
        if buffer.is_empty() {
            return Ok(());
        }
        let length = buffer.len();
        trace!(pid = %self.pid, %address, length, "read");
        self.mem.read_exact_at(buffer, address.value()).map_err(|e| {
            self.gone_or(|| BurrowError::MemoryRead {
                address,
                length,
                details: e.to_string(),
            })
        })
    }

    fn write_from(&self, address: Address, data: &[u8]) -> Result<()>
    {
        if data.is_empty() {
            return Ok(());
        }
        trace!(pid = %self.pid, %address, length = data.len(), "write");
        self.mem.write_all_at(data, address.value()).map_err(|e| {
            self.gone_or(|| BurrowError::MemoryWrite {
                address,
                length: data.len(),
                details: e.to_string(),
            })
        })
    }

    fn memory_regions(&self) -> Result<Vec<MemoryRegion>>
    {
        match fs::read_to_string(proc_path(self.pid, "maps")) {
            Ok(text) => Ok(parse_proc_maps(&text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BurrowError::ProcessExited(self.pid.0)),
            Err(e) => Err(e.into()),
        }
    }

    fn threads(&self) -> Result<Vec<ThreadId>>
    {
        let entries = match fs::read_dir(proc_path(self.pid, "task")) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(BurrowError::ProcessExited(self.pid.0)),
            Err(e) => return Err(e.into()),
        };
        let mut threads: Vec<ThreadId> = entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u64>().ok())
            .map(ThreadId)
            .collect();
        threads.sort_unstable();
        Ok(threads)
    }

    fn executable(&self) -> Result<PathBuf>
    {
        Ok(self.exe.clone())
    }

    fn fingerprint(&self) -> Result<String>
    {
        // /proc/<pid>/exe still opens the mapped image if the file was replaced on disk
        fingerprint_file(&proc_path(self.pid, "exe"))
    }
}

/// Enumerate `/proc`.
pub fn list_processes() -> Result<Vec<ProcessInfo>>
{
    let mut processes = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
            continue;
        };
        let pid = ProcessId(pid);
        // processes can vanish while we look
        let Ok(comm) = fs::read_to_string(proc_path(pid, "comm")) else {
            continue;
        };
        processes.push(ProcessInfo {
            pid,
            name: comm.trim_end_matches('\n').to_string(),
            executable: fs::read_link(proc_path(pid, "exe")).ok(),
        });
    }
    processes.sort_by_key(|info| info.pid);
    Ok(processes)
}

fn proc_path(pid: ProcessId, leaf: &str) -> PathBuf
{
    let mut path = PathBuf::from(format!("/proc/{}", pid.0));
    if !leaf.is_empty() {
        path.push(leaf);
    }
    path
}

/// `TracerPid` from `/proc/<pid>/status`.
fn tracer_pid(pid: ProcessId) -> Result<u32>
{
    let status = fs::read_to_string(proc_path(pid, "status")).map_err(|e| match e.kind() {
        ErrorKind::NotFound => BurrowError::ProcessNotFound(format!("pid {pid}")),
        _ => BurrowError::AttachFailed(format!("read /proc/{pid}/status: {e}")),
    })?;
    Ok(parse_tracer_pid(&status).unwrap_or(0))
}

fn parse_tracer_pid(status: &str) -> Option<u32>
{
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

/// State letter of a `stat` line.
///
/// The command name is parenthesised and may itself contain `)` and spaces,
/// so the state is found after the last `)`.
fn stat_state(stat: &str) -> Option<char>
{
    let after = &stat[stat.rfind(')')? + 1..];
    after.trim_start().chars().next()
}

fn elf_pointer_width(path: &Path) -> Result<PointerWidth>
{
    let mut ident = [0u8; 5];
    File::open(path)?.read_exact(&mut ident)?;
    if &ident[..4] != b"\x7fELF" {
        return Err(BurrowError::AttachFailed(format!("{} is not an ELF image", path.display())));
    }
    match ident[4] {
        1 => Ok(PointerWidth::Four),
        2 => Ok(PointerWidth::Eight),
        class => Err(BurrowError::AttachFailed(format!("unknown ELF class {class}"))),
    }
}
