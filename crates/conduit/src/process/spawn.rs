//! Process spawning
//!
//! A [`SpawnRequest`] describes a process completely: absolute executable
//! path, arguments, environment, working directory, and the exact set of
//! descriptors it receives. A [`SpawnBackend`] turns a request into a
//! running OS process. Core logic never names the backend it runs on.
//!
//! The shipped backend, [`ForkExecBackend`], forks and then performs only
//! async-signal-safe system calls in the child, on data prepared before the
//! fork. Failures in the child travel back through a close-on-exec error
//! pipe as a fixed-size record; end-of-file on that pipe means `execve`
//! succeeded.

use std::ffi::{CString, OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::libc;
use nix::sys::resource::{getrlimit, Resource};
use nix::unistd::{fork, ForkResult};
use tracing::debug;

use super::ProcessId;
use crate::error::SpawnError;
use crate::fd::{duplicate, Pipe};

// ============================================================================
// Descriptor Mapping
// ============================================================================

/// Descriptors a child receives, keyed by the number it sees them under.
///
/// Every source is duplicated on insertion, so a mapping owns its
/// descriptors and the caller's copies may be closed independently.
#[derive(Debug, Default)]
pub struct FileDescriptorMapping {
    entries: Vec<(OwnedFd, RawFd)>,
}

impl FileDescriptorMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `source` to descriptor number `target` in the child.
    ///
    /// Mapping a target twice replaces the earlier source.
    pub fn add(&mut self, source: BorrowedFd<'_>, target: RawFd) -> Result<(), SpawnError> {
        if target < 0 {
            return Err(SpawnError::invalid_parameter(
                target.to_string(),
                "target descriptor must not be negative",
            ));
        }
        let source = duplicate(source).map_err(|error| SpawnError::Syscall {
            call: "fcntl(F_DUPFD_CLOEXEC)",
            file: file!(),
            line: line!(),
            return_value: -1,
            errno: io_errno(&error),
        })?;
        self.entries.retain(|(_, existing)| *existing != target);
        self.entries.push((source, target));
        Ok(())
    }

    /// Target descriptor numbers, in insertion order.
    pub fn targets(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.entries.iter().map(|(_, target)| *target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Spawn Request
// ============================================================================

/// Everything needed to start a process.
#[derive(Debug)]
pub struct SpawnRequest {
    /// Absolute path of the executable. Never searched for.
    pub executable: PathBuf,
    /// Arguments, not including `argv[0]` (which is the executable path).
    pub arguments: Vec<OsString>,
    /// `KEY=VALUE` entries, in order.
    pub environment: Vec<OsString>,
    pub directory: PathBuf,
    pub descriptors: FileDescriptorMapping,
}

impl SpawnRequest {
    pub fn new(executable: impl Into<PathBuf>, directory: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            arguments: Vec::new(),
            environment: Vec::new(),
            directory: directory.into(),
            descriptors: FileDescriptorMapping::new(),
        }
    }
}

/// Platform mechanism for starting a process.
///
/// `spawn` blocks the calling thread until the child has either reached
/// `execve` or failed before it; callers run it on the blocking pool.
pub trait SpawnBackend: fmt::Debug + Send + Sync {
    fn spawn(&self, request: SpawnRequest) -> Result<ProcessId, SpawnError>;
}

// ============================================================================
// Fork/Exec Backend
// ============================================================================

/// Spawns with `fork` followed by `execve`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForkExecBackend;

impl SpawnBackend for ForkExecBackend {
    fn spawn(&self, request: SpawnRequest) -> Result<ProcessId, SpawnError> {
        let prepared = Prepared::new(&request)?;
        let (error_reader, error_writer) = Pipe::new()
            .map_err(|error| syscall_error("pipe", line!(), &error))?
            .into_parts();

        // SAFETY: the child branch only calls async-signal-safe functions on
        // memory prepared above, and never returns.
        let fork_result = unsafe { fork() }.map_err(|errno| SpawnError::Syscall {
            call: "fork",
            file: file!(),
            line: line!(),
            return_value: -1,
            errno,
        })?;

        match fork_result {
            ForkResult::Child => unsafe { prepared.exec_child(error_writer.as_raw_fd()) },
            ForkResult::Parent { child } => {
                drop(error_writer);
                // The request's descriptor copies must close in the parent
                // before anyone waits on a monitor mapped into the child.
                drop(request);

                let pid = child.as_raw();
                match read_failure(error_reader) {
                    Ok(None) => {
                        let id = ProcessId::new(pid).ok_or(SpawnError::NoProcessId(pid))?;
                        debug!(pid = %pid, "process.spawn complete");
                        Ok(id)
                    }
                    Ok(Some(failure)) => {
                        reap_blocking(pid);
                        Err(failure.into_error())
                    }
                    Err(error) => {
                        reap_blocking(pid);
                        Err(syscall_error("read", line!(), &error))
                    }
                }
            }
        }
    }
}

fn syscall_error(call: &'static str, line: u32, error: &io::Error) -> SpawnError {
    SpawnError::Syscall {
        call,
        file: file!(),
        line,
        return_value: -1,
        errno: io_errno(error),
    }
}

fn io_errno(error: &io::Error) -> Errno {
    Errno::from_raw(error.raw_os_error().unwrap_or(libc::EIO))
}

/// Blocking reap, for children that failed before `execve` and exit at once.
fn reap_blocking(pid: libc::pid_t) {
    let mut status = 0;
    loop {
        // SAFETY: plain waitpid on our own child.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc != -1 || Errno::last() != Errno::EINTR {
            break;
        }
    }
}

// ============================================================================
// Child-side Preparation
// ============================================================================

/// Steps the child can fail at, indexed by the error record's call field.
const CHILD_CALLS: [&str; 7] = [
    "fcntl(F_DUPFD_CLOEXEC)",
    "dup2",
    "sigprocmask",
    "signal(SIGPIPE)",
    "close_range",
    "chdir",
    "execve",
];

const RECORD_LEN: usize = 12;

/// A request converted into C layout, ready to use after `fork`.
struct Prepared {
    executable: CString,
    directory: CString,
    // Backing storage for the pointer arrays below.
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    sources: Vec<RawFd>,
    targets: Vec<RawFd>,
    temporaries: Vec<RawFd>,
    floor: RawFd,
    descriptor_limit: RawFd,
}

fn c_string(value: &OsStr, what: &'static str) -> Result<CString, SpawnError> {
    CString::new(value.as_bytes())
        .map_err(|_| SpawnError::invalid_parameter(value.to_string_lossy(), what))
}

fn pointer_array(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

impl Prepared {
    fn new(request: &SpawnRequest) -> Result<Self, SpawnError> {
        if !request.executable.is_absolute() {
            return Err(SpawnError::invalid_parameter(
                request.executable.to_string_lossy(),
                "executable path must be absolute",
            ));
        }
        let executable = c_string(
            request.executable.as_os_str(),
            "executable path contains a NUL byte",
        )?;
        let directory = c_string(
            request.directory.as_os_str(),
            "working directory contains a NUL byte",
        )?;

        let mut argv = vec![executable.clone()];
        for argument in &request.arguments {
            argv.push(c_string(argument, "argument contains a NUL byte")?);
        }
        let envp = request
            .environment
            .iter()
            .map(|entry| c_string(entry, "environment entry contains a NUL byte"))
            .collect::<Result<Vec<_>, _>>()?;

        let sources: Vec<RawFd> = request
            .descriptors
            .entries
            .iter()
            .map(|(source, _)| source.as_raw_fd())
            .collect();
        let targets: Vec<RawFd> = request.descriptors.targets().collect();
        let floor = targets.iter().copied().max().map_or(0, |max| max + 1);

        Ok(Self {
            argv_ptrs: pointer_array(&argv),
            envp_ptrs: pointer_array(&envp),
            _argv: argv,
            _envp: envp,
            executable,
            directory,
            temporaries: vec![-1; sources.len()],
            sources,
            targets,
            floor,
            descriptor_limit: descriptor_limit(),
        })
    }

    /// Child side of the fork. Never returns.
    ///
    /// # Safety
    /// Must only be called in a freshly forked child. Nothing here may
    /// allocate, lock, or touch state shared with other parent threads.
    unsafe fn exec_child(mut self, error_fd: RawFd) -> ! {
        // Failures before the report descriptor is safe from dup2 go to the
        // original number.
        let report_fd = libc::fcntl(error_fd, libc::F_DUPFD_CLOEXEC, self.floor);
        if report_fd < 0 {
            fail(error_fd, 0, line!());
        }

        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        if libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut()) != 0 {
            fail(report_fd, 2, line!());
        }
        if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
            fail(report_fd, 3, line!());
        }

        // Lift every source above the highest target so no dup2 below can
        // clobber a source that is still needed.
        for (index, source) in self.sources.iter().enumerate() {
            let temporary = libc::fcntl(*source, libc::F_DUPFD_CLOEXEC, self.floor);
            if temporary < 0 {
                fail(report_fd, 0, line!());
            }
            self.temporaries[index] = temporary;
        }
        for (temporary, target) in self.temporaries.iter().zip(self.targets.iter()) {
            if libc::dup2(*temporary, *target) < 0 {
                fail(report_fd, 1, line!());
            }
        }

        for fd in 0..self.floor {
            if !self.targets.contains(&fd) {
                libc::close(fd);
            }
        }
        mark_close_on_exec_from(self.floor, self.descriptor_limit, report_fd);

        if libc::chdir(self.directory.as_ptr()) != 0 {
            fail(report_fd, 5, line!());
        }
        libc::execve(
            self.executable.as_ptr(),
            self.argv_ptrs.as_ptr(),
            self.envp_ptrs.as_ptr(),
        );
        fail(report_fd, 6, line!())
    }
}

/// Upper bound for the close-on-exec fallback loop, read before forking.
fn descriptor_limit() -> RawFd {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, _)) if soft != libc::RLIM_INFINITY => {
            RawFd::try_from(soft).unwrap_or(RawFd::MAX)
        }
        _ => 65536,
    }
}

/// Set close-on-exec on every descriptor numbered `floor` or above.
#[cfg(target_os = "linux")]
unsafe fn mark_close_on_exec_from(floor: RawFd, limit: RawFd, report_fd: RawFd) {
    const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;
    let rc = libc::syscall(
        libc::SYS_close_range,
        floor as libc::c_uint,
        libc::c_uint::MAX,
        CLOSE_RANGE_CLOEXEC,
    );
    if rc != 0 {
        mark_close_on_exec_loop(floor, limit, report_fd);
    }
}

#[cfg(not(target_os = "linux"))]
unsafe fn mark_close_on_exec_from(floor: RawFd, limit: RawFd, report_fd: RawFd) {
    mark_close_on_exec_loop(floor, limit, report_fd);
}

unsafe fn mark_close_on_exec_loop(floor: RawFd, limit: RawFd, report_fd: RawFd) {
    for fd in floor..limit {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0
            && flags & libc::FD_CLOEXEC == 0
            && libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) != 0
        {
            fail(report_fd, 4, line!());
        }
    }
}

/// Report a failed step through the error pipe and exit.
unsafe fn fail(report_fd: RawFd, call: u32, line: u32) -> ! {
    let errno = Errno::last_raw();
    let mut record = [0u8; RECORD_LEN];
    record[0..4].copy_from_slice(&call.to_ne_bytes());
    record[4..8].copy_from_slice(&line.to_ne_bytes());
    record[8..12].copy_from_slice(&errno.to_ne_bytes());
    let mut written = 0;
    while written < RECORD_LEN {
        let rc = libc::write(
            report_fd,
            record[written..].as_ptr().cast(),
            RECORD_LEN - written,
        );
        if rc > 0 {
            written += rc as usize;
        } else if rc < 0 && Errno::last_raw() == libc::EINTR {
            continue;
        } else {
            break;
        }
    }
    libc::_exit(127)
}

// ============================================================================
// Parent-side Error Record
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChildFailure {
    call: u32,
    line: u32,
    errno: i32,
}

impl ChildFailure {
    fn decode(record: [u8; RECORD_LEN]) -> Self {
        let word = |range: std::ops::Range<usize>| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&record[range]);
            bytes
        };
        Self {
            call: u32::from_ne_bytes(word(0..4)),
            line: u32::from_ne_bytes(word(4..8)),
            errno: i32::from_ne_bytes(word(8..12)),
        }
    }

    fn into_error(self) -> SpawnError {
        SpawnError::Syscall {
            call: CHILD_CALLS
                .get(self.call as usize)
                .copied()
                .unwrap_or("spawn"),
            file: file!(),
            line: self.line,
            return_value: -1,
            errno: Errno::from_raw(self.errno),
        }
    }
}

/// Read the child's failure record, if it wrote one before `execve`.
fn read_failure(reader: OwnedFd) -> io::Result<Option<ChildFailure>> {
    let mut file = File::from(reader);
    let mut record = [0u8; RECORD_LEN];
    let mut filled = 0;
    while filled < RECORD_LEN {
        match file.read(&mut record[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    match filled {
        0 => Ok(None),
        RECORD_LEN => Ok(Some(ChildFailure::decode(record))),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated spawn error record",
        )),
    }
}

/// Whether `path` names an executable regular file.
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
