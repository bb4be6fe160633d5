//! Linux realisation of the launch primitives.
//!
//! Pipes are created close-on-exec. The handle whitelist is realised in the
//! child between fork and exec: the whole descriptor table is marked
//! close-on-exec, then the flag is cleared on exactly the whitelisted
//! descriptors. Descriptor numbers survive exec unchanged, so the command
//! line can name them for the child.

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::error::PlatformError;

/// Raw handle value passed to children over the command line.
pub type RawEndpoint = std::os::fd::RawFd;

/// Command lines are argv vectors; element zero names the program and is
/// resolved through `PATH` when not absolute.
pub type CommandLine = Vec<OsString>;

pub(crate) type OwnedEndpoint = OwnedFd;

/// Pipes are born close-on-exec on this platform.
pub(crate) const ENDPOINTS_BORN_INHERITABLE: bool = false;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub(crate) mod calls {
    pub(crate) const CREATE_PIPE: &str = "pipe2";
    pub(crate) const CREATE_PROCESS: &str = "spawn";
    pub(crate) const TERMINATE: &str = "kill";
    pub(crate) const WAIT: &str = "waitpid";
}

/// Running child process owned by the launcher.
#[derive(Debug)]
pub(crate) struct ChildHandle {
    child: Child,
}

impl ChildHandle {
    pub(crate) fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        // An abandoned handle must not pin a zombie for the parent's
        // lifetime: collect the status if the child has already exited.
        // A child that is still running is left alone.
        let _ = self.child.try_wait();
    }
}

/// Ordered pass list realising the handle whitelist.
#[derive(Debug)]
pub(crate) struct HandleWhitelist {
    descriptors: Vec<RawEndpoint>,
}

impl HandleWhitelist {
    /// Captures the ordered descriptor list for the child's pre-exec hook.
    /// Building the list performs no native call on this platform; the
    /// signature matches the Windows builder, which does.
    pub(crate) fn build(handles: &[RawEndpoint]) -> Result<Self, PlatformError> {
        Ok(Self {
            descriptors: handles.to_vec(),
        })
    }

    pub(crate) fn descriptors(&self) -> &[RawEndpoint] {
        &self.descriptors
    }
}

/// Native operations backing the launcher, bound lazily once per process.
/// The table is also the seam the failure-simulation tests inject through.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NativeBindings {
    pub(crate) create_pipe: fn() -> io::Result<(OwnedEndpoint, OwnedEndpoint)>,
    pub(crate) create_process: fn(&CommandLine, &[RawEndpoint]) -> io::Result<ChildHandle>,
    pub(crate) terminate_process: fn(&ChildHandle) -> io::Result<()>,
    pub(crate) wait_for_exit: fn(&mut ChildHandle, Option<Duration>) -> io::Result<()>,
}

static BINDINGS: Lazy<NativeBindings> = Lazy::new(NativeBindings::host);

impl NativeBindings {
    /// The process-wide table over the host operating system.
    pub(crate) fn table() -> &'static Self {
        &BINDINGS
    }

    fn host() -> Self {
        Self {
            create_pipe: host_create_pipe,
            create_process: host_create_process,
            terminate_process: host_terminate,
            wait_for_exit: host_wait,
        }
    }
}

pub(crate) fn create_child(
    bindings: &NativeBindings,
    command_line: &CommandLine,
    whitelist: &mut HandleWhitelist,
) -> Result<ChildHandle, PlatformError> {
    (bindings.create_process)(command_line, whitelist.descriptors())
        .map_err(|source| PlatformError::new(calls::CREATE_PROCESS, source))
}

pub(crate) fn terminate_child(
    bindings: &NativeBindings,
    child: &ChildHandle,
) -> Result<(), PlatformError> {
    (bindings.terminate_process)(child)
        .map_err(|source| PlatformError::new(calls::TERMINATE, source))
}

pub(crate) fn wait_for_child(
    bindings: &NativeBindings,
    child: &mut ChildHandle,
    timeout: Option<Duration>,
) -> Result<(), PlatformError> {
    (bindings.wait_for_exit)(child, timeout)
        .map_err(|source| PlatformError::new(calls::WAIT, source))
}

pub(crate) fn raw_endpoint(endpoint: &OwnedEndpoint) -> RawEndpoint {
    endpoint.as_raw_fd()
}

pub(crate) fn read_endpoint(endpoint: &OwnedEndpoint, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        // SAFETY: the descriptor outlives the call and the buffer bounds are
        // passed alongside the pointer.
        let count =
            unsafe { libc::read(endpoint.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if count >= 0 {
            return Ok(count as usize);
        }
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

pub(crate) fn write_endpoint(endpoint: &OwnedEndpoint, buf: &[u8]) -> io::Result<usize> {
    loop {
        // SAFETY: the kernel copies out of the buffer before returning.
        let count = unsafe { libc::write(endpoint.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if count >= 0 {
            return Ok(count as usize);
        }
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

fn host_create_pipe() -> io::Result<(OwnedEndpoint, OwnedEndpoint)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    // SAFETY: pipe2 fills the two-element array on success and touches
    // nothing else.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were created above and are owned by nothing
    // else yet.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn host_create_process(
    command_line: &CommandLine,
    pass_list: &[RawEndpoint],
) -> io::Result<ChildHandle> {
    let (program, arguments) = command_line
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;
    let mut command = Command::new(program);
    command.args(arguments);
    let descriptors = pass_list.to_vec();
    // SAFETY: the hook runs between fork and exec and only issues
    // async-signal-safe calls (close_range, fcntl).
    unsafe {
        command.pre_exec(move || adopt_pass_list(&descriptors));
    }
    command.spawn().map(|child| ChildHandle { child })
}

/// Realises the whitelist in the child between fork and exec.
fn adopt_pass_list(pass_list: &[RawEndpoint]) -> io::Result<()> {
    sweep_descriptor_table();
    for &descriptor in pass_list {
        clear_cloexec(descriptor)?;
    }
    Ok(())
}

/// Marks every descriptor from 3 upward close-on-exec, best effort. Kernels
/// without `close_range` (pre 5.9) fall back to the `O_CLOEXEC` creation
/// default of the pipe factory.
fn sweep_descriptor_table() {
    // SAFETY: close_range manipulates descriptor flags only; failure is
    // reported through the return value, which best effort ignores.
    let _ = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            3 as libc::c_uint,
            libc::c_uint::MAX,
            libc::CLOSE_RANGE_CLOEXEC as libc::c_uint,
        )
    };
}

fn clear_cloexec(descriptor: RawEndpoint) -> io::Result<()> {
    // SAFETY: fcntl on an integer descriptor; a stale value surfaces as
    // EBADF rather than undefined behaviour.
    let flags = unsafe { libc::fcntl(descriptor, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    let rc = unsafe { libc::fcntl(descriptor, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn host_terminate(child: &ChildHandle) -> io::Result<()> {
    // SAFETY: `kill(2)` is memory-safe even when the PID is no longer valid;
    // the kernel simply returns an error.
    let rc = unsafe { libc::kill(child.pid() as libc::pid_t, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn host_wait(child: &mut ChildHandle, timeout: Option<Duration>) -> io::Result<()> {
    let Some(timeout) = timeout else {
        return child.child.wait().map(|_| ());
    };
    let deadline = Instant::now() + timeout;
    loop {
        if child.child.try_wait()?.is_some() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out waiting for child exit",
            ));
        }
        thread::sleep(POLL_INTERVAL);
    }
}
