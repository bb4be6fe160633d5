//! Windows realisation of the launch primitives.
//!
//! Pipes are created with an inheritable security attribute and the handle
//! whitelist is encoded into an extended process/thread attribute block. The
//! attribute block makes inheritance exhaustive: `CreateProcessW` is invoked
//! with inheritance enabled, yet only the listed handles cross into the
//! child. Handle values survive creation unchanged, so the command line can
//! name them for the child.

use std::ffi::OsString;
use std::io;
use std::iter;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::ptr;
use std::time::Duration;

use once_cell::sync::Lazy;
use windows_sys::Win32::Foundation::{
    ERROR_BROKEN_PIPE, ERROR_INSUFFICIENT_BUFFER, HANDLE, TRUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::Pipes::CreatePipe;
use windows_sys::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, EXTENDED_STARTUPINFO_PRESENT, INFINITE,
    InitializeProcThreadAttributeList, LPPROC_THREAD_ATTRIBUTE_LIST,
    PROC_THREAD_ATTRIBUTE_HANDLE_LIST, PROCESS_INFORMATION, STARTF_USESHOWWINDOW, STARTUPINFOEXW,
    TerminateProcess, UpdateProcThreadAttribute, WaitForSingleObject,
};
use windows_sys::Win32::UI::WindowsAndMessaging::SW_HIDE;

use crate::error::PlatformError;

/// Raw handle value passed to children over the command line.
pub type RawEndpoint = std::os::windows::io::RawHandle;

/// Command lines are a single verbatim line; `CreateProcessW` resolves the
/// image from its first token.
pub type CommandLine = OsString;

pub(crate) type OwnedEndpoint = OwnedHandle;

/// Pipes are born inheritable so the whitelist can admit them.
pub(crate) const ENDPOINTS_BORN_INHERITABLE: bool = true;

/// Exit code delivered by the forced stop, mirroring a `-1` termination
/// status.
const STOP_EXIT_CODE: u32 = u32::MAX;

pub(crate) mod calls {
    pub(crate) const CREATE_PIPE: &str = "CreatePipe";
    pub(crate) const INITIALIZE_ATTRIBUTES: &str = "InitializeProcThreadAttributeList";
    pub(crate) const UPDATE_ATTRIBUTES: &str = "UpdateProcThreadAttribute";
    pub(crate) const CREATE_PROCESS: &str = "CreateProcessW";
    pub(crate) const TERMINATE: &str = "TerminateProcess";
    pub(crate) const WAIT: &str = "WaitForSingleObject";
}

/// Running child process owned by the launcher. Only the process handle is
/// retained; the primary thread handle is released at creation.
#[derive(Debug)]
pub(crate) struct ChildHandle {
    process: OwnedHandle,
    pid: u32,
}

impl ChildHandle {
    pub(crate) const fn pid(&self) -> u32 {
        self.pid
    }
}

/// Handle whitelist encoded as an extended process/thread attribute block.
///
/// Construction follows the two-call sizing protocol: a probe call reports
/// the required capacity, a second call initialises a buffer of exactly that
/// size, and the handle list is attached as the single attribute. The
/// transient scaffolding is torn down before the block is handed to process
/// creation; the block memory and the handle array stay alive until then.
#[derive(Debug)]
pub(crate) struct HandleWhitelist {
    block: Vec<u8>,
    // Keeps the array the attribute block points into alive for as long as
    // the block itself.
    _handles: Vec<HANDLE>,
}

impl HandleWhitelist {
    pub(crate) fn build(handles: &[RawEndpoint]) -> Result<Self, PlatformError> {
        let capacity = Self::required_capacity()?;
        let mut block = vec![0u8; capacity];
        let mut size = capacity;
        // SAFETY: the buffer was sized by the probe call above.
        let initialised =
            unsafe { InitializeProcThreadAttributeList(block.as_mut_ptr().cast(), 1, 0, &mut size) };
        if initialised == 0 {
            return Err(PlatformError::last_os_error(calls::INITIALIZE_ATTRIBUTES));
        }
        let scaffolding = ScaffoldingGuard {
            list: block.as_mut_ptr().cast(),
        };
        let handle_array: Vec<HANDLE> = handles.to_vec();
        let length = handle_array.len() * mem::size_of::<HANDLE>();
        // SAFETY: the list was initialised above; the handle array outlives
        // the block inside the returned value.
        let updated = unsafe {
            UpdateProcThreadAttribute(
                scaffolding.list,
                0,
                PROC_THREAD_ATTRIBUTE_HANDLE_LIST as usize,
                handle_array.as_ptr().cast(),
                length,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if updated == 0 {
            return Err(PlatformError::last_os_error(calls::UPDATE_ATTRIBUTES));
        }
        // Scaffolding is released before process creation; the block buffer
        // itself must outlive the launch call.
        drop(scaffolding);
        Ok(Self {
            block,
            _handles: handle_array,
        })
    }

    /// Capacity negotiation: the probe call reports failure by contract
    /// while writing the required size.
    fn required_capacity() -> Result<usize, PlatformError> {
        let mut capacity = 0usize;
        // SAFETY: a null destination is the documented probe form.
        let rc = unsafe { InitializeProcThreadAttributeList(ptr::null_mut(), 1, 0, &mut capacity) };
        if rc != 0 {
            return Err(PlatformError::new(
                calls::INITIALIZE_ATTRIBUTES,
                io::Error::other("size probe succeeded without a buffer"),
            ));
        }
        let probe = io::Error::last_os_error();
        if probe.raw_os_error() != Some(ERROR_INSUFFICIENT_BUFFER as i32) {
            return Err(PlatformError::new(calls::INITIALIZE_ATTRIBUTES, probe));
        }
        Ok(capacity)
    }

    fn attribute_list(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        self.block.as_mut_ptr().cast()
    }
}

/// Deletes the attribute-list scaffolding on every construction path.
struct ScaffoldingGuard {
    list: LPPROC_THREAD_ATTRIBUTE_LIST,
}

impl Drop for ScaffoldingGuard {
    fn drop(&mut self) {
        // SAFETY: the list was initialised and is deleted exactly once.
        unsafe { DeleteProcThreadAttributeList(self.list) };
    }
}

/// Native operations backing the launcher, bound lazily once per process.
/// The table is also the seam the failure-simulation tests inject through.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NativeBindings {
    pub(crate) create_pipe: fn() -> io::Result<(OwnedEndpoint, OwnedEndpoint)>,
    pub(crate) create_process: fn(&CommandLine, &mut HandleWhitelist) -> io::Result<ChildHandle>,
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
    (bindings.create_process)(command_line, whitelist)
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
    endpoint.as_raw_handle()
}

pub(crate) fn read_endpoint(endpoint: &OwnedEndpoint, buf: &mut [u8]) -> io::Result<usize> {
    let mut transferred: u32 = 0;
    let length = u32::try_from(buf.len()).unwrap_or(u32::MAX);
    // SAFETY: pointer and length describe the same allocation.
    let rc = unsafe {
        ReadFile(
            endpoint.as_raw_handle(),
            buf.as_mut_ptr().cast(),
            length,
            &mut transferred,
            ptr::null_mut(),
        )
    };
    if rc == 0 {
        let error = io::Error::last_os_error();
        // The writer closing its end reads as end of stream, matching Unix.
        if error.raw_os_error() == Some(ERROR_BROKEN_PIPE as i32) {
            return Ok(0);
        }
        return Err(error);
    }
    Ok(transferred as usize)
}

pub(crate) fn write_endpoint(endpoint: &OwnedEndpoint, buf: &[u8]) -> io::Result<usize> {
    let mut transferred: u32 = 0;
    let length = u32::try_from(buf.len()).unwrap_or(u32::MAX);
    // SAFETY: the kernel copies out of the buffer before returning.
    let rc = unsafe {
        WriteFile(
            endpoint.as_raw_handle(),
            buf.as_ptr().cast(),
            length,
            &mut transferred,
            ptr::null_mut(),
        )
    };
    if rc == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(transferred as usize)
}

fn host_create_pipe() -> io::Result<(OwnedEndpoint, OwnedEndpoint)> {
    let security = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: TRUE,
    };
    let mut read: HANDLE = ptr::null_mut();
    let mut write: HANDLE = ptr::null_mut();
    // SAFETY: the out parameters receive the pipe ends on success.
    let rc = unsafe { CreatePipe(&mut read, &mut write, &security, 0) };
    if rc == 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both handles were created above and are owned by nothing else
    // yet.
    Ok(unsafe {
        (
            OwnedHandle::from_raw_handle(read),
            OwnedHandle::from_raw_handle(write),
        )
    })
}

fn host_create_process(
    command_line: &CommandLine,
    whitelist: &mut HandleWhitelist,
) -> io::Result<ChildHandle> {
    let mut wide: Vec<u16> = command_line.encode_wide().chain(iter::once(0)).collect();
    // SAFETY: zeroed startup and process-information structures are the
    // documented blank states.
    let mut startup: STARTUPINFOEXW = unsafe { mem::zeroed() };
    startup.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
    startup.StartupInfo.dwFlags = STARTF_USESHOWWINDOW;
    startup.StartupInfo.wShowWindow = SW_HIDE as u16;
    startup.lpAttributeList = whitelist.attribute_list();
    // SAFETY: zeroed is the documented blank state.
    let mut process_information: PROCESS_INFORMATION = unsafe { mem::zeroed() };
    // SAFETY: the command-line buffer is writable as CreateProcessW requires
    // and the attribute block outlives the call.
    let rc = unsafe {
        CreateProcessW(
            ptr::null(),
            wide.as_mut_ptr(),
            ptr::null(),
            ptr::null(),
            TRUE,
            EXTENDED_STARTUPINFO_PRESENT,
            ptr::null(),
            ptr::null(),
            &startup.StartupInfo,
            &mut process_information,
        )
    };
    if rc == 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both handles came from a successful creation call and are
    // owned here; the primary thread handle is released immediately.
    unsafe {
        drop(OwnedHandle::from_raw_handle(process_information.hThread));
        Ok(ChildHandle {
            process: OwnedHandle::from_raw_handle(process_information.hProcess),
            pid: process_information.dwProcessId,
        })
    }
}

fn host_terminate(child: &ChildHandle) -> io::Result<()> {
    // SAFETY: the process handle is live for the lifetime of ChildHandle.
    let rc = unsafe { TerminateProcess(child.process.as_raw_handle(), STOP_EXIT_CODE) };
    if rc == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn host_wait(child: &mut ChildHandle, timeout: Option<Duration>) -> io::Result<()> {
    let millis = match timeout {
        None => INFINITE,
        Some(limit) => u32::try_from(limit.as_millis()).unwrap_or(INFINITE - 1),
    };
    // SAFETY: the process handle is live; the call blocks until exit or
    // deadline.
    match unsafe { WaitForSingleObject(child.process.as_raw_handle(), millis) } {
        WAIT_OBJECT_0 => Ok(()),
        WAIT_TIMEOUT => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out waiting for child exit",
        )),
        _ => Err(io::Error::last_os_error()),
    }
}
