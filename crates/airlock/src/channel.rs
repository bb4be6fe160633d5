//! Inheritable channel factory and the pipe endpoint type.

use std::io::{self, Read, Write};

use crate::error::PlatformError;
use crate::os::{self, NativeBindings, OwnedEndpoint, RawEndpoint};

/// Direction of a pipe endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    /// Bytes are read from this end.
    Read,
    /// Bytes are written to this end.
    Write,
}

/// One end of a unidirectional byte-stream pipe.
///
/// Owns the underlying OS handle and releases it on drop. Byte IO passes
/// straight through to the OS with no buffering or framing, and no role
/// checking: reading a write end surfaces the OS error unchanged.
#[derive(Debug)]
pub struct PipeEndpoint {
    handle: OwnedEndpoint,
    role: EndpointRole,
    inheritable: bool,
}

impl PipeEndpoint {
    pub(crate) fn new(handle: OwnedEndpoint, role: EndpointRole) -> Self {
        Self {
            handle,
            role,
            inheritable: os::ENDPOINTS_BORN_INHERITABLE,
        }
    }

    /// The direction of this endpoint.
    #[must_use]
    pub const fn role(&self) -> EndpointRole {
        self.role
    }

    /// Whether the endpoint was created inheritable.
    ///
    /// Windows pipes are born inheritable so the whitelist can admit them.
    /// Unix pipes are born close-on-exec; the selected descriptors become
    /// inheritable in the child between fork and exec instead.
    #[must_use]
    pub const fn inheritable(&self) -> bool {
        self.inheritable
    }

    /// The raw OS handle value.
    ///
    /// The endpoint retains ownership; callers must not close the value.
    #[must_use]
    pub fn raw(&self) -> RawEndpoint {
        os::raw_endpoint(&self.handle)
    }
}

impl Read for PipeEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        os::read_endpoint(&self.handle, buf)
    }
}

impl Write for PipeEndpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        os::write_endpoint(&self.handle, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Anonymous pipes have no userspace buffer to flush.
        Ok(())
    }
}

/// A unidirectional pipe: one read end, one write end.
#[derive(Debug)]
pub struct Channel {
    /// The end bytes are read from.
    pub read: PipeEndpoint,
    /// The end bytes are written to.
    pub write: PipeEndpoint,
}

/// Creates one unidirectional pipe suitable for parent/child communication.
///
/// Two calls with the roles swapped between the processes form a
/// bidirectional channel. No handle is left allocated when the call fails.
///
/// # Errors
///
/// Returns [`PlatformError`] when the native pipe-creation call fails, for
/// example on handle-table exhaustion.
pub fn inheritable_channel() -> Result<Channel, PlatformError> {
    channel_with(NativeBindings::table())
}

pub(crate) fn channel_with(bindings: &NativeBindings) -> Result<Channel, PlatformError> {
    let (read, write) = (bindings.create_pipe)()
        .map_err(|source| PlatformError::new(os::calls::CREATE_PIPE, source))?;
    Ok(Channel {
        read: PipeEndpoint::new(read, EndpointRole::Read),
        write: PipeEndpoint::new(write, EndpointRole::Write),
    })
}
