//! Sandboxed child-process launching with an exhaustive handle whitelist.
//!
//! The crate starts a helper process while controlling exactly which OS
//! handles it may inherit, and wires a private bidirectional byte channel
//! between parent and child out of two anonymous pipes. Most process-spawn
//! APIs leave every inheritable handle of the parent open to the child; here
//! inheritance is exhaustive: the child receives the two channel endpoints,
//! the handles the caller whitelists, and nothing else.
//!
//! - [`inheritable_channel`] creates the anonymous pipes.
//! - [`Launcher::spawn`] builds the whitelist, parameterises the child's
//!   command line with the endpoint values, and creates the process.
//! - [`SandboxedProcess::stop`] force-terminates the child and waits for
//!   the exit before releasing the process handle.
//!
//! The byte streams carry no framing; any protocol on top is the caller's
//! concern. Supported platforms are Linux and Windows, and the public
//! surface is platform neutral apart from [`RawEndpoint`] and
//! [`CommandLine`].
//!
//! ```rust,no_run
//! use std::ffi::OsString;
//! use std::io::Write;
//!
//! use airlock::{LaunchConfig, Launcher};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let launcher = Launcher::new(LaunchConfig::new());
//! // Unix command lines are argv vectors; Windows takes one verbatim line.
//! let mut child = launcher.spawn(|input, output| {
//!     vec![
//!         OsString::from("/usr/libexec/relay-worker"),
//!         OsString::from(input.to_string()),
//!         OsString::from(output.to_string()),
//!     ]
//! })?;
//! child.input_endpoint().expect("running").write_all(b"ping")?;
//! child.stop()?;
//! # Ok(()) }
//! ```

mod channel;
mod config;
mod error;
#[cfg_attr(target_os = "linux", path = "os/linux.rs")]
#[cfg_attr(target_os = "windows", path = "os/windows.rs")]
mod os;
mod process;

pub use channel::{Channel, EndpointRole, PipeEndpoint, inheritable_channel};
pub use config::{LaunchConfig, WaitPolicy};
pub use error::PlatformError;
pub use os::{CommandLine, RawEndpoint};
pub use process::{Launcher, ProcessState, SandboxedProcess};

#[cfg(test)]
mod tests;
