//! Fixture child driven by the airlock integration suite.
//!
//! The worker receives the raw values of its two channel endpoints on the
//! command line and speaks one of three modes:
//!
//! - `echo`: replies to every chunk read from the input endpoint with the
//!   same bytes prefixed `ECHO:`, until end of stream.
//! - `mark`: writes a marker line through every extra whitelisted handle,
//!   then reports completion over the output endpoint.
//! - `report-fds` (Linux): writes the numbers of all open descriptors from
//!   3 upward to the output endpoint and exits.

use std::env;
use std::fs::File;
use std::io::{self, Read, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("airlock-worker: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> io::Result<()> {
    let arguments: Vec<String> = env::args().skip(1).collect();
    let mode = arguments
        .first()
        .ok_or_else(|| invalid("missing mode argument"))?;
    let rest = arguments.get(1..).unwrap_or_default();
    match mode.as_str() {
        "echo" => echo(rest),
        "mark" => mark(rest),
        #[cfg(target_os = "linux")]
        "report-fds" => report_fds(rest),
        other => Err(invalid(&format!("unknown mode {other}"))),
    }
}

fn echo(rest: &[String]) -> io::Result<()> {
    let mut input = adopt_endpoint(rest.first())?;
    let mut output = adopt_endpoint(rest.get(1))?;
    let mut buf = [0u8; 4096];
    loop {
        let count = input.read(&mut buf)?;
        if count == 0 {
            return Ok(());
        }
        let mut reply = Vec::with_capacity(count + 5);
        reply.extend_from_slice(b"ECHO:");
        reply.extend_from_slice(&buf[..count]);
        output.write_all(&reply)?;
    }
}

fn mark(rest: &[String]) -> io::Result<()> {
    let _input = adopt_endpoint(rest.first())?;
    let mut output = adopt_endpoint(rest.get(1))?;
    for value in rest.get(2..).unwrap_or_default() {
        let mut target = parse_endpoint(value)?;
        target.write_all(b"MARKED\n")?;
    }
    output.write_all(b"DONE")
}

#[cfg(target_os = "linux")]
fn report_fds(rest: &[String]) -> io::Result<()> {
    let _input = adopt_endpoint(rest.first())?;
    let mut output = adopt_endpoint(rest.get(1))?;
    let descriptors = open_descriptors()?;
    let report = descriptors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    output.write_all(report.as_bytes())
}

/// Numbers of this process's open descriptors from 3 upward. The /proc
/// directory handle used for the enumeration shows up in its own listing;
/// entries that are closed once enumeration ends are filtered back out.
#[cfg(target_os = "linux")]
fn open_descriptors() -> io::Result<Vec<i32>> {
    let mut named = Vec::new();
    for entry in std::fs::read_dir("/proc/self/fd")? {
        let entry = entry?;
        if let Ok(fd) = entry.file_name().to_string_lossy().parse::<i32>() {
            if fd >= 3 {
                named.push(fd);
            }
        }
    }
    let mut live: Vec<i32> = named
        .into_iter()
        .filter(|&fd| {
            // SAFETY: F_GETFD reports EBADF for stale descriptors rather
            // than touching memory.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            flags != -1
        })
        .collect();
    live.sort_unstable();
    Ok(live)
}

fn adopt_endpoint(value: Option<&String>) -> io::Result<File> {
    let raw = value.ok_or_else(|| invalid("missing endpoint argument"))?;
    parse_endpoint(raw)
}

#[cfg(unix)]
fn parse_endpoint(raw: &str) -> io::Result<File> {
    use std::os::fd::FromRawFd;

    let fd: i32 = raw
        .parse()
        .map_err(|_| invalid("endpoint is not a number"))?;
    // SAFETY: the parent transferred ownership of this descriptor at spawn.
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[cfg(windows)]
fn parse_endpoint(raw: &str) -> io::Result<File> {
    use std::os::windows::io::{FromRawHandle, RawHandle};

    let value: usize = raw
        .parse()
        .map_err(|_| invalid("endpoint is not a number"))?;
    // SAFETY: the parent transferred ownership of this handle at spawn.
    Ok(unsafe { File::from_raw_handle(value as RawHandle) })
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.to_owned())
}
