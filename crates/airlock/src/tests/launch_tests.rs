//! Failure-path and sequencing tests for the launcher, driven through
//! injected native bindings. Table entries are plain function pointers, so
//! observations travel through per-test statics, and entries that must hand
//! back a live child delegate to the host table with a sleeper command line.

use std::io;
use std::os::fd::AsRawFd;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::os::{self, NativeBindings, OwnedEndpoint};
use crate::{CommandLine, LaunchConfig, Launcher, ProcessState, RawEndpoint, WaitPolicy};

fn sleeper_line(_input: RawEndpoint, _output: RawEndpoint) -> CommandLine {
    vec!["sleep".into(), "30".into()]
}

/// Kills and reaps a child a test deliberately left behind.
fn reap_stray_sleeper(pid: u32) {
    // SAFETY: the PID names a child this test spawned; signalling a zombie
    // is a no-op and waitpid then collects it.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
        libc::waitpid(pid as libc::pid_t, std::ptr::null_mut(), 0);
    }
}

fn refuse_pipe() -> io::Result<(OwnedEndpoint, OwnedEndpoint)> {
    Err(io::Error::from_raw_os_error(libc::EMFILE))
}

#[test]
fn pipe_failure_names_the_failing_call() {
    let bindings = NativeBindings {
        create_pipe: refuse_pipe,
        ..*NativeBindings::table()
    };
    let launcher = Launcher::new(LaunchConfig::new());
    let error = launcher
        .spawn_with(bindings, sleeper_line)
        .expect_err("pipe creation should fail");
    assert_eq!(error.call(), "pipe2");
}

static SECOND_PIPE_CALLS: AtomicUsize = AtomicUsize::new(0);
static SPAWNS_AFTER_PIPE_FAILURE: AtomicUsize = AtomicUsize::new(0);

fn refuse_second_pipe() -> io::Result<(OwnedEndpoint, OwnedEndpoint)> {
    if SECOND_PIPE_CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
        (NativeBindings::table().create_pipe)()
    } else {
        Err(io::Error::from_raw_os_error(libc::EMFILE))
    }
}

fn count_spawn(line: &CommandLine, pass_list: &[RawEndpoint]) -> io::Result<os::ChildHandle> {
    SPAWNS_AFTER_PIPE_FAILURE.fetch_add(1, Ordering::SeqCst);
    (NativeBindings::table().create_process)(line, pass_list)
}

#[test]
fn failure_of_the_second_pipe_skips_process_creation() {
    let bindings = NativeBindings {
        create_pipe: refuse_second_pipe,
        create_process: count_spawn,
        ..*NativeBindings::table()
    };
    let launcher = Launcher::new(LaunchConfig::new());
    let error = launcher
        .spawn_with(bindings, sleeper_line)
        .expect_err("the second pipe should fail");
    assert_eq!(error.call(), "pipe2");
    assert_eq!(SPAWNS_AFTER_PIPE_FAILURE.load(Ordering::SeqCst), 0);
}

fn refuse_spawn(_line: &CommandLine, _pass_list: &[RawEndpoint]) -> io::Result<os::ChildHandle> {
    Err(io::Error::from_raw_os_error(libc::EACCES))
}

#[test]
fn spawn_failure_carries_the_os_error() {
    use std::error::Error as _;

    let bindings = NativeBindings {
        create_process: refuse_spawn,
        ..*NativeBindings::table()
    };
    let launcher = Launcher::new(LaunchConfig::new());
    let error = launcher
        .spawn_with(bindings, sleeper_line)
        .expect_err("process creation should fail");
    assert_eq!(error.call(), "spawn");
    let source = error.source().expect("os error should be preserved");
    let io_error = source
        .downcast_ref::<io::Error>()
        .expect("source should be an io::Error");
    assert_eq!(io_error.raw_os_error(), Some(libc::EACCES));
}

static RECORDED_PASS_LIST: Mutex<Vec<RawEndpoint>> = Mutex::new(Vec::new());

fn record_pass_list(line: &CommandLine, pass_list: &[RawEndpoint]) -> io::Result<os::ChildHandle> {
    *RECORDED_PASS_LIST.lock().expect("pass list mutex") = pass_list.to_vec();
    (NativeBindings::table().create_process)(line, pass_list)
}

#[test]
fn factory_receives_the_whitelisted_child_endpoints() {
    let bindings = NativeBindings {
        create_process: record_pass_list,
        ..*NativeBindings::table()
    };
    let mut seen = (0, 0);
    let launcher = Launcher::new(LaunchConfig::new());
    let mut process = launcher
        .spawn_with(bindings, |input, output| {
            seen = (input, output);
            vec!["sleep".into(), "30".into()]
        })
        .expect("sleeper should launch");

    let passed = RECORDED_PASS_LIST.lock().expect("pass list mutex").clone();
    assert_eq!(passed.len(), 2);
    assert_eq!(
        passed.first(),
        Some(&seen.1),
        "the output child end leads the whitelist"
    );
    assert_eq!(
        passed.get(1),
        Some(&seen.0),
        "the input child end follows it"
    );
    process.stop().expect("stop should succeed");
}

static RECORDED_EXTRAS_PASS_LIST: Mutex<Vec<RawEndpoint>> = Mutex::new(Vec::new());

fn record_extras_pass_list(
    line: &CommandLine,
    pass_list: &[RawEndpoint],
) -> io::Result<os::ChildHandle> {
    *RECORDED_EXTRAS_PASS_LIST.lock().expect("pass list mutex") = pass_list.to_vec();
    (NativeBindings::table().create_process)(line, pass_list)
}

#[test]
fn extra_handles_follow_the_channel_ends() {
    let marker = tempfile::tempfile().expect("marker file");
    let extra = marker.as_raw_fd();
    let bindings = NativeBindings {
        create_process: record_extras_pass_list,
        ..*NativeBindings::table()
    };
    let launcher = Launcher::new(LaunchConfig::new().pass_handle(extra));
    let mut process = launcher
        .spawn_with(bindings, sleeper_line)
        .expect("sleeper should launch");

    let passed = RECORDED_EXTRAS_PASS_LIST
        .lock()
        .expect("pass list mutex")
        .clone();
    assert_eq!(passed.len(), 3);
    assert_eq!(passed.get(2), Some(&extra));
    process.stop().expect("stop should succeed");
}

#[test]
fn stop_transitions_state_and_is_idempotent() {
    let launcher = Launcher::new(LaunchConfig::new());
    let mut process = launcher
        .spawn_with(*NativeBindings::table(), sleeper_line)
        .expect("sleeper should launch");
    assert!(process.pid() > 0);
    assert_eq!(process.state(), ProcessState::Running);
    assert!(process.is_running());
    assert!(process.input().is_some());
    assert!(process.output().is_some());

    process.stop().expect("first stop should succeed");
    assert_eq!(process.state(), ProcessState::Stopped);
    assert!(!process.is_running());
    assert!(process.input().is_none());
    assert!(process.output().is_none());

    process.stop().expect("repeat stop should be a no-op");
    assert_eq!(process.state(), ProcessState::Stopped);
}

fn refuse_terminate(_child: &os::ChildHandle) -> io::Result<()> {
    Err(io::Error::from_raw_os_error(libc::EPERM))
}

#[test]
fn terminate_failure_leaves_the_process_stopped() {
    let bindings = NativeBindings {
        terminate_process: refuse_terminate,
        ..*NativeBindings::table()
    };
    let launcher = Launcher::new(LaunchConfig::new());
    let mut process = launcher
        .spawn_with(bindings, sleeper_line)
        .expect("sleeper should launch");
    let pid = process.pid();
    let error = process.stop().expect_err("termination should fail");
    assert_eq!(error.call(), "kill");
    assert_eq!(process.state(), ProcessState::Stopped);
    process.stop().expect("repeat stop should not retry");
    reap_stray_sleeper(pid);
}

fn ignore_terminate(_child: &os::ChildHandle) -> io::Result<()> {
    Ok(())
}

#[test]
fn stop_times_out_when_the_child_outlives_the_policy() {
    let bindings = NativeBindings {
        terminate_process: ignore_terminate,
        ..*NativeBindings::table()
    };
    let config = LaunchConfig::new().stop_wait(WaitPolicy::Timeout(Duration::from_millis(50)));
    let launcher = Launcher::new(config);
    let mut process = launcher
        .spawn_with(bindings, sleeper_line)
        .expect("sleeper should launch");
    let pid = process.pid();
    let error = process.stop().expect_err("the wait should time out");
    assert_eq!(error.call(), "waitpid");
    assert!(
        error.to_string().contains("timed out"),
        "unexpected rendering: {error}"
    );
    assert_eq!(process.state(), ProcessState::Stopped);
    reap_stray_sleeper(pid);
}

fn timeout_without_reaping(
    child: &mut os::ChildHandle,
    _limit: Option<Duration>,
) -> io::Result<()> {
    // SAFETY: a zeroed siginfo_t is a valid result buffer, and WNOWAIT
    // peeks at the exit without collecting it, so the child stays
    // collectable for whoever owns the handle.
    unsafe {
        let mut info: libc::siginfo_t = std::mem::zeroed();
        let _ = libc::waitid(
            libc::P_PID,
            child.pid() as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOWAIT,
        );
    }
    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        "timed out waiting for child exit",
    ))
}

#[test]
fn timed_out_stop_still_collects_a_dead_child() {
    let bindings = NativeBindings {
        wait_for_exit: timeout_without_reaping,
        ..*NativeBindings::table()
    };
    let config = LaunchConfig::new().stop_wait(WaitPolicy::Timeout(Duration::from_millis(50)));
    let launcher = Launcher::new(config);
    let mut process = launcher
        .spawn_with(bindings, sleeper_line)
        .expect("sleeper should launch");
    let pid = process.pid();
    let error = process.stop().expect_err("the wait should time out");
    assert_eq!(error.call(), "waitpid");
    assert_eq!(process.state(), ProcessState::Stopped);
    // The child had exited by the time stop abandoned its handle, so no
    // zombie may linger afterwards.
    // SAFETY: signal 0 delivers nothing and only reports existence.
    let gone = unsafe { libc::kill(pid as libc::pid_t, 0) };
    assert_eq!(gone, -1, "the killed child should be fully collected");
    assert_eq!(io::Error::last_os_error().raw_os_error(), Some(libc::ESRCH));
}

#[test]
fn stop_with_a_generous_timeout_reaps_promptly() {
    let config = LaunchConfig::new().stop_wait(WaitPolicy::Timeout(Duration::from_secs(5)));
    let launcher = Launcher::new(config);
    let mut process = launcher
        .spawn_with(*NativeBindings::table(), sleeper_line)
        .expect("sleeper should launch");
    process
        .stop()
        .expect("kill and reap should finish inside the timeout");
    assert_eq!(process.state(), ProcessState::Stopped);
}

#[test]
fn dropping_the_handle_leaves_the_child_running() {
    let launcher = Launcher::new(LaunchConfig::new());
    let process = launcher
        .spawn_with(*NativeBindings::table(), sleeper_line)
        .expect("sleeper should launch");
    let pid = process.pid();
    drop(process);
    // SAFETY: signal 0 only probes for existence.
    let alive = unsafe { libc::kill(pid as libc::pid_t, 0) };
    assert_eq!(alive, 0, "the child should outlive a dropped handle");
    reap_stray_sleeper(pid);
}
