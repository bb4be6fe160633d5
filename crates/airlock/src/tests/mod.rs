//! Unit tests for the airlock launch core.

#[cfg(target_os = "linux")]
mod launch_tests;
