#![allow(dead_code)]

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Routes crate logs to the test output; `RUST_LOG=kbridge=trace` to see them.
pub fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A pipe as (read end, write end).
pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as RawFd; 2];
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(res, 0, "pipe() failed");

    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

pub fn write_byte(fd: RawFd) {
    let buf = [1u8; 1];
    let wrote = unsafe { libc::write(fd, buf.as_ptr() as *const _, 1) };
    assert_eq!(wrote, 1, "write() failed");
}

pub fn read_byte(fd: RawFd) {
    let mut buf = [0u8; 1];
    let read = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, 1) };
    assert_eq!(read, 1, "read() failed");
}
