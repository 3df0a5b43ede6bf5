use std::io::Write;

use nix::libc;
use tempfile::NamedTempFile;
use tracing::Level;

use crate::{ring::Ring, service::RingService, Error};

/// Whether the error means the kernel, or a sandbox around it, refuses io_uring altogether.
pub(crate) fn unavailable(err: &Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOSYS) | Some(libc::EPERM) | Some(libc::EACCES)
    )
}

/// Route log output through the test harness, so it only shows up for failing tests.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Build a ring for a test, or `None` when io_uring isn't available on this machine.
pub(crate) fn ring(depth: u32) -> Option<Ring> {
    init_tracing();
    match Ring::new(depth) {
        Ok(ring) => Some(ring),
        Err(ref err) if unavailable(err) => {
            eprintln!("io_uring unavailable, skipping: {}", err);
            None
        }
        Err(err) => panic!("failed to set up ring: {}", err),
    }
}

pub(crate) fn file_with(contents: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(contents).expect("failed to write temp file");
    file.flush().expect("failed to flush temp file");
    file
}

/// Start a service for a test, or `None` when io_uring isn't available on this machine.
pub(crate) fn service(depth: u32) -> Option<RingService> {
    init_tracing();
    match RingService::builder().depth(depth).build() {
        Ok(service) => Some(service),
        Err(ref err) if unavailable(err) => {
            eprintln!("io_uring unavailable, skipping: {}", err);
            None
        }
        Err(err) => panic!("failed to start service: {}", err),
    }
}
