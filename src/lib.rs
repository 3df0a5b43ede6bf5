//! # libring
//!
//! A completion based asynchronous I/O core built directly on `io_uring`. Operations are staged
//! on a ring, handed to the kernel in batches, and come back in any order tagged with the token
//! they were submitted with. The package is split up into a handful of modules each handling a
//! specific layer:
//!
//! - [ring] is the queue engine: strictly accounted submission, completion retrieval and
//!   acknowledgement on top of [io_uring::IoUring].
//! - [buffer] provides kernel selected buffer pools, where the kernel picks the buffer an inbound
//!   operation lands in.
//! - [correlation] maps the token of a completion back to the request that produced it.
//! - [service] drives a ring from a dedicated waiter thread and resumes callers through
//!   continuations or futures.
//! - [executor] and [context] provide the execution contexts and per thread rings the above plug
//!   into.
//!
//! Working with a [ring::Ring] directly:
//!
//! ```no_run
//! use std::io::IoSliceMut;
//! use std::os::fd::AsRawFd;
//!
//! use libring::ring::{Op, Ring};
//!
//! let file = std::fs::File::open("/etc/hostname")?;
//! let mut ring = Ring::new(8)?;
//! let mut buf = vec![0u8; 64];
//! let mut bufs = [IoSliceMut::new(&mut buf)];
//!
//! // SAFETY: `bufs` outlives the completion, which is acknowledged below.
//! unsafe { ring.prepare(Op::readv(file.as_raw_fd(), &mut bufs, 0), 1)? };
//! ring.submit()?;
//!
//! let completion = ring.wait()?;
//! println!("read {} bytes", completion.result());
//! ring.acknowledge(completion);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Or letting a [service::RingService] do the waiting:
//!
//! ```no_run
//! use std::os::fd::AsRawFd;
//!
//! use futures::executor::block_on;
//!
//! use libring::RingService;
//!
//! let file = std::fs::File::open("/etc/hostname")?;
//! let service = RingService::new()?;
//! let (len, buf) = block_on(service.readv(file.as_raw_fd(), vec![0u8; 64], 0))?;
//! println!("{}", String::from_utf8_lossy(&buf[..len]));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;

pub mod buffer;
pub mod context;
pub mod correlation;
pub mod executor;
pub(crate) mod ptr;
pub mod ring;
pub mod service;
pub mod sync;

#[cfg(test)]
mod test_util;

pub use error::{Error, Result};
pub use service::{RingService, ServiceBuilder};
