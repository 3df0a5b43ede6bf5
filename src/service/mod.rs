//! The service module is the continuation bridge on top of [crate::ring]. A [RingService] owns a
//! single [crate::ring::Ring] confined to a dedicated waiter thread, callers on any other thread
//! hand it owned [Operation]s together with a [Continuation] and are resumed with an [Outcome]
//! once the kernel is done.
//!
//! The typed helpers on [RingService] return [Submission] futures, which can be awaited on any
//! executor:
//!
//! ```no_run
//! use futures::executor::block_on;
//!
//! use libring::service::RingService;
//!
//! let service = RingService::new()?;
//! let pool = block_on(service.create_buffer_pool(16, 4096))?;
//! # let fd = 0;
//! let (slot, len) = block_on(service.recv_pooled(fd, &pool))?;
//! pool.with_slot(slot, |bytes| println!("{:?}", &bytes[..len]))?;
//! block_on(service.recycle(&pool, slot))?;
//! # Ok::<(), libring::Error>(())
//! ```

mod continuation;
mod handle;
mod operation;
mod pool;
mod submission;
mod waiter;

pub use continuation::{Callback, Continuation, Posted};
pub use handle::{RingService, ServiceBuilder};
pub use operation::{Operation, Outcome};
pub use pool::PoolHandle;
pub use submission::Submission;
