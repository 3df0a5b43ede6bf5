//! Synchronization primitives shared between the waiter thread and the consumers of its results.

mod oneshot;

pub use oneshot::OneShot;
