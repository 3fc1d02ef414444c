//! Single-threaded reactors and their helpers.
//!
//! A [`Reactor`] is a FIFO, post-only task queue owned by exactly one
//! thread; it is the sole enforcer of single-threaded execution for
//! every continuation that targets it. [`AsyncBridge`] lets the owning
//! thread await one async operation synchronously by draining tasks one
//! at a time, and [`AsyncLoop`] tallies fan-out completions.

mod async_loop;
mod bridge;
mod reactor;

pub use async_loop::AsyncLoop;
pub use bridge::AsyncBridge;
pub use reactor::Reactor;
