//! This module exports a minimal message-passing API, which is encapsulated
//! by a `Communicator` trait. Implementors only need to write tagged `send`
//! and `recv` operations (plus `abort`) for a given transport layer. Two
//! transports are included: an in-process group of threads connected by
//! channels, and a pure-Rust TCP transport. The trait then provides default
//! implementations for broadcast, reduce, all-reduce, gather and barrier.
//!

mod backoff;
pub mod comm;
pub mod local;
pub mod mailbox;
pub mod tag;
pub mod tcp;
pub mod util;

pub use comm::{Communicator, ReduceOp};
pub use tag::{Channel, Direction, Envelope, NodeClass, Payload, Tag};
