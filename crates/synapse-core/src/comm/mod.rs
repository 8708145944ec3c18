//! Cross-device communication primitives.
//!
//! Sharded layers never assume an ambient process group. Instead they hold an
//! explicit [`Communicator`] describing the model-parallel group they belong
//! to:
//! - [`SingleProcess`] - world size 1, every collective is the identity
//! - [`ThreadGroup`] - in-process rendezvous group for multi-rank tests and
//!   demos without real devices

mod group;
mod local;

pub use group::{Communicator, SingleProcess};
pub use local::{ThreadGroup, ThreadGroupHandle};
