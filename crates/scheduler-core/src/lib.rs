#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Core primitives for the `taskforge` local scheduler: task/object
//! identifiers, task specifications, resource vectors, and the worker wire
//! protocol.

pub mod ids;
pub mod message;
pub mod task;

pub use ids::{ActorId, NodeId, ObjectId, TaskId, ID_LEN};
pub use task::{ResourceVector, TaskSpec};
