//! Identifiers and descriptors shared between the coordinator and the tasks.
//!
//! Everything in here crosses the wire, so it is all plain-old-data with
//! serde implementations.

mod addressing;
mod descriptors;

pub use self::addressing::{
    ExecutionAttemptId, JobId, ModificationId, PartitionId, VertexId, WorkerId,
};
pub use self::descriptors::{
    ConnectionId, InputChannelDescriptor, InputGateDescriptor, PartitionLocation,
    ResultPartitionId, WorkerLocation,
};
