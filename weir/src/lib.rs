//! Shared protocol types for [weir](https://github.com/weir-dataflow/weir).
//!
//! # What is weir?
//!
//! Weir is the live-modification layer of a streaming-dataflow engine: the
//! subsystem that, on a *running* job, re-scales operators, moves operator
//! instances between workers, and pauses or resumes portions of the topology
//! without restarting the job. Much like its namesake -- a low dam that
//! regulates the flow of a river -- weir holds back and redirects a running
//! stream without stopping it.
//!
//! A weir deployment has two halves. The *coordinator* (see the `weir-server`
//! crate) owns the execution graph of the job and drives every modification:
//! it computes which upstream subtasks must spill their output to disk, which
//! target subtasks must pause at the next checkpoint boundary, reserves
//! replacement slots, and re-plumbs input channels once migrated state has
//! arrived. The *tasks* participate through a thin control path: control
//! markers are broadcast in-band along the data channels by each task's
//! operator chain (see the `dataflow` crate), and tasks reply to the
//! coordinator with the acknowledgement messages defined in
//! [`modification`].
//!
//! This crate holds everything both halves must agree on:
//!
//!  - the opaque identifiers used to name jobs, operators, execution attempts,
//!    partitions, and workers ([`internal`]);
//!  - descriptors for result partitions and the input channels that consume
//!    them ([`internal`]);
//!  - the wire messages exchanged between tasks and the coordinator
//!    ([`modification`]);
//!  - the small record model carried on data channels ([`data`]);
//!  - the length-prefixed TCP channel layer used to carry all of the above
//!    ([`channel`]).

#![deny(unused_extern_crates)]

#[macro_use]
extern crate failure;
#[macro_use]
extern crate serde_derive;

pub mod channel;
pub mod data;
pub mod internal;
pub mod modification;

pub use crate::data::DataType;
pub use crate::internal::{
    ConnectionId, ExecutionAttemptId, InputChannelDescriptor, InputGateDescriptor, JobId,
    ModificationId, PartitionId, PartitionLocation, ResultPartitionId, VertexId, WorkerId,
    WorkerLocation,
};
pub use crate::modification::{
    ModificationAction, ModificationMetadata, ModificationReply, ReplyKind, SubtaskState,
    TaskDeploymentDescriptor, TaskRequest, TaskStateHandles,
};

/// Checkpoint identifiers are assigned by the engine's checkpoint coordinator,
/// which this crate only observes.
pub type CheckpointId = u64;
