//! The in-task data plane of weir.
//!
//! Every running task owns an *operator chain*: an ordered pipeline of
//! operators that share the task's mailbox thread, wired together through
//! inlined collectors and terminating in one network output per outgoing
//! edge. The chain is also the task's control path -- the coordinator's
//! modification markers are broadcast along the same channels as records, in
//! FIFO order, so that downstream tasks observe control events at a
//! well-defined point in the stream.
//!
//! The two halves of this crate:
//!
//!  - [`payload`] defines [`StreamMessage`], the frame type carried on every
//!    data channel, and [`Marker`], the in-band control events (checkpoint
//!    barriers, start-modification, start-migration, cancel-modification, and
//!    operator-paused markers).
//!  - [`chain`] implements the operator chain itself: chained emission with
//!    and without object reuse, tag-gated side outputs, broadcast fan-out,
//!    stream-status tracking, and the `broadcast_*` control operations.

#![deny(unused_extern_crates)]

#[macro_use]
extern crate failure;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate slog;

pub mod chain;
pub mod ops;
pub mod payload;
pub mod prelude;

pub use crate::chain::{
    ChainError, Collector, OperatorChain, OperatorChainBuilder, Partitioner, RecordWriterOutput,
    StreamOperator,
};
pub use crate::payload::{
    CheckpointOptions, LatencyMarker, Marker, OutputTag, StreamMessage, StreamRecord,
    StreamStatus, Watermark,
};
