//! The names almost everything in this crate wants in scope.

pub use weir::{
    CheckpointId, DataType, ExecutionAttemptId, InputChannelDescriptor, JobId, ModificationAction,
    ModificationId, ModificationMetadata, VertexId,
};

pub use crate::chain::{
    ChainError, Collector, OperatorChain, OperatorChainBuilder, Partitioner, RecordWriterOutput,
    StreamOperator,
};
pub use crate::payload::{
    CheckpointOptions, LatencyMarker, Marker, OutputTag, StreamMessage, StreamRecord,
    StreamStatus, Watermark,
};
