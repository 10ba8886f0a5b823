//! The messages that travel on data channels.
//!
//! Records and control markers share the same channels, so both are variants
//! of one [`StreamMessage`] enum and receivers dispatch exhaustively. Markers
//! are broadcast to every outgoing channel of a chain and preserve FIFO order
//! with the records already queued; that ordering is what makes a marker a
//! meaningful point in the stream.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;

use weir::{
    CheckpointId, DataType, ExecutionAttemptId, InputChannelDescriptor, ModificationAction,
    ModificationMetadata, VertexId,
};

/// A single record in flight, with the event timestamp it carries (if its
/// source assigned one).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub row: Vec<DataType>,
    pub timestamp: Option<u64>,
}

impl StreamRecord {
    pub fn new(row: Vec<DataType>) -> Self {
        StreamRecord {
            row,
            timestamp: None,
        }
    }

    pub fn with_timestamp(row: Vec<DataType>, timestamp: u64) -> Self {
        StreamRecord {
            row,
            timestamp: Some(timestamp),
        }
    }
}

/// A low watermark: no records with timestamps at or below this will follow
/// on this channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Watermark(pub u64);

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "wm@{}", self.0)
    }
}

/// A latency probe injected at a source; forwarded along exactly one path so
/// that measured latencies are not multiplied by fan-out.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LatencyMarker {
    pub marked_at: u64,
    pub origin: VertexId,
    pub subtask: usize,
}

/// Whether a chain is currently producing records.
///
/// Watermarks explicitly generated by operators in the chain are blocked and
/// not forwarded while the status is [`StreamStatus::Idle`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum StreamStatus {
    Active,
    Idle,
}

impl StreamStatus {
    pub fn is_active(self) -> bool {
        match self {
            StreamStatus::Active => true,
            StreamStatus::Idle => false,
        }
    }
}

/// Identifies a side output of an operator.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct OutputTag {
    id: String,
}

impl OutputTag {
    pub fn new<S: ToString>(id: S) -> Self {
        OutputTag { id: id.to_string() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Options attached to a checkpoint barrier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CheckpointOptions {
    /// A periodic checkpoint.
    Checkpoint,
    /// An externally requested savepoint.
    Savepoint,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        CheckpointOptions::Checkpoint
    }
}

/// An in-band control event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Marker {
    /// Delimits a checkpoint epoch; also the synchronization point for
    /// pause-on-checkpoint.
    CheckpointBarrier {
        id: CheckpointId,
        timestamp: u64,
        options: CheckpointOptions,
    },

    /// Abort the checkpoint carrying `id`.
    CancelCheckpoint { id: CheckpointId },

    /// Command the indicated downstream subtasks (by parallel subtask index)
    /// to pause or stop at the next checkpoint.
    StartModification {
        metadata: ModificationMetadata,
        acks: HashSet<ExecutionAttemptId>,
        subtasks_to_pause: HashSet<usize>,
        action: ModificationAction,
    },

    /// Richer variant used for migration. Spillers are told which output
    /// subtask indices to spill to disk; stoppers carry the replacement
    /// input-channel descriptors to hand to their downstream peers.
    StartMigration {
        metadata: ModificationMetadata,
        spilling: HashMap<ExecutionAttemptId, HashSet<usize>>,
        stopping: HashMap<ExecutionAttemptId, Vec<InputChannelDescriptor>>,
        /// The checkpoint the migration is anchored to, or `None` to modify
        /// immediately.
        upcoming_checkpoint: Option<CheckpointId>,
    },

    /// Rescind an earlier in-flight modification.
    CancelModification {
        metadata: ModificationMetadata,
        vertices: HashSet<ExecutionAttemptId>,
    },

    /// Emitted downstream by a paused operator; carries the replacement
    /// input-channel descriptor for one downstream subtask.
    OperatorPaused { descriptor: InputChannelDescriptor },
}

impl Marker {
    /// The modification envelope, for the marker kinds that carry one.
    pub fn metadata(&self) -> Option<&ModificationMetadata> {
        match *self {
            Marker::StartModification { ref metadata, .. }
            | Marker::StartMigration { ref metadata, .. }
            | Marker::CancelModification { ref metadata, .. } => Some(metadata),
            _ => None,
        }
    }

    pub fn is_checkpoint_related(&self) -> bool {
        match *self {
            Marker::CheckpointBarrier { .. } | Marker::CancelCheckpoint { .. } => true,
            _ => false,
        }
    }
}

/// One frame on a data channel.
#[derive(Clone, Serialize, Deserialize)]
pub enum StreamMessage {
    Record(StreamRecord),
    Watermark(Watermark),
    LatencyMarker(LatencyMarker),
    StatusChange(StreamStatus),
    Marker(Marker),
}

impl StreamMessage {
    pub fn is_record(&self) -> bool {
        match *self {
            StreamMessage::Record(..) => true,
            _ => false,
        }
    }

    pub fn is_marker(&self) -> bool {
        match *self {
            StreamMessage::Marker(..) => true,
            _ => false,
        }
    }

    pub fn as_record(&self) -> Option<&StreamRecord> {
        match *self {
            StreamMessage::Record(ref r) => Some(r),
            _ => None,
        }
    }

    pub fn as_marker(&self) -> Option<&Marker> {
        match *self {
            StreamMessage::Marker(ref m) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Debug for StreamMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StreamMessage::Record(ref r) => write!(f, "Record({} cols)", r.row.len()),
            StreamMessage::Watermark(wm) => write!(f, "{}", wm),
            StreamMessage::LatencyMarker(ref m) => write!(f, "Latency(@{})", m.marked_at),
            StreamMessage::StatusChange(s) => write!(f, "StatusChange({:?})", s),
            StreamMessage::Marker(ref m) => match *m {
                Marker::CheckpointBarrier { id, .. } => write!(f, "Barrier({})", id),
                Marker::CancelCheckpoint { id } => write!(f, "CancelCheckpoint({})", id),
                ref m => match m.metadata() {
                    Some(meta) => write!(
                        f,
                        "Marker({:?}, {})",
                        mem::discriminant(m),
                        meta.modification
                    ),
                    None => write!(f, "Marker({:?})", mem::discriminant(m)),
                },
            },
        }
    }
}
