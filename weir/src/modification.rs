//! Wire messages exchanged between tasks and the modification coordinator.
//!
//! There are two directions. Tasks report back to the coordinator with a
//! [`ModificationReply`]; the coordinator commands tasks with a
//! [`TaskRequest`]. Both are single tagged enums so that receivers dispatch
//! exhaustively. All messages are carried as length-prefixed bincode frames
//! (see [`channel`](crate::channel)).

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::internal::{
    ExecutionAttemptId, InputChannelDescriptor, InputGateDescriptor, JobId, ModificationId,
    ResultPartitionId, WorkerLocation,
};
use crate::CheckpointId;

/// The envelope every control marker and trigger carries: which modification
/// it belongs to, and when the coordinator created it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModificationMetadata {
    pub modification: ModificationId,
    /// Coordinator wall-clock at trigger time, in milliseconds since the
    /// epoch.
    pub timestamp: u64,
}

/// What the indicated subtasks should do once the modification reaches them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ModificationAction {
    /// Suspend the target subtasks in place; used when introducing operators
    /// into the running job.
    Pausing,
    /// Stop the target subtasks and migrate their state to new slots.
    Stopping,
}

impl fmt::Display for ModificationAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ModificationAction::Pausing => write!(f, "pausing"),
            ModificationAction::Stopping => write!(f, "stopping"),
        }
    }
}

/// The snapshot a paused subtask took at its checkpoint boundary.
///
/// The snapshot bytes are opaque to the coordinator; it only stores and
/// forwards them.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SubtaskState {
    /// The checkpoint this snapshot is anchored to.
    pub checkpoint: CheckpointId,
    /// Serialized operator state.
    pub snapshot: Vec<u8>,
}

impl SubtaskState {
    pub fn size(&self) -> usize {
        self.snapshot.len()
    }
}

/// State handed to a restarted execution as its initial state.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskStateHandles {
    subtask: SubtaskState,
}

impl TaskStateHandles {
    pub fn new(subtask: SubtaskState) -> Self {
        TaskStateHandles { subtask }
    }

    pub fn subtask_state(&self) -> &SubtaskState {
        &self.subtask
    }
}

/// A task's reply to an in-flight modification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModificationReply {
    pub job: JobId,
    pub attempt: ExecutionAttemptId,
    pub modification: ModificationId,
    pub kind: ReplyKind,
}

/// The four reply kinds, handled exhaustively by the coordinator's intake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReplyKind {
    /// The task has performed its part of the modification.
    Acknowledge,
    /// The task refuses to take part; the coordinator discards the
    /// modification.
    Decline {
        reason: Option<String>,
    },
    /// The task did not participate meaningfully (e.g. it is not in the
    /// pausing set); logged only.
    Ignore,
    /// The task paused at its checkpoint boundary and ships its snapshot.
    StateMigration {
        state: SubtaskState,
    },
}

impl fmt::Display for ModificationReply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ReplyKind::Acknowledge => "acknowledge",
            ReplyKind::Decline { .. } => "decline",
            ReplyKind::Ignore => "ignore",
            ReplyKind::StateMigration { .. } => "state-migration",
        };
        write!(
            f,
            "{} for {} from {} of {}",
            kind, self.modification, self.attempt, self.job
        )
    }
}

/// Everything a worker needs to bring up one task execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDeploymentDescriptor {
    pub job: JobId,
    pub attempt: ExecutionAttemptId,
    /// Index of the reserved slot on the target worker.
    pub slot_index: usize,
    /// One gate per consumed result.
    pub input_gates: Vec<InputGateDescriptor>,
    /// State to restore before the task starts processing, if any.
    pub initial_state: Option<TaskStateHandles>,
}

/// A coordinator-to-task command.
///
/// These are delivered over the worker's control connection; the in-band
/// control *markers* that fan out along the data channels are built by the
/// receiving task's operator chain in response to the trigger variants here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TaskRequest {
    /// Resume a previously paused task.
    Resume {
        job: JobId,
        attempt: ExecutionAttemptId,
    },
    /// Broadcast a start-modification marker downstream.
    TriggerModification {
        job: JobId,
        attempt: ExecutionAttemptId,
        metadata: ModificationMetadata,
        acks: HashSet<ExecutionAttemptId>,
        subtasks_to_pause: HashSet<usize>,
        action: ModificationAction,
        upcoming_checkpoint: Option<CheckpointId>,
    },
    /// Broadcast a start-migration marker downstream.
    TriggerMigration {
        job: JobId,
        attempt: ExecutionAttemptId,
        metadata: ModificationMetadata,
        spilling: HashMap<ExecutionAttemptId, HashSet<usize>>,
        stopping: HashMap<ExecutionAttemptId, Vec<InputChannelDescriptor>>,
        upcoming_checkpoint: Option<CheckpointId>,
    },
    /// Rescind an earlier, still in-flight modification.
    TriggerCancelModification {
        job: JobId,
        attempt: ExecutionAttemptId,
        metadata: ModificationMetadata,
        vertices: HashSet<ExecutionAttemptId>,
    },
    /// Resume a paused task with one input replaced (the input that used to
    /// come from the stopped subtask).
    ResumeWithDifferentInputs {
        job: JobId,
        attempt: ExecutionAttemptId,
        stopped_subtask: usize,
        input_gates: Vec<InputGateDescriptor>,
    },
    /// Resume a paused task with an entirely new input set.
    ResumeWithNewInput {
        job: JobId,
        attempt: ExecutionAttemptId,
        input_gates: Vec<InputGateDescriptor>,
    },
    /// Rewire a single input channel of a running task to a new upstream
    /// partition, without redeploying the task.
    ConsumeNewProducer {
        job: JobId,
        attempt: ExecutionAttemptId,
        new_producer: ExecutionAttemptId,
        partition: ResultPartitionId,
        location: WorkerLocation,
        connection_index: usize,
        /// Which input channel of the consumer to replace.
        channel_index: usize,
    },
    /// Bring up a task execution in a reserved slot.
    Deploy(TaskDeploymentDescriptor),
}

impl TaskRequest {
    /// The execution attempt this request addresses. Requests are idempotent
    /// at the task side by this id.
    pub fn attempt(&self) -> ExecutionAttemptId {
        match *self {
            TaskRequest::Resume { attempt, .. }
            | TaskRequest::TriggerModification { attempt, .. }
            | TaskRequest::TriggerMigration { attempt, .. }
            | TaskRequest::TriggerCancelModification { attempt, .. }
            | TaskRequest::ResumeWithDifferentInputs { attempt, .. }
            | TaskRequest::ResumeWithNewInput { attempt, .. }
            | TaskRequest::ConsumeNewProducer { attempt, .. } => attempt,
            TaskRequest::Deploy(ref d) => d.attempt,
        }
    }

    pub fn is_trigger(&self) -> bool {
        match *self {
            TaskRequest::TriggerModification { .. }
            | TaskRequest::TriggerMigration { .. }
            | TaskRequest::TriggerCancelModification { .. } => true,
            _ => false,
        }
    }
}
