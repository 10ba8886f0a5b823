//! One in-flight modification, from trigger to terminal state.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use weir::{ExecutionAttemptId, JobId, ModificationAction, ModificationId};

use crate::controller::graph::SubtaskRef;
use crate::coordination::Slot;

/// Outcome of routing one acknowledgement to a pending modification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckResult {
    /// First acknowledgement from a task in the pending set.
    Success,
    /// The task had already acknowledged.
    Duplicate,
    /// The task was never part of this modification.
    Unknown,
    /// The modification had already reached a terminal state.
    Discarded,
}

/// Where a modification ended up. `Open` is the only non-terminal state;
/// every transition out of it is one-shot and irreversible.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TerminalState {
    Open,
    Completed,
    Expired,
    Declined,
    Error,
    Discarded,
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            TerminalState::Open => "open",
            TerminalState::Completed => "completed",
            TerminalState::Expired => "expired",
            TerminalState::Declined => "declined",
            TerminalState::Error => "error",
            TerminalState::Discarded => "discarded",
        };
        write!(f, "{}", s)
    }
}

/// Cancels the deadline timer of a modification once it goes terminal. The
/// timer still fires, but finds the flag set and does nothing.
#[derive(Clone, Debug, Default)]
pub struct DeadlineHandle {
    cancelled: Arc<AtomicBool>,
}

impl DeadlineHandle {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A triggered modification that has not yet reached a terminal state.
#[derive(Debug)]
pub struct PendingModification {
    job: JobId,
    id: ModificationId,
    description: String,
    action: ModificationAction,
    /// Wall-clock at creation, milliseconds since the epoch.
    trigger_timestamp: u64,
    started: Instant,
    /// Tasks that still have to acknowledge. `pending ∪ acknowledged` is the
    /// set fixed at creation.
    pending: HashSet<ExecutionAttemptId>,
    acknowledged: HashSet<ExecutionAttemptId>,
    state: TerminalState,
    deadline: DeadlineHandle,
    /// Slots reserved for this modification's restarts, released if it
    /// terminates unsuccessfully.
    reserved_slots: Vec<(SubtaskRef, Slot)>,
}

impl PendingModification {
    /// Create a modification waiting on `acks`. An empty ack set would be
    /// vacuously complete, so it is rejected outright.
    pub fn new(
        job: JobId,
        id: ModificationId,
        trigger_timestamp: u64,
        description: String,
        action: ModificationAction,
        acks: HashSet<ExecutionAttemptId>,
    ) -> Result<Self, failure::Error> {
        ensure!(
            !acks.is_empty(),
            "refusing to create modification {} with an empty ack set",
            id
        );

        Ok(PendingModification {
            job,
            id,
            description,
            action,
            trigger_timestamp,
            started: Instant::now(),
            pending: acks,
            acknowledged: HashSet::new(),
            state: TerminalState::Open,
            deadline: DeadlineHandle::new(),
            reserved_slots: Vec::new(),
        })
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn id(&self) -> ModificationId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn action(&self) -> ModificationAction {
        self.action
    }

    pub fn trigger_timestamp(&self) -> u64 {
        self.trigger_timestamp
    }

    pub fn state(&self) -> TerminalState {
        self.state
    }

    pub fn is_discarded(&self) -> bool {
        self.state != TerminalState::Open
    }

    pub fn deadline_handle(&self) -> DeadlineHandle {
        self.deadline.clone()
    }

    pub fn reserve_slot(&mut self, subtask: SubtaskRef, slot: Slot) {
        self.reserved_slots.push((subtask, slot));
    }

    pub fn take_reserved_slots(&mut self) -> Vec<(SubtaskRef, Slot)> {
        std::mem::replace(&mut self.reserved_slots, Vec::new())
    }

    /// Route one acknowledgement.
    pub fn acknowledge_task(&mut self, attempt: ExecutionAttemptId) -> AckResult {
        if self.state != TerminalState::Open {
            return AckResult::Discarded;
        }
        if self.pending.remove(&attempt) {
            self.acknowledged.insert(attempt);
            return AckResult::Success;
        }
        if self.acknowledged.contains(&attempt) {
            AckResult::Duplicate
        } else {
            AckResult::Unknown
        }
    }

    pub fn is_fully_acknowledged(&self) -> bool {
        self.pending.is_empty()
    }

    /// The full set fixed at creation: still-pending and already-acknowledged
    /// tasks together.
    pub fn participants(&self) -> HashSet<ExecutionAttemptId> {
        self.pending.union(&self.acknowledged).cloned().collect()
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    fn transition(&mut self, to: TerminalState) -> bool {
        if self.state != TerminalState::Open {
            // terminal states are absorbing
            return false;
        }
        self.state = to;
        self.deadline.cancel();
        true
    }

    /// Close out a fully acknowledged modification. Returns the completion
    /// record, or `None` if acknowledgements are still missing or the
    /// modification already went terminal.
    pub fn finalize(&mut self) -> Option<CompletedModification> {
        if !self.is_fully_acknowledged() || !self.transition(TerminalState::Completed) {
            return None;
        }
        Some(CompletedModification {
            job: self.job,
            id: self.id,
            description: self.description.clone(),
            action: self.action,
            acknowledged: self.acknowledged.clone(),
            duration_ms: self.started.elapsed().as_millis() as u64,
        })
    }

    pub fn abort_expired(&mut self) -> bool {
        self.transition(TerminalState::Expired)
    }

    pub fn abort_declined(&mut self) -> bool {
        self.transition(TerminalState::Declined)
    }

    pub fn abort_error(&mut self) -> bool {
        self.transition(TerminalState::Error)
    }

    pub fn discard(&mut self) -> bool {
        self.transition(TerminalState::Discarded)
    }
}

/// Snapshot of a modification after all acknowledgements arrived.
#[derive(Clone, Debug)]
pub struct CompletedModification {
    pub job: JobId,
    pub id: ModificationId,
    pub description: String,
    pub action: ModificationAction,
    pub acknowledged: HashSet<ExecutionAttemptId>,
    pub duration_ms: u64,
}
