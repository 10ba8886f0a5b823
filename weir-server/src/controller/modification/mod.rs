//! The modification coordinator: the per-job registry of pending, completed,
//! and failed modifications, and the intake for task replies.
//!
//! The coordinator is multi-threaded. One mutex (the *registry lock*)
//! serializes every mutation of the modification maps; a second one orders
//! trigger invocations and is always acquired first. Expiry deadlines fire on
//! a dedicated timer thread and re-take the registry lock. No RPC is ever
//! issued while holding either lock -- replies can race triggers, and the
//! registry policies below are written for that.

mod pending;
mod timer;

pub use self::pending::{AckResult, CompletedModification, PendingModification, TerminalState};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use fnv::FnvHashMap;
use slog::Logger;

use weir::{
    ExecutionAttemptId, JobId, ModificationId, ModificationReply, ReplyKind, SubtaskState,
};

use self::timer::DeadlineTimer;
use crate::controller::graph::{ExecutionGraph, ExecutionState, SubtaskRef};
use crate::coordination::{CheckpointIdCounter, Slot, SlotProvider, TaskManagerGateway};
use crate::Config;

pub(crate) fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The single stopped subtask of a `Stopping` modification, kept so the
/// restart engine can correlate the state that arrives later.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StoppedSubtask {
    pub(crate) subtask: SubtaskRef,
    pub(crate) attempt: ExecutionAttemptId,
    pub(crate) subtask_index: usize,
}

/// Everything guarded by the registry lock.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) pending: FnvHashMap<ModificationId, PendingModification>,
    pub(crate) completed: FnvHashMap<ModificationId, CompletedModification>,
    pub(crate) failed: FnvHashMap<ModificationId, PendingModification>,
    /// Snapshots received from paused subtasks, consumed exactly once by the
    /// restart engine.
    pub(crate) stored_state: HashMap<ExecutionAttemptId, SubtaskState>,
    /// Paused subtasks awaiting restart, keyed by the attempt that paused.
    pub(crate) vertex_to_restart: HashMap<ExecutionAttemptId, SubtaskRef>,
    /// In-flight single-subtask stops, keyed by modification.
    pub(crate) stops: FnvHashMap<ModificationId, StoppedSubtask>,
}

impl Registry {
    /// True if this modification id has ever been observed, in any map.
    fn knows(&self, id: ModificationId) -> bool {
        self.pending.contains_key(&id)
            || self.completed.contains_key(&id)
            || self.failed.contains_key(&id)
    }

    /// Drop the restart tracking and any stored snapshots for subtasks whose
    /// reservations were just given back. A subtask whose migration
    /// terminated unsuccessfully keeps running in place; a later `Paused`
    /// report must find nothing to restart.
    pub(crate) fn forget_restarts(&mut self, reserved: &[(SubtaskRef, Slot)]) {
        let attempts: Vec<ExecutionAttemptId> = self
            .vertex_to_restart
            .iter()
            .filter(|&(_, v)| reserved.iter().any(|&(r, _)| r == *v))
            .map(|(&attempt, _)| attempt)
            .collect();
        for attempt in attempts {
            self.vertex_to_restart.remove(&attempt);
            self.stored_state.remove(&attempt);
        }
    }
}

/// The per-job live-modification coordinator.
///
/// Owned by the job's controller; everything else talks to it through the
/// trigger operations (see the `migrate` module) and the intake methods
/// below.
pub struct ModificationCoordinator {
    pub(crate) job: JobId,
    pub(crate) graph: Arc<Mutex<ExecutionGraph>>,
    pub(crate) registry: Arc<Mutex<Registry>>,
    /// Orders trigger invocations; acquired before the registry lock.
    pub(crate) trigger_lock: Mutex<()>,
    pub(crate) next_modification: AtomicU64,
    pub(crate) timer: DeadlineTimer,
    pub(crate) gateway: Arc<dyn TaskManagerGateway>,
    pub(crate) slots: Arc<dyn SlotProvider>,
    pub(crate) checkpoints: Arc<dyn CheckpointIdCounter>,
    pub(crate) config: Config,
    pub(crate) log: Logger,
}

impl ModificationCoordinator {
    pub fn new(
        graph: Arc<Mutex<ExecutionGraph>>,
        gateway: Arc<dyn TaskManagerGateway>,
        slots: Arc<dyn SlotProvider>,
        checkpoints: Arc<dyn CheckpointIdCounter>,
        config: Config,
        log: Logger,
    ) -> Self {
        let job = graph.lock().unwrap().job_id();
        let registry = Arc::new(Mutex::new(Registry::default()));

        let timer = {
            let registry = registry.clone();
            let graph = graph.clone();
            let slots = slots.clone();
            let expiry_log = log.clone();
            let timer_log = log.clone();
            DeadlineTimer::new(
                move |id: ModificationId| {
                    Self::expire(&registry, &graph, &*slots, id, &expiry_log);
                },
                timer_log,
            )
        };

        ModificationCoordinator {
            job,
            graph,
            registry,
            trigger_lock: Mutex::new(()),
            next_modification: AtomicU64::new(1),
            timer,
            gateway,
            slots,
            checkpoints,
            config,
            log,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job
    }

    pub(crate) fn next_modification_id(&self) -> ModificationId {
        ModificationId::from(self.next_modification.fetch_add(1, Ordering::SeqCst))
    }

    /// Deadline fire: if the modification is still open it expires, leaves
    /// `pending`, and is recorded in `failed` so that late messages can still
    /// be classified.
    fn expire(
        registry: &Mutex<Registry>,
        graph: &Mutex<ExecutionGraph>,
        slots: &dyn SlotProvider,
        id: ModificationId,
        log: &Logger,
    ) {
        let reserved = {
            let mut registry = registry.lock().unwrap();
            match registry.pending.remove(&id) {
                Some(mut pm) => {
                    info!(log, "modification expired before completing";
                          "modification" => %id,
                          "description" => pm.description().to_owned(),
                          "missing-acks" => pm.num_pending());
                    pm.abort_expired();
                    let reserved = pm.take_reserved_slots();
                    registry.stops.remove(&id);
                    registry.forget_restarts(&reserved);
                    registry.failed.insert(id, pm);
                    reserved
                }
                None => {
                    debug!(log, "expired modification already completed"; "modification" => %id);
                    return;
                }
            }
        };
        Self::release_reservations(graph, slots, reserved, log);
    }

    /// Return reserved slots to the provider and clear the matching future
    /// slots. Called on every unsuccessful terminal transition of a
    /// modification that pre-allocated slots.
    pub(crate) fn release_reservations(
        graph: &Mutex<ExecutionGraph>,
        slots: &dyn SlotProvider,
        reserved: Vec<(SubtaskRef, Slot)>,
        log: &Logger,
    ) {
        if reserved.is_empty() {
            return;
        }
        let mut graph = graph.lock().unwrap();
        for (subtask, slot) in reserved {
            graph.cancel_migration_preparation(subtask);
            debug!(log, "released reserved slot"; "slot" => %slot);
            slots.release_slot(&slot);
        }
    }

    // ------------------------------------------------------------------
    //  intake
    // ------------------------------------------------------------------

    /// Route one task reply to the matching handler.
    pub fn receive(&self, reply: ModificationReply) -> bool {
        let ModificationReply {
            job,
            attempt,
            modification,
            kind,
        } = reply;
        match kind {
            ReplyKind::Acknowledge => self.receive_acknowledge(job, attempt, modification),
            ReplyKind::Decline { reason } => {
                self.receive_decline(job, attempt, modification, reason);
                true
            }
            ReplyKind::Ignore => {
                self.receive_ignore(job, attempt, modification);
                true
            }
            ReplyKind::StateMigration { state } => {
                self.receive_state_migration(job, attempt, modification, state);
                true
            }
        }
    }

    /// An acknowledgement from a task. Returns whether the modification was
    /// ever known to this coordinator.
    pub fn receive_acknowledge(
        &self,
        job: JobId,
        attempt: ExecutionAttemptId,
        modification: ModificationId,
    ) -> bool {
        if job != self.job {
            error!(self.log, "acknowledge for wrong job";
                   "job" => %job, "expected" => %self.job, "modification" => %modification);
            return false;
        }

        let restart;
        {
            let mut registry = self.registry.lock().unwrap();
            match registry.pending.get_mut(&modification) {
                Some(pm) => {
                    match pm.acknowledge_task(attempt) {
                        AckResult::Success => {
                            debug!(self.log, "acknowledged";
                                   "modification" => %modification, "task" => %attempt);
                            if pm.is_fully_acknowledged() {
                                Self::complete_pending(&mut registry, modification, &self.log);
                            }
                        }
                        AckResult::Duplicate => {
                            debug!(self.log, "duplicate acknowledge";
                                   "modification" => %modification, "task" => %attempt);
                        }
                        AckResult::Unknown => {
                            warn!(self.log, "acknowledge from task outside the pending set";
                                  "modification" => %modification, "task" => %attempt);
                        }
                        AckResult::Discarded => {
                            // a discarded record may never sit in `pending`
                            drop(registry);
                            self.graph.lock().unwrap().fail_global(format_err!(
                                "received message for discarded but non-removed modification {}",
                                modification
                            ));
                            return true;
                        }
                    }
                    restart = registry.vertex_to_restart.get(&attempt).cloned();
                }
                None => {
                    let known = if registry.completed.contains_key(&modification) {
                        info!(self.log, "late acknowledge for completed modification";
                              "modification" => %modification, "task" => %attempt);
                        true
                    } else if registry.failed.contains_key(&modification) {
                        debug!(self.log, "acknowledge for failed modification";
                               "modification" => %modification, "task" => %attempt);
                        true
                    } else {
                        debug!(self.log, "acknowledge for unknown modification";
                               "modification" => %modification, "task" => %attempt);
                        false
                    };
                    return known;
                }
            }
        }

        if let Some(subtask) = restart {
            self.restart_if_stopped_and_state_received(subtask);
        }
        true
    }

    /// A task refused to take part; the modification is discarded and not
    /// retried.
    pub fn receive_decline(
        &self,
        job: JobId,
        attempt: ExecutionAttemptId,
        modification: ModificationId,
        reason: Option<String>,
    ) {
        if job != self.job {
            error!(self.log, "decline for wrong job";
                   "job" => %job, "expected" => %self.job, "modification" => %modification);
            return;
        }
        let reason = reason.unwrap_or_default();

        let reserved = {
            let mut registry = self.registry.lock().unwrap();
            match registry.pending.remove(&modification) {
                Some(mut pm) => {
                    info!(self.log, "discarding modification because a task declined";
                          "modification" => %modification,
                          "task" => %attempt,
                          "reason" => &reason);
                    pm.abort_declined();
                    let reserved = pm.take_reserved_slots();
                    registry.stops.remove(&modification);
                    registry.forget_restarts(&reserved);
                    registry.failed.insert(modification, pm);
                    reserved
                }
                None => {
                    if registry.failed.contains_key(&modification) {
                        debug!(self.log, "another decline for failed modification";
                               "modification" => %modification, "reason" => &reason);
                    } else {
                        debug!(self.log, "decline for unknown modification";
                               "modification" => %modification, "reason" => &reason);
                    }
                    return;
                }
            }
        };
        Self::release_reservations(&self.graph, &*self.slots, reserved, &self.log);
    }

    /// A task did not participate meaningfully; logged only.
    pub fn receive_ignore(
        &self,
        job: JobId,
        attempt: ExecutionAttemptId,
        modification: ModificationId,
    ) {
        if job != self.job {
            error!(self.log, "ignore for wrong job";
                   "job" => %job, "expected" => %self.job, "modification" => %modification);
            return;
        }

        let registry = self.registry.lock().unwrap();
        if registry.pending.contains_key(&modification) {
            info!(self.log, "task ignored modification";
                  "modification" => %modification, "task" => %attempt);
        } else if registry.knows(modification) {
            debug!(self.log, "ignore for finished modification";
                   "modification" => %modification, "task" => %attempt);
        } else {
            debug!(self.log, "ignore for unknown modification";
                   "modification" => %modification, "task" => %attempt);
        }
    }

    /// A paused subtask shipped its snapshot. Stored unconditionally
    /// (duplicates overwrite), then the restart guard is re-checked.
    pub fn receive_state_migration(
        &self,
        job: JobId,
        attempt: ExecutionAttemptId,
        modification: ModificationId,
        state: SubtaskState,
    ) {
        if job != self.job {
            error!(self.log, "state migration for wrong job";
                   "job" => %job, "expected" => %self.job, "modification" => %modification);
            return;
        }

        let restart;
        {
            let mut registry = self.registry.lock().unwrap();
            if registry.stored_state.insert(attempt, state).is_some() {
                info!(self.log, "duplicate state for task; replaced previous";
                      "modification" => %modification, "task" => %attempt);
            } else {
                info!(self.log, "stored migrated state";
                      "modification" => %modification, "task" => %attempt);
            }

            if !registry.knows(modification) {
                debug!(self.log, "state migration for unknown modification";
                       "modification" => %modification, "task" => %attempt);
            }
            restart = registry.vertex_to_restart.get(&attempt).cloned();
        }

        if let Some(subtask) = restart {
            self.restart_if_stopped_and_state_received(subtask);
        }
    }

    /// A task reported an execution-state change.
    pub fn vertex_updated_state(&self, attempt: ExecutionAttemptId, state: ExecutionState) {
        let tracked = {
            let registry = self.registry.lock().unwrap();
            registry.vertex_to_restart.get(&attempt).cloned()
        };

        let subtask = match tracked {
            Some(subtask) => subtask,
            None => {
                debug!(self.log, "state update for vertex not awaiting restart";
                       "task" => %attempt, "state" => %state);
                return;
            }
        };

        match state {
            ExecutionState::Running
            | ExecutionState::Finished
            | ExecutionState::Canceled
            | ExecutionState::Failed
            | ExecutionState::Pausing
            | ExecutionState::Resuming => {
                self.graph.lock().unwrap().set_execution_state(subtask, state);
            }
            ExecutionState::Paused => {
                self.graph.lock().unwrap().set_execution_state(subtask, state);
                self.restart_if_stopped_and_state_received(subtask);
            }
            illegal => {
                self.graph.lock().unwrap().fail_global(format_err!(
                    "task manager sent illegal state update {} for {}",
                    illegal,
                    attempt
                ));
            }
        }
    }

    /// Move a fully acknowledged modification out of `pending`. Must be
    /// called with the registry lock held.
    pub(crate) fn complete_pending(registry: &mut Registry, id: ModificationId, log: &Logger) {
        let mut pm = match registry.pending.remove(&id) {
            Some(pm) => pm,
            None => return,
        };

        match pm.finalize() {
            Some(completed) => {
                info!(log, "completed modification";
                      "modification" => %id,
                      "description" => completed.description.clone(),
                      "ms" => completed.duration_ms);
                registry.completed.insert(id, completed);
            }
            None => {
                info!(log, "modification failed to finalize"; "modification" => %id);
                registry.failed.insert(id, pm);
            }
        }
    }

    // ------------------------------------------------------------------
    //  diagnostics
    // ------------------------------------------------------------------

    /// One line per subtask: attempt id, worker location, task name.
    pub fn worker_details(&self) -> String {
        self.graph.lock().unwrap().worker_details()
    }

    /// The completion records collected so far.
    pub fn completed_modifications(&self) -> Vec<CompletedModification> {
        let registry = self.registry.lock().unwrap();
        registry.completed.values().cloned().collect()
    }
}
