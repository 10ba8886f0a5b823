//! The trigger engine: turning modification intents into pending records and
//! in-band markers.
//!
//! Triggering a modification involves a number of steps:
//!
//!  - The target subtasks are resolved and checked to be running.
//!  - For migrations, replacement slots are pre-allocated on other workers,
//!    and the spilling/stopping maps are computed from the graph.
//!  - A pending record with a deadline is registered.
//!  - The job's source tasks are commanded to broadcast the marker; it
//!    propagates downstream on the data plane from there.
//!
//! These must happen in this order: once the marker is on the wire, replies
//! race the trigger path, so the pending record has to be registered first.
//! The trigger lock serializes whole trigger invocations; the registry lock
//! is only ever taken inside it.

use std::collections::{HashMap, HashSet};

use petgraph::graph::NodeIndex;

use weir::{
    CheckpointId, ExecutionAttemptId, InputChannelDescriptor, ModificationAction,
    ModificationId, ModificationMetadata, TaskRequest, WorkerId, WorkerLocation,
};

use super::graph::{ExecutionGraph, ExecutionState, GraphError, SubtaskRef};
use super::modification::{
    unix_timestamp_millis, ModificationCoordinator, PendingModification, StoppedSubtask,
};
use crate::coordination::{ScheduledUnit, Slot};

pub(crate) mod restart;

/// Where to deliver a trigger: one source subtask and the worker hosting it.
struct SourceTarget {
    worker: WorkerLocation,
    attempt: ExecutionAttemptId,
}

/// All source subtasks of the job, with their workers. Triggers are sent
/// only to sources; downstream propagation is the data plane's job.
fn source_targets(graph: &ExecutionGraph) -> Result<Vec<SourceTarget>, failure::Error> {
    let mut targets = Vec::new();
    for node in graph.source_vertices() {
        for v in &graph.vertex(node).subtasks {
            let slot = v.current.assigned_slot.as_ref().ok_or_else(|| {
                format_err!("source subtask {} has no assigned slot", v.current_attempt())
            })?;
            targets.push(SourceTarget {
                worker: slot.location,
                attempt: v.current_attempt(),
            });
        }
    }
    ensure!(!targets.is_empty(), "job has no source vertices");
    Ok(targets)
}

/// Who spills which partitions, and which replacement channel descriptors
/// each stopping vertex carries for its downstream consumers.
fn migration_maps(
    graph: &ExecutionGraph,
    migrating: &[(SubtaskRef, ExecutionAttemptId, String)],
) -> Result<
    (
        HashMap<ExecutionAttemptId, HashSet<usize>>,
        HashMap<ExecutionAttemptId, Vec<InputChannelDescriptor>>,
    ),
    GraphError,
> {
    let mut spilling: HashMap<ExecutionAttemptId, HashSet<usize>> = HashMap::new();
    let mut stopping: HashMap<ExecutionAttemptId, Vec<InputChannelDescriptor>> = HashMap::new();

    for &(r, attempt, _) in migrating {
        if let Some(upstream) = graph.upstream_of(r.node) {
            for u in &graph.vertex(upstream).subtasks {
                spilling
                    .entry(u.current_attempt())
                    .or_insert_with(HashSet::new)
                    .insert(r.subtask);
            }
        }

        // the replacement channel descriptors each downstream subtask will
        // need once this vertex has moved
        let mut replacements = Vec::new();
        if let Some(downstream) = graph.downstream_of(r.node) {
            for subtask in 0..graph.vertex(downstream).parallelism() {
                let d = SubtaskRef {
                    node: downstream,
                    subtask,
                };
                replacements.push(graph.input_channel_for_partition(d, r.subtask)?);
            }
        }
        stopping.insert(attempt, replacements);
    }

    // a vertex that is itself migrating is not also a spiller
    for attempt in stopping.keys() {
        spilling.remove(attempt);
    }
    Ok((spilling, stopping))
}

impl ModificationCoordinator {
    /// Pause every subtask of the operator whose name contains
    /// `operator_name` (case-insensitive).
    pub fn pause_all(&self, operator_name: &str) -> Result<ModificationId, failure::Error> {
        info!(self.log, "attempting to pause all instances"; "operator" => operator_name);
        let node = self
            .graph
            .lock()
            .unwrap()
            .find_vertex_by_name(operator_name)
            .ok_or_else(|| GraphError::VertexNotFound(operator_name.to_owned()))?;
        self.pause_vertex(node)
    }

    /// Pause every subtask of the given operator.
    pub fn pause_vertex(&self, node: NodeIndex) -> Result<ModificationId, failure::Error> {
        let (description, upstream_acks, targets) = {
            let graph = self.graph.lock().unwrap();
            let name = graph.vertex(node).name.clone();
            let upstream = graph
                .upstream_of(node)
                .ok_or_else(|| GraphError::NoUpstream(name.clone()))?;
            let upstream_acks = graph
                .vertex(upstream)
                .subtasks
                .iter()
                .map(|v| v.current_attempt())
                .collect();
            let targets = (0..graph.vertex(node).parallelism())
                .map(|subtask| SubtaskRef { node, subtask })
                .collect();
            (format!("Pause {} instances", name), upstream_acks, targets)
        };

        self.trigger_modification(
            upstream_acks,
            targets,
            description,
            ModificationAction::Pausing,
            None,
        )
    }

    /// Stop a single subtask in preparation for restarting it elsewhere.
    pub fn pause_single(
        &self,
        attempt: ExecutionAttemptId,
    ) -> Result<ModificationId, failure::Error> {
        let (subtask, upstream_acks, description) = {
            let graph = self.graph.lock().unwrap();
            let r = graph
                .find_attempt(attempt)
                .ok_or_else(|| GraphError::UnknownAttempt(attempt))?;
            let name = graph.vertex(r.node).name.clone();
            let upstream = graph
                .upstream_of(r.node)
                .ok_or_else(|| GraphError::NoUpstream(name.clone()))?;
            let upstream_acks = graph
                .vertex(upstream)
                .subtasks
                .iter()
                .map(|v| v.current_attempt())
                .collect();
            (r, upstream_acks, format!("Pause single {} instance", name))
        };

        let stop = StoppedSubtask {
            subtask,
            attempt,
            subtask_index: subtask.subtask,
        };
        self.trigger_modification(
            upstream_acks,
            vec![subtask],
            description,
            ModificationAction::Stopping,
            Some(stop),
        )
    }

    /// Migrate every subtask currently hosted on `worker` to other workers.
    pub fn migrate_all_from(&self, worker: WorkerId) -> Result<ModificationId, failure::Error> {
        // find the migrating subtasks and hand out their upcoming attempt ids
        let migrating: Vec<(SubtaskRef, ExecutionAttemptId, String)> = {
            let mut graph = self.graph.lock().unwrap();
            let on_worker: Vec<SubtaskRef> = graph
                .all_subtasks()
                .into_iter()
                .filter(|&r| {
                    graph
                        .subtask(r)
                        .current
                        .assigned_slot
                        .as_ref()
                        .map(|s| s.worker() == worker)
                        .unwrap_or(false)
                })
                .collect();

            let mut migrating = Vec::with_capacity(on_worker.len());
            for r in on_worker {
                graph.prepare_for_migration(r);
                migrating.push((
                    r,
                    graph.subtask(r).current_attempt(),
                    graph.vertex(r.node).name.clone(),
                ));
            }
            migrating
        };
        ensure!(!migrating.is_empty(), "no subtasks are running on {}", worker);

        // pre-allocate replacement slots on other workers; nothing below may
        // leak them on failure
        let mut reserved: Vec<(SubtaskRef, Slot)> = Vec::new();
        for &(r, attempt, ref name) in &migrating {
            let unit = ScheduledUnit {
                attempt,
                task_name: format!("{}[{}]", name, r.subtask),
            };
            match self
                .slots
                .allocate_slot_except(&unit, self.config.queued_scheduling, worker)
            {
                Ok(slot) => {
                    self.graph
                        .lock()
                        .unwrap()
                        .assign_slot_for_migration(r, slot.clone());
                    reserved.push((r, slot));
                }
                Err(e) => {
                    Self::release_reservations(&self.graph, &*self.slots, reserved, &self.log);
                    return Err(e.into());
                }
            }
        }

        // compute who spills and who stops; any failure here must give the
        // reservations back
        let computed = {
            let graph = self.graph.lock().unwrap();
            migration_maps(&graph, &migrating)
        };
        let (spilling, stopping) = match computed {
            Ok(maps) => maps,
            Err(e) => {
                Self::release_reservations(&self.graph, &*self.slots, reserved, &self.log);
                return Err(e.into());
            }
        };

        self.trigger_migration(
            spilling,
            stopping,
            reserved,
            &migrating,
            format!("Migrating all operators from {}", worker),
        )
    }

    /// Resume every subtask whose operator name contains `operator_name`.
    pub fn resume_all(&self, operator_name: &str) -> Result<(), failure::Error> {
        info!(self.log, "attempting to resume all instances"; "operator" => operator_name);

        let targets: Vec<(WorkerLocation, ExecutionAttemptId)> = {
            let graph = self.graph.lock().unwrap();
            let needle = operator_name.to_lowercase();
            let mut targets = Vec::new();
            for r in graph.all_subtasks() {
                if !graph.vertex(r.node).name.to_lowercase().contains(&needle) {
                    continue;
                }
                let v = graph.subtask(r);
                let slot = v.current.assigned_slot.as_ref().ok_or_else(|| {
                    format_err!("subtask {} has no assigned slot", v.current_attempt())
                })?;
                targets.push((slot.location, v.current_attempt()));
            }
            targets
        };
        ensure!(
            !targets.is_empty(),
            "could not find any operator whose name contains '{}'",
            operator_name
        );

        for (worker, attempt) in targets {
            self.gateway.send_to_task(
                &worker,
                TaskRequest::Resume {
                    job: self.job,
                    attempt,
                },
                self.config.rpc_timeout,
            )?;
        }
        Ok(())
    }

    /// Resume every subtask of the given operator.
    pub fn resume_vertex(&self, node: NodeIndex) -> Result<(), failure::Error> {
        let targets: Vec<(WorkerLocation, ExecutionAttemptId)> = {
            let graph = self.graph.lock().unwrap();
            let vertex = graph.vertex(node);
            info!(self.log, "resuming all instances"; "operator" => &vertex.name);
            vertex
                .subtasks
                .iter()
                .map(|v| {
                    let slot = v.current.assigned_slot.as_ref().ok_or_else(|| {
                        format_err!("subtask {} has no assigned slot", v.current_attempt())
                    })?;
                    Ok((slot.location, v.current_attempt()))
                })
                .collect::<Result<_, failure::Error>>()?
        };

        for (worker, attempt) in targets {
            self.gateway.send_to_task(
                &worker,
                TaskRequest::Resume {
                    job: self.job,
                    attempt,
                },
                self.config.rpc_timeout,
            )?;
        }
        Ok(())
    }

    /// Rescind a still-pending modification: the record is discarded and a
    /// cancel marker is sent downstream.
    pub fn cancel_modification(&self, id: ModificationId) -> Result<(), failure::Error> {
        let (reserved, vertices) = {
            let mut registry = self.registry.lock().unwrap();
            let mut pm = registry
                .pending
                .remove(&id)
                .ok_or_else(|| format_err!("modification {} is not pending", id))?;

            info!(self.log, "cancelling modification";
                  "modification" => %id, "description" => pm.description().to_owned());
            pm.discard();
            let vertices = pm.participants();
            let reserved = pm.take_reserved_slots();
            registry.stops.remove(&id);
            registry.forget_restarts(&reserved);
            registry.failed.insert(id, pm);
            (reserved, vertices)
        };
        Self::release_reservations(&self.graph, &*self.slots, reserved, &self.log);

        let sources = {
            let graph = self.graph.lock().unwrap();
            source_targets(&graph)?
        };
        let metadata = ModificationMetadata {
            modification: id,
            timestamp: unix_timestamp_millis(),
        };
        for source in sources {
            self.gateway.send_to_task(
                &source.worker,
                TaskRequest::TriggerCancelModification {
                    job: self.job,
                    attempt: source.attempt,
                    metadata,
                    vertices: vertices.clone(),
                },
                self.config.rpc_timeout,
            )?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    //  the two trigger paths
    // ------------------------------------------------------------------

    fn trigger_modification(
        &self,
        spilling_acks: HashSet<ExecutionAttemptId>,
        targets: Vec<SubtaskRef>,
        description: String,
        action: ModificationAction,
        stop: Option<StoppedSubtask>,
    ) -> Result<ModificationId, failure::Error> {
        ensure!(!targets.is_empty(), "no subtasks to pause");
        ensure!(!spilling_acks.is_empty(), "no upstream subtasks to spill");

        // the pending set and the subtask indices the marker will carry;
        // every target must still be running
        let (ack_tasks, pause_indices, sources) = {
            let graph = self.graph.lock().unwrap();
            let mut ack_tasks = HashSet::new();
            let mut pause_indices = HashSet::new();
            for &r in &targets {
                let v = graph.subtask(r);
                if v.state() != ExecutionState::Running {
                    return Err(GraphError::NotRunning {
                        name: graph.vertex(r.node).name.clone(),
                        subtask: r.subtask,
                        state: v.state(),
                    }
                    .into());
                }
                ack_tasks.insert(v.current_attempt());
                pause_indices.insert(r.subtask);
            }
            (ack_tasks, pause_indices, source_targets(&graph)?)
        };

        let _trigger = self.trigger_lock.lock().unwrap();

        let id = self.next_modification_id();
        let timestamp = unix_timestamp_millis();
        let pm = PendingModification::new(
            self.job,
            id,
            timestamp,
            description.clone(),
            action,
            ack_tasks,
        )?;

        {
            let mut registry = self.registry.lock().unwrap();
            info!(self.log, "triggering modification";
                  "modification" => %id, "timestamp" => timestamp, "description" => &description);
            registry.pending.insert(id, pm);
            if let Some(stop) = stop {
                registry.stops.insert(id, stop);
            }
        }
        self.timer.schedule(id, self.config.modification_timeout);

        let metadata = ModificationMetadata {
            modification: id,
            timestamp,
        };
        let upcoming_checkpoint = self.upcoming_checkpoint();

        for source in &sources {
            let sent = self.gateway.send_to_task(
                &source.worker,
                TaskRequest::TriggerModification {
                    job: self.job,
                    attempt: source.attempt,
                    metadata,
                    acks: spilling_acks.clone(),
                    subtasks_to_pause: pause_indices.clone(),
                    action,
                    upcoming_checkpoint,
                },
                self.config.rpc_timeout,
            );
            if let Err(e) = sent {
                let e = e.into();
                self.abort_trigger(id, &e);
                return Err(e);
            }
        }
        Ok(id)
    }

    fn trigger_migration(
        &self,
        spilling: HashMap<ExecutionAttemptId, HashSet<usize>>,
        stopping: HashMap<ExecutionAttemptId, Vec<InputChannelDescriptor>>,
        reserved: Vec<(SubtaskRef, Slot)>,
        migrating: &[(SubtaskRef, ExecutionAttemptId, String)],
        description: String,
    ) -> Result<ModificationId, failure::Error> {
        info!(self.log, "triggering migration"; "description" => &description);

        // every task in the job acknowledges a migration
        let (ack_tasks, sources) = {
            let graph = self.graph.lock().unwrap();
            let ack_tasks: HashSet<ExecutionAttemptId> = graph
                .all_subtasks()
                .into_iter()
                .map(|r| graph.subtask(r).current_attempt())
                .collect();
            (ack_tasks, source_targets(&graph)?)
        };

        let _trigger = self.trigger_lock.lock().unwrap();

        let id = self.next_modification_id();
        let timestamp = unix_timestamp_millis();
        let mut pm = match PendingModification::new(
            self.job,
            id,
            timestamp,
            description.clone(),
            ModificationAction::Stopping,
            ack_tasks,
        ) {
            Ok(pm) => pm,
            Err(e) => {
                Self::release_reservations(&self.graph, &*self.slots, reserved, &self.log);
                return Err(e);
            }
        };
        for &(r, ref slot) in &reserved {
            pm.reserve_slot(r, slot.clone());
        }

        {
            let mut registry = self.registry.lock().unwrap();
            info!(self.log, "triggering migration";
                  "modification" => %id, "timestamp" => timestamp, "description" => &description);
            registry.pending.insert(id, pm);
            for &(r, attempt, _) in migrating {
                registry.vertex_to_restart.insert(attempt, r);
            }
        }
        self.timer.schedule(id, self.config.modification_timeout);

        let metadata = ModificationMetadata {
            modification: id,
            timestamp,
        };
        let upcoming_checkpoint = self.upcoming_checkpoint();

        for source in &sources {
            let sent = self.gateway.send_to_task(
                &source.worker,
                TaskRequest::TriggerMigration {
                    job: self.job,
                    attempt: source.attempt,
                    metadata,
                    spilling: spilling.clone(),
                    stopping: stopping.clone(),
                    upcoming_checkpoint,
                },
                self.config.rpc_timeout,
            );
            if let Err(e) = sent {
                let e = e.into();
                self.abort_trigger(id, &e);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// A trigger path failed after the pending record was registered: mark
    /// the record as errored, move it to `failed`, and undo its bookkeeping.
    fn abort_trigger(&self, id: ModificationId, cause: &failure::Error) {
        error!(self.log, "failed to trigger modification";
               "modification" => %id, "cause" => %cause);

        let reserved = {
            let mut registry = self.registry.lock().unwrap();
            match registry.pending.remove(&id) {
                Some(mut pm) => {
                    pm.abort_error();
                    let reserved = pm.take_reserved_slots();
                    registry.stops.remove(&id);
                    registry.forget_restarts(&reserved);
                    registry.failed.insert(id, pm);
                    reserved
                }
                None => Vec::new(),
            }
        };
        Self::release_reservations(&self.graph, &*self.slots, reserved, &self.log);
    }

    /// The checkpoint the modification should anchor to: two checkpoints past
    /// the current one, or `None` when checkpointing has not produced enough
    /// history to anchor against.
    fn upcoming_checkpoint(&self) -> Option<CheckpointId> {
        let current = self.checkpoints.current();
        if current >= 2 {
            Some(current + 2)
        } else {
            None
        }
    }
}
