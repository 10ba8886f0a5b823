//! The restart engine: bringing paused subtasks back up with their migrated
//! state, and re-plumbing the topology around them.
//!
//! A migrated subtask restarts exactly when three things have happened, in
//! any order: the coordinator tracked it for restart, its snapshot arrived,
//! and the task reported `Paused`. Each of the three arrival paths calls
//! [`ModificationCoordinator::restart_if_stopped_and_state_received`]; the
//! guard re-checks all three under the registry lock, so exactly one caller
//! wins.
//!
//! Everything in here escalates errors through `ExecutionGraph::fail_global`:
//! a partially performed restart corrupts the topology, and the engine's own
//! recovery path is the only safe way out.

use petgraph::graph::NodeIndex;

use weir::{
    ExecutionAttemptId, InputGateDescriptor, ModificationId, SubtaskState,
    TaskDeploymentDescriptor, TaskRequest, TaskStateHandles, WorkerLocation,
};

use super::super::graph::{ExecutionState, SubtaskRef};
use super::super::modification::{unix_timestamp_millis, ModificationCoordinator};
use crate::coordination::ScheduledUnit;

impl ModificationCoordinator {
    /// Restart `subtask` iff it is tracked for restart, its migrated state
    /// has arrived, and the task has reached `Paused`. Otherwise this is a
    /// no-op; one of the other arrival paths will get here again.
    pub(crate) fn restart_if_stopped_and_state_received(&self, subtask: SubtaskRef) {
        let state = {
            let mut registry = self.registry.lock().unwrap();
            let (attempt, paused) = {
                let graph = self.graph.lock().unwrap();
                let v = graph.subtask(subtask);
                (v.current_attempt(), v.state() == ExecutionState::Paused)
            };

            if !paused
                || !registry.vertex_to_restart.contains_key(&attempt)
                || !registry.stored_state.contains_key(&attempt)
            {
                return;
            }

            registry.vertex_to_restart.remove(&attempt);
            match registry.stored_state.remove(&attempt) {
                Some(state) => state,
                None => return,
            }
        };

        if let Err(e) = self.restart_with_state(subtask, state) {
            error!(self.log, "failed to restart operator from migration"; "cause" => %e);
            self.graph.lock().unwrap().fail_global(e);
        }
    }

    /// Reset the execution, inject the restored state, and deploy to the
    /// slot reserved for the migration.
    fn restart_with_state(
        &self,
        subtask: SubtaskRef,
        state: SubtaskState,
    ) -> Result<(), failure::Error> {
        let (descriptor, worker) = {
            let mut graph = self.graph.lock().unwrap();
            let version = graph.global_mod_version();
            let attempt = graph.reset_for_new_execution_migration(
                subtask,
                unix_timestamp_millis(),
                version,
            )?;

            let handles = TaskStateHandles::new(state);
            graph.set_initial_state(subtask, handles.clone());
            let slot = graph.promote_future_slot(subtask)?;

            let input_gates = if graph.upstream_of(subtask.node).is_some() {
                vec![graph.input_gate_for(subtask)?]
            } else {
                Vec::new()
            };

            (
                TaskDeploymentDescriptor {
                    job: self.job,
                    attempt,
                    slot_index: slot.slot_index,
                    input_gates,
                    initial_state: Some(handles),
                },
                slot.location,
            )
        };

        info!(self.log, "redeploying migrated subtask";
              "attempt" => %descriptor.attempt, "worker" => %worker);
        self.gateway
            .send_to_task(&worker, TaskRequest::Deploy(descriptor), self.config.rpc_timeout)?;
        Ok(())
    }

    /// Restart the subtask stopped by a `pause_single` modification on a
    /// freshly allocated slot.
    pub fn restart_stopped_instance(
        &self,
        modification: ModificationId,
    ) -> Result<(), failure::Error> {
        let (stop, state) = {
            let mut registry = self.registry.lock().unwrap();
            let stop = registry.stops.remove(&modification).ok_or_else(|| {
                format_err!("no stopped subtask recorded for {}", modification)
            })?;
            match registry.stored_state.remove(&stop.attempt) {
                Some(state) => (stop, state),
                None => {
                    drop(registry);
                    let msg =
                        format!("could not find state to restore for attempt {}", stop.attempt);
                    self.graph.lock().unwrap().fail_global(format_err!("{}", msg));
                    return Err(format_err!("{}", msg));
                }
            }
        };

        let task_name = {
            let graph = self.graph.lock().unwrap();
            format!("{}[{}]", graph.vertex(stop.subtask.node).name, stop.subtask_index)
        };
        let unit = ScheduledUnit {
            attempt: stop.attempt,
            task_name,
        };
        let slot = self.slots.allocate_slot(&unit, self.config.queued_scheduling)?;
        self.graph
            .lock()
            .unwrap()
            .assign_slot_for_migration(stop.subtask, slot);

        if let Err(e) = self.restart_with_state(stop.subtask, state) {
            error!(self.log, "failed to restart stopped instance"; "cause" => %e);
            self.graph
                .lock()
                .unwrap()
                .fail_global(format_err!("failed to restart stopped instance: {}", e));
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    //  rescaling
    // ------------------------------------------------------------------

    /// Create a new logical operator between the job's source and its
    /// consumer, schedule its subtasks, and hand the consumer its rewired
    /// input set.
    pub fn insert_operator(
        &self,
        name: &str,
        parallelism: usize,
    ) -> Result<NodeIndex, failure::Error> {
        let (inserted, downstream) = {
            let mut graph = self.graph.lock().unwrap();
            let sources = graph.source_vertices();
            ensure!(
                sources.len() == 1,
                "inserting an operator requires exactly one source, found {}",
                sources.len()
            );
            let source = sources[0];
            let downstream = graph
                .downstream_of(source)
                .ok_or_else(|| format_err!("the source has no downstream consumer"))?;
            let inserted = graph.insert_operator_between(name, parallelism, source, downstream);
            graph.increment_global_mod_version();
            (inserted, downstream)
        };

        for subtask in 0..parallelism {
            self.schedule_subtask(SubtaskRef {
                node: inserted,
                subtask,
            })?;
        }

        self.resume_with_new_input(downstream)?;
        Ok(inserted)
    }

    /// Grow an operator by one subtask and deploy it.
    pub fn increase_parallelism_of(&self, node: NodeIndex) -> Result<SubtaskRef, failure::Error> {
        let r = self.graph.lock().unwrap().increase_parallelism(node);
        self.schedule_subtask(r)?;
        Ok(r)
    }

    /// Allocate a slot for a fresh subtask and deploy it, stateless.
    fn schedule_subtask(&self, r: SubtaskRef) -> Result<(), failure::Error> {
        let unit = {
            let graph = self.graph.lock().unwrap();
            ScheduledUnit {
                attempt: graph.subtask(r).current_attempt(),
                task_name: format!("{}[{}]", graph.vertex(r.node).name, r.subtask),
            }
        };
        let slot = self.slots.allocate_slot(&unit, self.config.queued_scheduling)?;

        let (descriptor, worker) = {
            let mut graph = self.graph.lock().unwrap();
            graph.assign_slot(r, slot.clone());
            graph.set_execution_state(r, ExecutionState::Deploying);

            let input_gates = if graph.upstream_of(r.node).is_some() {
                vec![graph.input_gate_for(r)?]
            } else {
                Vec::new()
            };

            (
                TaskDeploymentDescriptor {
                    job: self.job,
                    attempt: graph.subtask(r).current_attempt(),
                    slot_index: slot.slot_index,
                    input_gates,
                    initial_state: None,
                },
                slot.location,
            )
        };

        self.gateway
            .send_to_task(&worker, TaskRequest::Deploy(descriptor), self.config.rpc_timeout)?;
        Ok(())
    }

    /// Resume every subtask of `node`, replacing the input that used to come
    /// from the stopped subtask.
    pub fn resume_with_different_inputs(
        &self,
        node: NodeIndex,
        stopped_subtask: usize,
    ) -> Result<(), failure::Error> {
        let targets = self.gate_targets(node)?;
        for (worker, attempt, input_gates) in targets {
            self.gateway.send_to_task(
                &worker,
                TaskRequest::ResumeWithDifferentInputs {
                    job: self.job,
                    attempt,
                    stopped_subtask,
                    input_gates,
                },
                self.config.rpc_timeout,
            )?;
        }
        Ok(())
    }

    /// Resume every subtask of `node` with an entirely new input set.
    pub fn resume_with_new_input(&self, node: NodeIndex) -> Result<(), failure::Error> {
        let targets = self.gate_targets(node)?;
        for (worker, attempt, input_gates) in targets {
            self.gateway.send_to_task(
                &worker,
                TaskRequest::ResumeWithNewInput {
                    job: self.job,
                    attempt,
                    input_gates,
                },
                self.config.rpc_timeout,
            )?;
        }
        Ok(())
    }

    /// Freshly synthesized input gates for every subtask of `node`, paired
    /// with where to send them.
    fn gate_targets(
        &self,
        node: NodeIndex,
    ) -> Result<Vec<(WorkerLocation, ExecutionAttemptId, Vec<InputGateDescriptor>)>, failure::Error>
    {
        let graph = self.graph.lock().unwrap();
        let mut targets = Vec::new();
        for subtask in 0..graph.vertex(node).parallelism() {
            let r = SubtaskRef { node, subtask };
            let v = graph.subtask(r);
            let worker = v
                .current
                .assigned_slot
                .as_ref()
                .ok_or_else(|| {
                    format_err!("subtask {} has no assigned slot", v.current_attempt())
                })?
                .location;
            let input_gates = vec![graph.input_gate_for(r)?];
            targets.push((worker, v.current_attempt(), input_gates));
        }
        Ok(targets)
    }

    /// Rewire one input channel of `consumer` to read `new_producer`'s
    /// partition, without redeploying the consumer.
    pub fn consume_new_producer(
        &self,
        consumer: SubtaskRef,
        new_producer: SubtaskRef,
        channel_index: usize,
    ) -> Result<(), failure::Error> {
        let (worker, request) = {
            let graph = self.graph.lock().unwrap();
            let c = graph.subtask(consumer);
            let worker = c
                .current
                .assigned_slot
                .as_ref()
                .ok_or_else(|| {
                    format_err!("consumer {} has no assigned slot", c.current_attempt())
                })?
                .location;

            let p = graph.subtask(new_producer);
            let producer_slot = p.current.assigned_slot.as_ref().ok_or_else(|| {
                format_err!("new producer {} has no assigned slot", p.current_attempt())
            })?;

            (
                worker,
                TaskRequest::ConsumeNewProducer {
                    job: self.job,
                    attempt: c.current_attempt(),
                    new_producer: p.current_attempt(),
                    partition: p.produced_partition(),
                    location: producer_slot.location,
                    connection_index: graph.vertex(new_producer.node).connection_index,
                    channel_index,
                },
            )
        };

        self.gateway
            .send_to_task(&worker, request, self.config.rpc_timeout)?;
        Ok(())
    }
}
