//! The runtime picture of a job: an arena of logical operators with typed
//! edges, each operator fanned out into parallel subtasks.
//!
//! The graph is deliberately dumb. It knows who produces what, where every
//! subtask currently runs, and how to synthesize input-channel descriptors;
//! the decisions about *changing* any of that live in
//! [`migrate`](super::migrate). Mutations go through the methods here so
//! that the graph's own invariants (one execution per subtask, one-shot
//! attempt replacement, consistent slot bookkeeping) hold no matter which
//! engine is driving.

use std::fmt;

use petgraph::graph::NodeIndex;
use petgraph::Direction;
use slog::Logger;

use weir::{
    ConnectionId, ExecutionAttemptId, InputChannelDescriptor, InputGateDescriptor, JobId,
    PartitionId, PartitionLocation, ResultPartitionId, TaskStateHandles, VertexId,
};

use crate::coordination::Slot;

/// How records of a producer are distributed over a consumer's subtasks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DistributionPattern {
    /// Every producer subtask feeds every consumer subtask.
    AllToAll,
    /// Producer subtask i feeds consumer subtask i.
    Pointwise,
}

/// The life of one execution attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionState {
    Created,
    Scheduled,
    Deploying,
    Running,
    Pausing,
    Paused,
    Resuming,
    Finished,
    Canceled,
    Failed,
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            ExecutionState::Created => "created",
            ExecutionState::Scheduled => "scheduled",
            ExecutionState::Deploying => "deploying",
            ExecutionState::Running => "running",
            ExecutionState::Pausing => "pausing",
            ExecutionState::Paused => "paused",
            ExecutionState::Resuming => "resuming",
            ExecutionState::Finished => "finished",
            ExecutionState::Canceled => "canceled",
            ExecutionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Errors raised by graph operations.
#[derive(Debug, Fail)]
pub enum GraphError {
    #[fail(
        display = "concurrent global modification (expected version {}, graph is at {})",
        expected, actual
    )]
    GlobalModVersionMismatch { expected: u64, actual: u64 },
    #[fail(display = "no subtask is currently executing attempt {}", _0)]
    UnknownAttempt(ExecutionAttemptId),
    #[fail(display = "no operator whose name contains '{}'", _0)]
    VertexNotFound(String),
    #[fail(display = "operator {} has no upstream operator", _0)]
    NoUpstream(String),
    #[fail(display = "subtask {}[{}] is {}, not running", name, subtask, state)]
    NotRunning {
        name: String,
        subtask: usize,
        state: ExecutionState,
    },
    #[fail(
        display = "input of {}[{}] has no channel for partition index {}",
        name, subtask, index
    )]
    NoChannelForPartition {
        name: String,
        subtask: usize,
        index: usize,
    },
    #[fail(
        display = "producer {} is {} and its partition cannot be consumed eagerly",
        producer, state
    )]
    ProducerNotReady {
        producer: ExecutionAttemptId,
        state: ExecutionState,
    },
    #[fail(display = "no slot was reserved for {}", _0)]
    MissingReservedSlot(ExecutionAttemptId),
}

/// One incarnation of a parallel subtask.
#[derive(Clone, Debug)]
pub struct Execution {
    pub attempt: ExecutionAttemptId,
    pub state: ExecutionState,
    pub assigned_slot: Option<Slot>,
    pub initial_state: Option<TaskStateHandles>,
}

impl Execution {
    fn fresh() -> Self {
        Execution {
            attempt: ExecutionAttemptId::fresh(),
            state: ExecutionState::Created,
            assigned_slot: None,
            initial_state: None,
        }
    }
}

/// Runtime object for one parallel subtask of a logical operator.
#[derive(Clone, Debug)]
pub struct ExecutionVertex {
    pub vertex: VertexId,
    pub subtask: usize,
    /// The logical partition this subtask produces. Attempt changes produce
    /// new `ResultPartitionId`s for the same logical partition.
    pub partition: PartitionId,
    pub current: Execution,
    /// Slot reserved for this subtask's next incarnation, if a migration is
    /// under way.
    pub future_slot: Option<Slot>,
    /// Attempt id the next incarnation will use; handed out early so that
    /// replacement input channels can name it before the restart happens.
    pub upcoming_attempt: Option<ExecutionAttemptId>,
}

impl ExecutionVertex {
    pub fn current_attempt(&self) -> ExecutionAttemptId {
        self.current.attempt
    }

    pub fn state(&self) -> ExecutionState {
        self.current.state
    }

    /// The partition this subtask's *current* attempt produces.
    pub fn produced_partition(&self) -> ResultPartitionId {
        ResultPartitionId {
            partition: self.partition,
            producer: self.current.attempt,
        }
    }
}

/// A logical operator with its parallel subtasks.
#[derive(Clone, Debug)]
pub struct ExecutionJobVertex {
    pub id: VertexId,
    pub name: String,
    /// Connection index workers use to multiplex this operator's produced
    /// result onto shared links.
    pub connection_index: usize,
    pub subtasks: Vec<ExecutionVertex>,
}

impl ExecutionJobVertex {
    pub fn parallelism(&self) -> usize {
        self.subtasks.len()
    }
}

/// Arena handle for one subtask: the operator's node index plus the parallel
/// subtask index.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SubtaskRef {
    pub node: NodeIndex,
    pub subtask: usize,
}

/// Whether the job is still healthy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobStatus {
    Running,
    Failed,
}

/// The execution graph of one running job.
pub struct ExecutionGraph {
    job: JobId,
    graph: petgraph::Graph<ExecutionJobVertex, DistributionPattern>,
    creation_order: Vec<NodeIndex>,
    global_mod_version: u64,
    status: JobStatus,
    failure_cause: Option<String>,
    queued_scheduling: bool,
    next_connection_index: usize,
    log: Logger,
}

impl ExecutionGraph {
    pub fn new(job: JobId, queued_scheduling: bool, log: Logger) -> Self {
        ExecutionGraph {
            job,
            graph: petgraph::Graph::new(),
            creation_order: Vec::new(),
            global_mod_version: 1,
            status: JobStatus::Running,
            failure_cause: None,
            queued_scheduling,
            next_connection_index: 0,
            log,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job
    }

    pub fn global_mod_version(&self) -> u64 {
        self.global_mod_version
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn failure_cause(&self) -> Option<&str> {
        self.failure_cause.as_ref().map(|s| &**s)
    }

    pub fn queued_scheduling(&self) -> bool {
        self.queued_scheduling
    }

    /// Add a logical operator with `parallelism` subtasks, all in state
    /// `Created`.
    pub fn add_vertex<S: ToString>(&mut self, name: S, parallelism: usize) -> NodeIndex {
        assert!(parallelism >= 1);
        let id = VertexId::fresh();
        let connection_index = self.next_connection_index;
        self.next_connection_index += 1;

        let subtasks = (0..parallelism)
            .map(|subtask| ExecutionVertex {
                vertex: id,
                subtask,
                partition: PartitionId::fresh(),
                current: Execution::fresh(),
                future_slot: None,
                upcoming_attempt: None,
            })
            .collect();

        let ni = self.graph.add_node(ExecutionJobVertex {
            id,
            name: name.to_string(),
            connection_index,
            subtasks,
        });
        self.creation_order.push(ni);

        info!(self.log, "added vertex";
              "name" => &self.graph[ni].name,
              "node" => ni.index(),
              "parallelism" => parallelism);
        ni
    }

    /// Connect `producer`'s result as an input of `consumer`.
    pub fn connect(&mut self, producer: NodeIndex, consumer: NodeIndex, pattern: DistributionPattern) {
        self.graph.add_edge(producer, consumer, pattern);
    }

    pub fn vertex(&self, node: NodeIndex) -> &ExecutionJobVertex {
        &self.graph[node]
    }

    pub fn subtask(&self, r: SubtaskRef) -> &ExecutionVertex {
        &self.graph[r.node].subtasks[r.subtask]
    }

    fn subtask_mut(&mut self, r: SubtaskRef) -> &mut ExecutionVertex {
        &mut self.graph[r.node].subtasks[r.subtask]
    }

    /// Node indices in the order the vertices were added (topological for
    /// graphs built source-first, which is how jobs are submitted).
    pub fn vertices_in_creation_order(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.creation_order.iter().cloned()
    }

    /// Every subtask of every vertex.
    pub fn all_subtasks(&self) -> Vec<SubtaskRef> {
        self.creation_order
            .iter()
            .flat_map(|&node| {
                (0..self.graph[node].subtasks.len()).map(move |subtask| SubtaskRef { node, subtask })
            })
            .collect()
    }

    /// Find the subtask currently executing `attempt`.
    pub fn find_attempt(&self, attempt: ExecutionAttemptId) -> Option<SubtaskRef> {
        self.all_subtasks()
            .into_iter()
            .find(|&r| self.subtask(r).current_attempt() == attempt)
    }

    /// Case-insensitive substring match over vertex names.
    pub fn find_vertex_by_name(&self, name: &str) -> Option<NodeIndex> {
        let needle = name.to_lowercase();
        self.creation_order
            .iter()
            .cloned()
            .find(|&ni| self.graph[ni].name.to_lowercase().contains(&needle))
    }

    /// The vertices with no incoming edges, in creation order.
    pub fn source_vertices(&self) -> Vec<NodeIndex> {
        self.creation_order
            .iter()
            .cloned()
            .filter(|&ni| {
                self.graph
                    .neighbors_directed(ni, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    /// The single producer feeding `node`, if any.
    pub fn upstream_of(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.graph.neighbors_directed(node, Direction::Incoming).next()
    }

    /// The single consumer of `node`'s result, if any.
    pub fn downstream_of(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.graph.neighbors_directed(node, Direction::Outgoing).next()
    }

    pub fn set_execution_state(&mut self, r: SubtaskRef, state: ExecutionState) {
        let name = self.graph[r.node].name.clone();
        let v = self.subtask_mut(r);
        let attempt = v.current.attempt;
        let from = v.current.state;
        v.current.state = state;
        debug!(self.log, "execution state change";
               "task" => format!("{}[{}]", name, r.subtask),
               "attempt" => %attempt,
               "from" => %from,
               "to" => %state);
    }

    pub fn assign_slot(&mut self, r: SubtaskRef, slot: Slot) {
        self.subtask_mut(r).current.assigned_slot = Some(slot);
    }

    /// Reserve `slot` for this subtask's next incarnation.
    pub fn assign_slot_for_migration(&mut self, r: SubtaskRef, slot: Slot) {
        self.subtask_mut(r).future_slot = Some(slot);
    }

    /// Undo `prepare_for_migration`: forget the upcoming attempt and give
    /// back any reserved slot.
    pub fn cancel_migration_preparation(&mut self, r: SubtaskRef) -> Option<Slot> {
        let v = self.subtask_mut(r);
        v.upcoming_attempt = None;
        v.future_slot.take()
    }

    /// Hand out the attempt id the next incarnation of this subtask will
    /// use, so replacement input channels can be described before the restart
    /// happens.
    pub fn prepare_for_migration(&mut self, r: SubtaskRef) -> ExecutionAttemptId {
        let v = self.subtask_mut(r);
        if let Some(upcoming) = v.upcoming_attempt {
            return upcoming;
        }
        let upcoming = ExecutionAttemptId::fresh();
        v.upcoming_attempt = Some(upcoming);
        upcoming
    }

    /// Replace this subtask's execution with a fresh attempt for migration.
    ///
    /// Fails if the graph has undergone a concurrent global modification
    /// since the caller last observed it.
    pub fn reset_for_new_execution_migration(
        &mut self,
        r: SubtaskRef,
        _timestamp: u64,
        expected_mod_version: u64,
    ) -> Result<ExecutionAttemptId, GraphError> {
        if expected_mod_version != self.global_mod_version {
            return Err(GraphError::GlobalModVersionMismatch {
                expected: expected_mod_version,
                actual: self.global_mod_version,
            });
        }

        let name = self.graph[r.node].name.clone();
        let v = self.subtask_mut(r);
        let attempt = v.upcoming_attempt.take().unwrap_or_else(ExecutionAttemptId::fresh);
        let old = v.current.attempt;
        v.current = Execution {
            attempt,
            state: ExecutionState::Created,
            assigned_slot: None,
            initial_state: None,
        };

        info!(self.log, "reset execution for migration";
              "task" => format!("{}[{}]", name, r.subtask),
              "old" => %old,
              "new" => %attempt);
        Ok(attempt)
    }

    pub fn set_initial_state(&mut self, r: SubtaskRef, state: TaskStateHandles) {
        self.subtask_mut(r).current.initial_state = Some(state);
    }

    /// Move the reserved future slot onto the current execution, marking it
    /// `Deploying`. Returns the slot the deployment should target.
    pub fn promote_future_slot(&mut self, r: SubtaskRef) -> Result<Slot, GraphError> {
        let v = self.subtask_mut(r);
        let slot = v
            .future_slot
            .take()
            .ok_or_else(|| GraphError::MissingReservedSlot(v.current.attempt))?;
        v.current.assigned_slot = Some(slot.clone());
        v.current.state = ExecutionState::Deploying;
        Ok(slot)
    }

    /// Record an unrecoverable failure. The engine's recovery path takes it
    /// from here; the coordinator only escalates.
    pub fn fail_global(&mut self, cause: failure::Error) {
        crit!(self.log, "failing job globally"; "job" => %self.job, "cause" => %cause);
        self.status = JobStatus::Failed;
        self.failure_cause = Some(cause.to_string());
    }

    /// Bump the global modification version, invalidating concurrent
    /// migrations that raced with a larger change.
    pub fn increment_global_mod_version(&mut self) -> u64 {
        self.global_mod_version += 1;
        self.global_mod_version
    }

    // ------------------------------------------------------------------
    //  input-channel synthesis
    // ------------------------------------------------------------------

    fn channel_from_producer(
        &self,
        producer: &ExecutionVertex,
        connection_index: usize,
        consumer_slot: Option<&Slot>,
    ) -> Result<InputChannelDescriptor, GraphError> {
        // a migrating producer is addressed by its upcoming incarnation and
        // the slot reserved for it
        let attempt = producer.upcoming_attempt.unwrap_or(producer.current.attempt);
        let producer_slot = producer
            .future_slot
            .as_ref()
            .or_else(|| producer.current.assigned_slot.as_ref());

        let consumable = match producer.current.state {
            ExecutionState::Scheduled
            | ExecutionState::Deploying
            | ExecutionState::Running
            | ExecutionState::Finished => true,
            _ => false,
        };

        let location = match (producer_slot, consumer_slot) {
            (Some(p), Some(c)) if consumable => {
                if p.worker() == c.worker() {
                    PartitionLocation::Local
                } else {
                    PartitionLocation::Remote(ConnectionId {
                        location: p.location,
                        connection_index,
                    })
                }
            }
            _ if self.queued_scheduling => PartitionLocation::Unknown,
            _ => {
                return Err(GraphError::ProducerNotReady {
                    producer: producer.current.attempt,
                    state: producer.current.state,
                });
            }
        };

        Ok(InputChannelDescriptor {
            consumed_partition: ResultPartitionId {
                partition: producer.partition,
                producer: attempt,
            },
            location,
        })
    }

    /// One input-channel descriptor per producing subtask of the consumer's
    /// upstream operator.
    pub fn input_channels_for(
        &self,
        consumer: SubtaskRef,
    ) -> Result<Vec<InputChannelDescriptor>, GraphError> {
        let upstream = self
            .upstream_of(consumer.node)
            .ok_or_else(|| GraphError::NoUpstream(self.graph[consumer.node].name.clone()))?;

        let connection_index = self.graph[upstream].connection_index;
        let consumer_slot = self.subtask(consumer).current.assigned_slot.clone();

        self.graph[upstream]
            .subtasks
            .iter()
            .map(|p| self.channel_from_producer(p, connection_index, consumer_slot.as_ref()))
            .collect()
    }

    /// The descriptor for the single input channel of `consumer` that reads
    /// the producer with parallel subtask index `partition_index`.
    pub fn input_channel_for_partition(
        &self,
        consumer: SubtaskRef,
        partition_index: usize,
    ) -> Result<InputChannelDescriptor, GraphError> {
        let upstream = self
            .upstream_of(consumer.node)
            .ok_or_else(|| GraphError::NoUpstream(self.graph[consumer.node].name.clone()))?;

        let producers = &self.graph[upstream].subtasks;
        if partition_index >= producers.len() {
            return Err(GraphError::NoChannelForPartition {
                name: self.graph[consumer.node].name.clone(),
                subtask: consumer.subtask,
                index: partition_index,
            });
        }

        let connection_index = self.graph[upstream].connection_index;
        let consumer_slot = self.subtask(consumer).current.assigned_slot.clone();
        self.channel_from_producer(
            &producers[partition_index],
            connection_index,
            consumer_slot.as_ref(),
        )
    }

    /// The full input gate of `consumer`, ready to ship in a deployment
    /// descriptor.
    pub fn input_gate_for(&self, consumer: SubtaskRef) -> Result<InputGateDescriptor, GraphError> {
        Ok(InputGateDescriptor {
            consumed_subpartition: consumer.subtask,
            channels: self.input_channels_for(consumer)?,
        })
    }

    // ------------------------------------------------------------------
    //  topology edits
    // ------------------------------------------------------------------

    /// Insert a new operator between `upstream` and `downstream`, rewiring
    /// the downstream's input (ALL_TO_ALL) through the new vertex.
    pub fn insert_operator_between<S: ToString>(
        &mut self,
        name: S,
        parallelism: usize,
        upstream: NodeIndex,
        downstream: NodeIndex,
    ) -> NodeIndex {
        let inserted = self.add_vertex(name, parallelism);

        if let Some(edge) = self.graph.find_edge(upstream, downstream) {
            self.graph.remove_edge(edge);
        }
        self.graph
            .add_edge(upstream, inserted, DistributionPattern::AllToAll);
        self.graph
            .add_edge(inserted, downstream, DistributionPattern::AllToAll);

        info!(self.log, "inserted operator";
              "name" => &self.graph[inserted].name,
              "between" => format!("{} -> {}", self.graph[upstream].name, self.graph[downstream].name));
        inserted
    }

    /// Grow `node`'s parallelism by one subtask and return its handle.
    pub fn increase_parallelism(&mut self, node: NodeIndex) -> SubtaskRef {
        let id = self.graph[node].id;
        let subtask = self.graph[node].subtasks.len();
        self.graph[node].subtasks.push(ExecutionVertex {
            vertex: id,
            subtask,
            partition: PartitionId::fresh(),
            current: Execution::fresh(),
            future_slot: None,
            upcoming_attempt: None,
        });

        info!(self.log, "increased parallelism";
              "name" => &self.graph[node].name,
              "parallelism" => subtask + 1);
        SubtaskRef { node, subtask }
    }

    // ------------------------------------------------------------------
    //  diagnostics
    // ------------------------------------------------------------------

    /// One line per subtask: attempt, worker, name.
    pub fn worker_details(&self) -> String {
        let mut details = String::new();
        for r in self.all_subtasks() {
            let v = self.subtask(r);
            let location = match v.current.assigned_slot {
                Some(ref slot) => slot.location.to_string(),
                None => "unassigned".to_owned(),
            };
            details.push_str(&format!(
                "{} - {} - {}[{}]\n",
                v.current.attempt, location, self.graph[r.node].name, r.subtask
            ));
        }
        details
    }

    pub fn graphviz(&self) -> String {
        let mut s = String::new();

        let indentln = |s: &mut String| s.push_str("    ");

        s.push_str("digraph {\n");
        indentln(&mut s);
        s.push_str("node [shape=record, fontsize=10]\n");

        for &index in &self.creation_order {
            let v = &self.graph[index];
            indentln(&mut s);
            s.push_str(&format!(
                "{} [label=\"{} (x{})\"]\n",
                index.index(),
                v.name,
                v.parallelism()
            ));
        }

        for edge in self.graph.raw_edges() {
            indentln(&mut s);
            s.push_str(&format!(
                "{} -> {}\n",
                edge.source().index(),
                edge.target().index()
            ));
        }

        s.push_str("}");
        s
    }
}
