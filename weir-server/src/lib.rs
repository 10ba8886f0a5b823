//! The live-modification coordinator of weir.
//!
//! A weir job is a directed acyclic graph of logical operators, each running
//! as a set of parallel subtasks spread across workers. This crate owns the
//! runtime picture of that graph and implements every *modification* of it
//! that does not require a job restart: pausing operators, migrating operator
//! instances to other workers, and growing an operator's parallelism.
//!
//! # How a modification runs
//!
//! Every modification follows the same arc:
//!
//!  1. An orchestrator calls one of the trigger operations on
//!     [`ModificationCoordinator`] (say,
//!     [`migrate_all_from`](controller::ModificationCoordinator::migrate_all_from)).
//!     The trigger engine computes the set of *spilling upstreams* (producers
//!     that must spill selected output partitions to disk while their
//!     consumer moves) and *stopping targets* (the subtasks being paused or
//!     migrated), pre-allocates replacement slots where needed, creates a
//!     [`PendingModification`](controller::PendingModification) with a
//!     deadline, and commands the job's source tasks to broadcast a control
//!     marker.
//!  2. The marker travels downstream *in-band*: interleaved with records on
//!     the data channels, in FIFO order per channel (see the `dataflow`
//!     crate's operator chain). Each task reacts -- spilling, or pausing at
//!     the next checkpoint boundary and snapshotting its state -- and replies
//!     to the coordinator.
//!  3. The intake collects acknowledgements until the pending set is empty.
//!     Paused-and-migrating subtasks additionally ship their snapshot; once a
//!     subtask is tracked for restart, its state has arrived, and the task
//!     has reached `Paused`, the restart engine redeploys it on its reserved
//!     slot and re-plumbs the input channels of affected downstream tasks.
//!
//! Failure handling is deliberately blunt: the coordinator never retries
//! silently. A declined or expired modification is recorded and left alone; a
//! half-performed restart would corrupt the topology, so any error in that
//! path fails the job globally and lets the engine's recovery take over.
//!
//! # Crate layout
//!
//!  - `controller::graph` -- the execution graph arena: logical vertices,
//!    parallel subtasks, execution attempts, slots, and input-channel
//!    synthesis.
//!  - `controller::modification` -- the pending-modification registry and the
//!    intake for task replies, plus the deadline timer.
//!  - `controller::migrate` -- the trigger engine and the restart engine.
//!  - `coordination` -- the interfaces the coordinator consumes: slot
//!    provider, checkpoint-id counter, and the task-manager gateway (with a
//!    TCP implementation speaking `weir::TaskRequest` frames).

#![deny(unused_extern_crates)]

#[macro_use]
extern crate failure;
#[macro_use]
extern crate slog;

use std::time::Duration;

pub mod controller;
pub mod coordination;

#[cfg(test)]
mod integration;

pub use crate::controller::graph::{
    DistributionPattern, ExecutionGraph, ExecutionState, GraphError, SubtaskRef,
};
pub use crate::controller::modification::ModificationCoordinator;
pub use crate::coordination::{
    CheckpointIdCounter, GatewayError, ScheduledUnit, Slot, SlotAllocationError, SlotProvider,
    TaskManagerGateway,
};

/// Coordinator settings.
#[derive(Clone, Debug)]
pub struct Config {
    /// How long a pending modification may stay open before it expires.
    pub modification_timeout: Duration,
    /// Timeout attached to task RPCs.
    pub rpc_timeout: Duration,
    /// Whether consumers may be deployed before their producers have
    /// registered their partitions (lazy deployment).
    pub queued_scheduling: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            modification_timeout: Duration::from_secs(90),
            rpc_timeout: Duration::from_secs(10),
            queued_scheduling: true,
        }
    }
}

/// Just give me a damn terminal logger.
pub fn logger_pls() -> slog::Logger {
    use slog::Drain;
    use slog::Logger;
    use slog_term::term_full;
    use std::sync::Mutex;
    Logger::root(Mutex::new(term_full()).fuse(), o!())
}
