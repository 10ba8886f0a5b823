//! The coordinator side of weir: the execution-graph arena, the
//! pending-modification registry, and the trigger/restart engines.

pub mod graph;
pub mod migrate;
pub mod modification;

pub use self::graph::{
    DistributionPattern, Execution, ExecutionGraph, ExecutionJobVertex, ExecutionState,
    ExecutionVertex, GraphError, JobStatus, SubtaskRef,
};
pub use self::modification::{
    AckResult, CompletedModification, ModificationCoordinator, PendingModification, TerminalState,
};
