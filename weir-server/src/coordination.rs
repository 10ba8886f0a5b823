//! The interfaces the coordinator consumes but does not implement itself:
//! slot allocation, the checkpoint-id counter, and the per-worker task
//! gateway.
//!
//! All three are traits so that the engine wires in its real resource manager
//! and checkpoint coordinator, and so that tests can observe every call. The
//! one concrete implementation here is [`TcpTaskManagerGateway`], which
//! frames [`TaskRequest`]s onto per-worker control connections.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use weir::channel::tcp::TcpSender;
use weir::{ExecutionAttemptId, TaskRequest, WorkerId, WorkerLocation};

/// A reserved unit of worker capacity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Slot {
    pub location: WorkerLocation,
    /// Index of the slot within its worker.
    pub slot_index: usize,
}

impl Slot {
    pub fn worker(&self) -> WorkerId {
        self.location.worker
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "slot {}#{}", self.location, self.slot_index)
    }
}

/// What the slot provider needs to know about the task being placed.
#[derive(Clone, Debug)]
pub struct ScheduledUnit {
    pub attempt: ExecutionAttemptId,
    pub task_name: String,
}

/// Errors from the slot provider.
#[derive(Debug, Fail)]
pub enum SlotAllocationError {
    #[fail(display = "no worker has a free slot for {}", task)]
    NoCapacity { task: String },
    #[fail(
        display = "only the excluded worker {} has free slots for {}",
        excluded, task
    )]
    OnlyExcludedWorker { excluded: WorkerId, task: String },
}

/// Hands out worker slots. Implemented by the engine's resource manager.
pub trait SlotProvider: Send + Sync {
    /// Allocate a slot anywhere.
    fn allocate_slot(
        &self,
        unit: &ScheduledUnit,
        queued: bool,
    ) -> Result<Slot, SlotAllocationError>;

    /// Allocate a slot on any worker *except* the given one. Must never
    /// return a slot on the excluded worker.
    fn allocate_slot_except(
        &self,
        unit: &ScheduledUnit,
        queued: bool,
        exclude: WorkerId,
    ) -> Result<Slot, SlotAllocationError>;

    /// Return a previously allocated slot. Called for reservations whose
    /// modification terminated unsuccessfully.
    fn release_slot(&self, slot: &Slot);
}

/// Read-only view of the engine's checkpoint-id counter.
pub trait CheckpointIdCounter: Send + Sync {
    fn current(&self) -> u64;
}

/// Errors from task RPCs.
#[derive(Debug, Fail)]
pub enum GatewayError {
    #[fail(display = "worker {} is unreachable: {}", worker, reason)]
    Unreachable { worker: WorkerId, reason: String },
    #[fail(display = "sending to worker {} failed: {}", worker, cause)]
    SendFailed {
        worker: WorkerId,
        #[cause]
        cause: weir::channel::SendError,
    },
}

/// RPCs to tasks, addressed by the worker hosting them. All requests are
/// idempotent at the task side by execution attempt id.
pub trait TaskManagerGateway: Send + Sync {
    fn send_to_task(
        &self,
        worker: &WorkerLocation,
        request: TaskRequest,
        timeout: Duration,
    ) -> Result<(), GatewayError>;
}

/// The production gateway: one control connection per worker, connected on
/// demand, carrying length-prefixed `TaskRequest` frames.
pub struct TcpTaskManagerGateway {
    connections: Mutex<HashMap<WorkerId, TcpSender<TaskRequest>>>,
}

impl TcpTaskManagerGateway {
    pub fn new() -> Self {
        TcpTaskManagerGateway {
            connections: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for TcpTaskManagerGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManagerGateway for TcpTaskManagerGateway {
    fn send_to_task(
        &self,
        worker: &WorkerLocation,
        request: TaskRequest,
        _timeout: Duration,
    ) -> Result<(), GatewayError> {
        let mut connections = self.connections.lock().unwrap();
        if !connections.contains_key(&worker.worker) {
            let tx = TcpSender::connect(&worker.addr).map_err(|e| GatewayError::Unreachable {
                worker: worker.worker,
                reason: e.to_string(),
            })?;
            connections.insert(worker.worker, tx);
        }

        let tx = connections
            .get_mut(&worker.worker)
            .expect("connection was just inserted");
        match tx.send(request) {
            Ok(()) => Ok(()),
            Err(cause) => {
                // drop the poisoned connection so the next call reconnects
                connections.remove(&worker.worker);
                Err(GatewayError::SendFailed {
                    worker: worker.worker,
                    cause,
                })
            }
        }
    }
}
