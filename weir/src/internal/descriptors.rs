use std::fmt;
use std::net::SocketAddr;

use super::addressing::{ExecutionAttemptId, PartitionId, WorkerId};

/// Where a worker process can be reached.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct WorkerLocation {
    /// The worker's identity.
    pub worker: WorkerId,
    /// The address its data endpoint listens on.
    pub addr: SocketAddr,
}

impl fmt::Display for WorkerLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.worker, self.addr)
    }
}

/// A connection to a remote partition: the producer's location plus the
/// connection index of the produced result (workers multiplex several results
/// over distinct connections).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ConnectionId {
    pub location: WorkerLocation,
    pub connection_index: usize,
}

/// Identifies one result partition: the logical partition plus the execution
/// attempt that produces it. Re-executing a subtask therefore yields a new
/// `ResultPartitionId` for the same logical partition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ResultPartitionId {
    pub partition: PartitionId,
    pub producer: ExecutionAttemptId,
}

/// Where a consumer finds the partition it reads.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PartitionLocation {
    /// Producer runs on the same worker as the consumer.
    Local,
    /// Producer runs on a different worker.
    Remote(ConnectionId),
    /// Producer has not been deployed yet; the consumer must wait for a
    /// partition-info update before it can read.
    Unknown,
}

impl PartitionLocation {
    pub fn is_unknown(&self) -> bool {
        match *self {
            PartitionLocation::Unknown => true,
            _ => false,
        }
    }
}

/// Deployment descriptor for a single input channel: which partition to
/// consume, and where to find it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct InputChannelDescriptor {
    pub consumed_partition: ResultPartitionId,
    pub location: PartitionLocation,
}

impl fmt::Display for InputChannelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.location {
            PartitionLocation::Local => {
                write!(f, "[{} <- local]", self.consumed_partition.partition)
            }
            PartitionLocation::Remote(ref c) => write!(
                f,
                "[{} <- {}]",
                self.consumed_partition.partition, c.location
            ),
            PartitionLocation::Unknown => {
                write!(f, "[{} <- ?]", self.consumed_partition.partition)
            }
        }
    }
}

/// Deployment descriptor for one input gate of a task: the subpartition index
/// every channel of this gate consumes, plus one channel descriptor per
/// producing subtask.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InputGateDescriptor {
    pub consumed_subpartition: usize,
    pub channels: Vec<InputChannelDescriptor>,
}
