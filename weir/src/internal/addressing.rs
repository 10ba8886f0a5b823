use std::fmt;

/// Generates a fresh, statistically unique 128-bit identifier.
fn fresh_id() -> u128 {
    rand::random()
}

macro_rules! opaque_id {
    ($(#[$attr:meta])* $name:ident, $prefix:expr) => {
        $(#[$attr])*
        #[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy, Debug, Serialize, Deserialize)]
        pub struct $name(u128);

        impl $name {
            /// Generate a fresh, statistically unique identifier.
            pub fn fresh() -> Self {
                $name(fresh_id())
            }

            /// Reconstruct an identifier from its raw bits. Only useful for
            /// tests and for deterministic fixtures.
            pub fn from_bits(bits: u128) -> Self {
                $name(bits)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                // the low 64 bits are plenty to tell ids apart in logs
                write!(f, concat!($prefix, "{:016x}"), self.0 as u64)
            }
        }
    };
}

opaque_id!(
    /// Identifies a running job; fixed at coordinator construction.
    JobId,
    "job-"
);
opaque_id!(
    /// Identifies a logical operator in the topology.
    VertexId,
    "v-"
);
opaque_id!(
    /// Identifies one incarnation of a parallel subtask
    /// (vertex × subtask index × attempt).
    ExecutionAttemptId,
    "attempt-"
);
opaque_id!(
    /// Identifies one output queue of a producer subtask.
    PartitionId,
    "part-"
);
opaque_id!(
    /// Identifies a worker process (one task manager).
    WorkerId,
    "worker-"
);

/// Identifies one modification of the running topology.
///
/// Modification ids are handed out by the coordinator, monotonically
/// increasing from 1, and are globally unique within one coordinator.
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ModificationId(u64);

impl From<u64> for ModificationId {
    fn from(i: u64) -> Self {
        ModificationId(i)
    }
}

impl ModificationId {
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModificationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}
