use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::time::Duration;

/// Bound shared by genome and instance identifiers. Equality and hashing are by value.
pub trait Key: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Key for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Completed,
    Cancelled,
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub runtime: Duration,
    pub status: RunStatus,
}

impl RunResult {
    pub fn completed(runtime: Duration) -> Self {
        Self {
            runtime,
            status: RunStatus::Completed,
        }
    }

    pub fn cancelled(timeout: Duration) -> Self {
        Self {
            runtime: timeout,
            status: RunStatus::Cancelled,
        }
    }

    pub fn faulted(timeout: Duration) -> Self {
        Self {
            runtime: timeout,
            status: RunStatus::Faulted,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == RunStatus::Cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenomeInstanceTask<G, I> {
    pub genome: G,
    pub instance: I,
}

impl<G, I> GenomeInstanceTask<G, I> {
    pub fn new(genome: G, instance: I) -> Self {
        Self { genome, instance }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress(pub String);

impl NodeAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId {
    pub node: NodeAddress,
    pub index: usize,
}

impl WorkerId {
    pub fn new(node: NodeAddress, index: usize) -> Self {
        Self { node, index }
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/worker-{}", self.node, self.index)
    }
}
