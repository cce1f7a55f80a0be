use std::fmt;
use std::time::{Duration, Instant};

/// A stable, opaque identifier for one partition of the event hub.
///
/// Obtained once at startup and never mutated; see the crate-level docs for
/// why the manager never reacts to a changing partition count.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PartitionId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// The unit of ownership: a time-bounded, renewable claim over one partition.
///
/// `expiry` and `epoch` are store-owned fields. The manager treats `epoch` as
/// opaque and only ever round-trips it back into `acquire`/`renew` calls so
/// the store can detect a concurrent writer (a resource version, in
/// Kubernetes terms).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub partition_id: PartitionId,
    pub owner: Option<String>,
    pub expiry: Instant,
    pub epoch: String,
}

impl Lease {
    /// A lease with no owner and an expiry already in the past, suitable as
    /// the initial state of a freshly created lease record.
    pub fn unclaimed(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            owner: None,
            expiry: Instant::now() - Duration::from_secs(1),
            epoch: String::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expiry
    }

    /// The current owner, or `None` if the lease is expired or unclaimed.
    ///
    /// An expired lease has no effective owner regardless of the stale
    /// `owner` field: the store's compare-and-set contract treats it as up
    /// for grabs the moment its clock runs out.
    pub fn owner(&self) -> Option<&str> {
        if self.is_expired() {
            None
        } else {
            self.owner.as_deref()
        }
    }

    pub fn is_owned_by(&self, host_id: &str) -> bool {
        self.owner() == Some(host_id)
    }
}

/// A per-partition durable marker of stream-read progress.
///
/// Opaque to the manager beyond existence: init ensures the record exists,
/// nothing else in this crate reads or writes its contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub partition_id: PartitionId,
    pub offset: Option<String>,
}

impl Checkpoint {
    pub fn empty(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            offset: None,
        }
    }
}

/// Why a pump was torn down.
///
/// `Other` keeps the set open for the external pump implementation to add
/// its own reasons without requiring a breaking change here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    LeaseLost,
    Shutdown,
    Other(String),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::LeaseLost => f.write_str("lease_lost"),
            TerminationReason::Shutdown => f.write_str("shutdown"),
            TerminationReason::Other(reason) => write!(f, "other({reason})"),
        }
    }
}
