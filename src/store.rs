use crate::model::{Checkpoint, Lease, PartitionId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A per-element failure from [`LeaseStore::get_all_leases`], keeping the
/// partition id alongside the underlying cause so the manager can report it
/// to the notification sink with the partition id attached, when known.
#[derive(Debug)]
pub struct LeaseLookupError<E> {
    pub partition_id: Option<PartitionId>,
    pub source: E,
}

impl<E: fmt::Display> fmt::Display for LeaseLookupError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.partition_id {
            Some(p) => write!(f, "partition {p}: {}", self.source),
            None => write!(f, "{}", self.source),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for LeaseLookupError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Persists one [`Lease`] record per partition.
///
/// Structurally, every method here is a thin async wrapper around a
/// compare-and-set primitive on whatever substrate backs the store (a blob
/// store, an etcd/Consul key, a Kubernetes `Lease` object — see
/// [`crate::k8s_store`] for a worked example of the latter). The manager
/// never assumes anything about the substrate beyond these signatures.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn lease_store_exists(&self) -> Result<bool, Self::Error>;
    async fn create_lease_store_if_absent(&self) -> Result<(), Self::Error>;
    async fn create_lease_if_absent(&self, partition_id: &PartitionId) -> Result<(), Self::Error>;

    /// Enumerate the current state of every lease.
    ///
    /// Each element fails independently: one partition's transient store
    /// error never prevents the caller from observing the rest. The outer
    /// `Result` is for failure of the enumeration call itself (e.g. the
    /// store is entirely unreachable), which the manager treats as an
    /// unhandled loop error rather than a per-lease one.
    async fn get_all_leases(&self) -> Result<Vec<Result<Lease, LeaseLookupError<Self::Error>>>, Self::Error>;

    /// Attempt to acquire `lease` on behalf of `holder`.
    ///
    /// `true` means the caller now holds the lease; `false` means a
    /// concurrent host won the race. Only legal when the caller has observed
    /// the lease as expired or unowned.
    async fn acquire_lease(&self, lease: &Lease, holder: &str) -> Result<bool, Self::Error>;

    /// Attempt to renew `lease`, which the caller believes it currently owns.
    ///
    /// `true` means the renewal succeeded; `false` means the caller has lost
    /// the lease (another host already won a concurrent acquire).
    async fn renew_lease(&self, lease: &Lease) -> Result<bool, Self::Error>;

    /// The cadence at which the reconciliation loop should iterate.
    fn lease_renew_interval(&self) -> Duration;

    /// How long a freshly acquired or renewed lease remains valid.
    ///
    /// Used by the manager to stamp a local, presumed-fresh expiry onto a
    /// lease it just won, since `acquire_lease`/`renew_lease` report success
    /// as a plain `bool` rather than returning the store's updated record.
    /// Must be strictly greater than `lease_renew_interval`, or a lease
    /// could expire before the loop gets back around to renewing it.
    fn lease_duration(&self) -> Duration;
}

#[async_trait]
impl<T: LeaseStore + ?Sized> LeaseStore for std::sync::Arc<T> {
    type Error = T::Error;

    async fn lease_store_exists(&self) -> Result<bool, Self::Error> {
        (**self).lease_store_exists().await
    }

    async fn create_lease_store_if_absent(&self) -> Result<(), Self::Error> {
        (**self).create_lease_store_if_absent().await
    }

    async fn create_lease_if_absent(&self, partition_id: &PartitionId) -> Result<(), Self::Error> {
        (**self).create_lease_if_absent(partition_id).await
    }

    async fn get_all_leases(&self) -> Result<Vec<Result<Lease, LeaseLookupError<Self::Error>>>, Self::Error> {
        (**self).get_all_leases().await
    }

    async fn acquire_lease(&self, lease: &Lease, holder: &str) -> Result<bool, Self::Error> {
        (**self).acquire_lease(lease, holder).await
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<bool, Self::Error> {
        (**self).renew_lease(lease).await
    }

    fn lease_renew_interval(&self) -> Duration {
        (**self).lease_renew_interval()
    }

    fn lease_duration(&self) -> Duration {
        (**self).lease_duration()
    }
}

/// Persists one [`Checkpoint`] record per partition.
///
/// Structurally parallel to [`LeaseStore`] for existence and per-partition
/// creation; otherwise entirely opaque to the partition manager, which never
/// reads or writes a checkpoint's contents.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn checkpoint_store_exists(&self) -> Result<bool, Self::Error>;
    async fn create_checkpoint_store_if_absent(&self) -> Result<(), Self::Error>;
    async fn create_checkpoint_if_absent(&self, partition_id: &PartitionId) -> Result<(), Self::Error>;
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for std::sync::Arc<T> {
    type Error = T::Error;

    async fn checkpoint_store_exists(&self) -> Result<bool, Self::Error> {
        (**self).checkpoint_store_exists().await
    }

    async fn create_checkpoint_store_if_absent(&self) -> Result<(), Self::Error> {
        (**self).create_checkpoint_store_if_absent().await
    }

    async fn create_checkpoint_if_absent(&self, partition_id: &PartitionId) -> Result<(), Self::Error> {
        (**self).create_checkpoint_if_absent(partition_id).await
    }
}

/// In-process [`LeaseStore`] used by this crate's own test suite.
///
/// Supports injecting a one-shot failure on the next `acquire`/`renew` call
/// for a given partition, which is how a transient lease-store error is
/// exercised in tests without a real external store.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    exists: Mutex<bool>,
    leases: Mutex<HashMap<PartitionId, Lease>>,
    inject_failure: Mutex<HashSet<PartitionId>>,
    renew_interval: Duration,
    lease_duration: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum InMemoryStoreError {
    #[error("injected failure for partition {0}")]
    Injected(PartitionId),
    #[error("no such partition {0}")]
    NoSuchPartition(PartitionId),
}

impl InMemoryLeaseStore {
    pub fn new(renew_interval: Duration, lease_duration: Duration) -> Self {
        Self {
            exists: Mutex::new(false),
            leases: Mutex::new(HashMap::new()),
            inject_failure: Mutex::new(HashSet::new()),
            renew_interval,
            lease_duration,
        }
    }

    /// Make the next `acquire_lease`/`renew_lease` call for `partition_id`
    /// fail once, then resume normal behavior.
    pub fn inject_failure(&self, partition_id: PartitionId) {
        self.inject_failure.lock().unwrap().insert(partition_id);
    }

    /// Force a lease to appear expired, simulating an externally-mutated
    /// store (a lost renewal).
    pub fn force_expire(&self, partition_id: &PartitionId) {
        if let Some(lease) = self.leases.lock().unwrap().get_mut(partition_id) {
            lease.expiry = Instant::now() - Duration::from_secs(1);
        }
    }

    /// Directly assign an owner to a lease, bypassing the CAS protocol —
    /// used by tests to seed "host A already owns everything" scenarios.
    pub fn seed_owner(&self, partition_id: &PartitionId, owner: &str) {
        let mut leases = self.leases.lock().unwrap();
        if let Some(lease) = leases.get_mut(partition_id) {
            lease.owner = Some(owner.to_string());
            lease.expiry = Instant::now() + self.lease_duration;
            lease.epoch = next_epoch(&lease.epoch);
        }
    }

    pub fn owned_by(&self, host_id: &str) -> Vec<PartitionId> {
        self.leases
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.is_owned_by(host_id))
            .map(|l| l.partition_id.clone())
            .collect()
    }

    fn take_injected_failure(&self, partition_id: &PartitionId) -> bool {
        self.inject_failure.lock().unwrap().remove(partition_id)
    }
}

fn next_epoch(current: &str) -> String {
    let n: u64 = current.parse().unwrap_or(0);
    (n + 1).to_string()
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    type Error = InMemoryStoreError;

    async fn lease_store_exists(&self) -> Result<bool, Self::Error> {
        Ok(*self.exists.lock().unwrap())
    }

    async fn create_lease_store_if_absent(&self) -> Result<(), Self::Error> {
        *self.exists.lock().unwrap() = true;
        Ok(())
    }

    async fn create_lease_if_absent(&self, partition_id: &PartitionId) -> Result<(), Self::Error> {
        self.leases
            .lock()
            .unwrap()
            .entry(partition_id.clone())
            .or_insert_with(|| Lease::unclaimed(partition_id.clone()));
        Ok(())
    }

    async fn get_all_leases(&self) -> Result<Vec<Result<Lease, LeaseLookupError<Self::Error>>>, Self::Error> {
        Ok(self
            .leases
            .lock()
            .unwrap()
            .values()
            .cloned()
            .map(|lease| {
                if self.take_injected_failure(&lease.partition_id) {
                    Err(LeaseLookupError {
                        partition_id: Some(lease.partition_id.clone()),
                        source: InMemoryStoreError::Injected(lease.partition_id.clone()),
                    })
                } else {
                    Ok(lease)
                }
            })
            .collect())
    }

    async fn acquire_lease(&self, lease: &Lease, holder: &str) -> Result<bool, Self::Error> {
        if self.take_injected_failure(&lease.partition_id) {
            return Err(InMemoryStoreError::Injected(lease.partition_id.clone()));
        }
        let mut leases = self.leases.lock().unwrap();
        let current = leases
            .get(&lease.partition_id)
            .ok_or_else(|| InMemoryStoreError::NoSuchPartition(lease.partition_id.clone()))?;

        if current.epoch != lease.epoch || current.owner().is_some() {
            // Stale view, or someone else already holds a live lease: lost the race.
            return Ok(false);
        }

        let updated = Lease {
            partition_id: lease.partition_id.clone(),
            owner: Some(holder.to_string()),
            expiry: Instant::now() + self.lease_duration,
            epoch: next_epoch(&current.epoch),
        };
        leases.insert(lease.partition_id.clone(), updated);
        Ok(true)
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<bool, Self::Error> {
        if self.take_injected_failure(&lease.partition_id) {
            return Err(InMemoryStoreError::Injected(lease.partition_id.clone()));
        }
        let mut leases = self.leases.lock().unwrap();
        let current = leases
            .get(&lease.partition_id)
            .ok_or_else(|| InMemoryStoreError::NoSuchPartition(lease.partition_id.clone()))?;

        if current.epoch != lease.epoch || current.owner.as_deref() != lease.owner.as_deref() {
            return Ok(false);
        }

        let updated = Lease {
            partition_id: lease.partition_id.clone(),
            owner: current.owner.clone(),
            expiry: Instant::now() + self.lease_duration,
            epoch: next_epoch(&current.epoch),
        };
        leases.insert(lease.partition_id.clone(), updated);
        Ok(true)
    }

    fn lease_renew_interval(&self) -> Duration {
        self.renew_interval
    }

    fn lease_duration(&self) -> Duration {
        self.lease_duration
    }
}

/// In-process [`CheckpointStore`] used by this crate's own test suite.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    exists: Mutex<bool>,
    checkpoints: Mutex<HashMap<PartitionId, Checkpoint>>,
}

#[derive(thiserror::Error, Debug)]
pub enum InMemoryCheckpointError {}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    type Error = InMemoryCheckpointError;

    async fn checkpoint_store_exists(&self) -> Result<bool, Self::Error> {
        Ok(*self.exists.lock().unwrap())
    }

    async fn create_checkpoint_store_if_absent(&self) -> Result<(), Self::Error> {
        *self.exists.lock().unwrap() = true;
        Ok(())
    }

    async fn create_checkpoint_if_absent(&self, partition_id: &PartitionId) -> Result<(), Self::Error> {
        self.checkpoints
            .lock()
            .unwrap()
            .entry(partition_id.clone())
            .or_insert_with(|| Checkpoint::empty(partition_id.clone()));
        Ok(())
    }
}
