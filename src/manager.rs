//! The orchestrator: initialization, the reconciliation loop, and shutdown.

use crate::balancer;
use crate::error::{ActionTag, Error, LoggingSink, NotificationSink};
use crate::model::{Lease, PartitionId, TerminationReason};
use crate::pump::PumpSupervisor;
use crate::store::{CheckpointStore, LeaseStore};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tokio_util::sync::CancellationToken;

/// How many times each init step is attempted before it is considered fatal.
/// Deliberately fixed with no backoff: the store prerequisites must exist
/// before any host can safely join the cluster, and retrying forever would
/// just mask a misconfiguration that no amount of waiting repairs.
pub const DEFAULT_INIT_RETRY_ATTEMPTS: usize = 5;

/// Builder-configured knobs for a [`PartitionManager`].
///
/// The renewal interval and lease duration are intentionally absent here:
/// they come from the [`LeaseStore`] itself, which is the single source of
/// truth for timing.
pub struct PartitionManagerConfig {
    pub(crate) host_id: String,
    pub(crate) init_retry_attempts: usize,
    pub(crate) notification_sink: Arc<dyn NotificationSink>,
}

impl PartitionManagerConfig {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            init_retry_attempts: DEFAULT_INIT_RETRY_ATTEMPTS,
            notification_sink: Arc::new(LoggingSink),
        }
    }

    pub fn with_init_retry_attempts(mut self, attempts: usize) -> Self {
        self.init_retry_attempts = attempts;
        self
    }

    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notification_sink = sink;
        self
    }
}

/// Retry `action` up to `max_attempts` times with no delay between attempts,
/// returning the first success or the last failure.
///
/// A zero-delay `FixedInterval` strategy rather than exponential backoff:
/// this is a fixed-count-no-backoff retry budget by design, a different
/// policy than a store's own internal conflict-retry wait might use.
async fn retry_fixed<T, E, Fut>(
    max_attempts: usize,
    mut action: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let strategy = FixedInterval::from_millis(0).take(max_attempts.saturating_sub(1));
    Retry::spawn(strategy, move || action()).await
}

/// The partition lease coordinator.
///
/// Runs a single fail-fast initialization phase, then drives a periodic
/// reconciliation loop on a spawned task until
/// [`PartitionManager::stop_partitions`] is called.
pub struct PartitionManager<L, C, P>
where
    L: LeaseStore,
    C: CheckpointStore,
    P: PumpSupervisor,
{
    lease_store: L,
    checkpoint_store: C,
    pump_supervisor: P,
    partition_ids: Vec<PartitionId>,
    config: PartitionManagerConfig,
    stop: CancellationToken,
    cleanup_abort: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<L, C, P> PartitionManager<L, C, P>
where
    L: LeaseStore + 'static,
    C: CheckpointStore + 'static,
    P: PumpSupervisor + 'static,
{
    pub fn new(
        lease_store: L,
        checkpoint_store: C,
        pump_supervisor: P,
        partition_ids: Vec<PartitionId>,
        config: PartitionManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            lease_store,
            checkpoint_store,
            pump_supervisor,
            partition_ids,
            config,
            stop: CancellationToken::new(),
            cleanup_abort: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        })
    }

    fn notify(&self, error: &Error, tag: ActionTag, partition_id: Option<&PartitionId>) {
        self.config
            .notification_sink
            .notify(&self.config.host_id, error, tag, partition_id);
    }

    /// The collaborating lease store, for embedders (and this crate's own
    /// tests) that need to observe store state directly.
    pub fn lease_store(&self) -> &L {
        &self.lease_store
    }

    pub fn checkpoint_store(&self) -> &C {
        &self.checkpoint_store
    }

    pub fn pump_supervisor(&self) -> &P {
        &self.pump_supervisor
    }

    /// Run initialization, then spawn the reconciliation loop task.
    ///
    /// Returns once the loop is running. On any fatal init failure, no pump
    /// has been created and no loop task is running.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), Error> {
        self.ensure_lease_store().await?;
        for partition_id in &self.partition_ids {
            self.ensure_lease(partition_id).await?;
        }
        self.ensure_checkpoint_store().await?;
        for partition_id in &self.partition_ids {
            self.ensure_checkpoint(partition_id).await?;
        }

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.run_loop().await;
        });
        *self.loop_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn ensure_lease_store(&self) -> Result<(), Error> {
        retry_fixed(self.config.init_retry_attempts, || async {
            if self.lease_store.lease_store_exists().await? {
                return Ok(());
            }
            self.lease_store.create_lease_store_if_absent().await
        })
        .await
        .map_err(|e| Error::init(ActionTag::CreatingLeaseStore, e))
    }

    async fn ensure_lease(&self, partition_id: &PartitionId) -> Result<(), Error> {
        retry_fixed(self.config.init_retry_attempts, || {
            self.lease_store.create_lease_if_absent(partition_id)
        })
        .await
        .map_err(|e| Error::init(ActionTag::CreatingLease, e))
    }

    async fn ensure_checkpoint_store(&self) -> Result<(), Error> {
        retry_fixed(self.config.init_retry_attempts, || async {
            if self.checkpoint_store.checkpoint_store_exists().await? {
                return Ok(());
            }
            self.checkpoint_store.create_checkpoint_store_if_absent().await
        })
        .await
        .map_err(|e| Error::init(ActionTag::CreatingCheckpointStore, e))
    }

    async fn ensure_checkpoint(&self, partition_id: &PartitionId) -> Result<(), Error> {
        retry_fixed(self.config.init_retry_attempts, || {
            self.checkpoint_store.create_checkpoint_if_absent(partition_id)
        })
        .await
        .map_err(|e| Error::init(ActionTag::CreatingCheckpoint, e))
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.stop.is_cancelled() {
                break;
            }

            if let Err(error) = self.run_iteration().await {
                self.notify(&error, ActionTag::PartitionManagerMainLoop, None);
                break;
            }

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(self.lease_store.lease_renew_interval()) => {}
            }
        }

        self.cleanup().await;
    }

    async fn run_iteration(&self) -> Result<(), Error> {
        let mut snapshot = self.snapshot_and_renew().await?;
        self.maybe_steal(&mut snapshot).await;
        self.reconcile_pumps(snapshot).await;
        Ok(())
    }

    /// Enumerate all leases, renewing self-owned ones and acquiring expired
    /// ones. A lease whose acquire/renew call errors is dropped from the
    /// snapshot entirely rather than recorded as owned-by-others: the manager
    /// would rather have no opinion on a partition than guess at state it
    /// can't confirm from the store.
    async fn snapshot_and_renew(&self) -> Result<HashMap<PartitionId, Lease>, Error> {
        let all = self
            .lease_store
            .get_all_leases()
            .await
            .map_err(|e| Error::store(ActionTag::CheckingLeases, None, e))?;

        let mut snapshot = HashMap::with_capacity(all.len());
        for result in all {
            let lease = match result {
                Ok(lease) => lease,
                Err(lookup_error) => {
                    let partition_id = lookup_error.partition_id.clone();
                    let error = Error::store(ActionTag::CheckingLeases, partition_id.clone(), lookup_error);
                    self.notify(&error, ActionTag::CheckingLeases, partition_id.as_ref());
                    continue;
                }
            };

            if lease.is_expired() {
                match self.try_claim(&lease, &self.config.host_id).await {
                    Ok(true) => {
                        let duration = self.lease_store.lease_duration();
                        snapshot.insert(
                            lease.partition_id.clone(),
                            self_owned(lease, &self.config.host_id, duration),
                        );
                    }
                    Ok(false) => {
                        snapshot.insert(lease.partition_id.clone(), lease);
                    }
                    Err(error) => {
                        let partition_id = lease.partition_id.clone();
                        self.notify(&error, ActionTag::CheckingLeases, Some(&partition_id));
                    }
                }
            } else if lease.is_owned_by(&self.config.host_id) {
                match self.lease_store.renew_lease(&lease).await {
                    Ok(true) => {
                        snapshot.insert(lease.partition_id.clone(), lease);
                    }
                    Ok(false) => {
                        // Lost the race: someone else already renewed/acquired.
                        // The store only tells us `false`, not who won, so we
                        // can't attribute this lease to its real new owner —
                        // but it must still count against *someone* or the
                        // balancer would undercount the cluster's true busiest
                        // host this iteration. Attribute it to a synthetic
                        // unknown owner rather than dropping the owner
                        // entirely: the pump still gets torn down either way,
                        // since it isn't owned by self.
                        snapshot.insert(lease.partition_id.clone(), lost_to_unknown_owner(lease));
                    }
                    Err(source) => {
                        let partition_id = lease.partition_id.clone();
                        let error = Error::store(ActionTag::CheckingLeases, Some(partition_id.clone()), source);
                        self.notify(&error, ActionTag::CheckingLeases, Some(&partition_id));
                    }
                }
            } else {
                snapshot.insert(lease.partition_id.clone(), lease);
            }
        }

        Ok(snapshot)
    }

    async fn try_claim(&self, lease: &Lease, holder: &str) -> Result<bool, Error> {
        self.lease_store
            .acquire_lease(lease, holder)
            .await
            .map_err(|e| Error::store(ActionTag::CheckingLeases, Some(lease.partition_id.clone()), e))
    }

    /// Ask the balancer for at most one lease to steal.
    async fn maybe_steal(&self, snapshot: &mut HashMap<PartitionId, Lease>) {
        let self_owned_count = snapshot
            .values()
            .filter(|l| l.is_owned_by(&self.config.host_id))
            .count();
        let owned_by_others: Vec<Lease> = snapshot
            .values()
            .filter(|l| !l.is_owned_by(&self.config.host_id) && l.owner().is_some())
            .cloned()
            .collect();

        let Some(target) = balancer::steal(&owned_by_others, self_owned_count) else {
            return;
        };

        match self.lease_store.acquire_lease(&target, &self.config.host_id).await {
            Ok(true) => {
                let duration = self.lease_store.lease_duration();
                snapshot.insert(
                    target.partition_id.clone(),
                    self_owned(target, &self.config.host_id, duration),
                );
            }
            Ok(false) => {
                // Lost the race for the steal target; try again next iteration.
            }
            Err(source) => {
                let partition_id = target.partition_id.clone();
                let error = Error::store(ActionTag::StealingLease, Some(partition_id.clone()), source);
                self.notify(&error, ActionTag::StealingLease, Some(&partition_id));
            }
        }
    }

    /// Map the snapshot to running pumps.
    async fn reconcile_pumps(&self, snapshot: HashMap<PartitionId, Lease>) {
        for (partition_id, lease) in snapshot {
            if lease.is_owned_by(&self.config.host_id) {
                self.pump_supervisor.add_pump(partition_id, lease).await;
            } else if let Some(handle) = self
                .pump_supervisor
                .remove_pump(&partition_id, TerminationReason::LeaseLost)
                .await
            {
                // Deliberate serialization point: wait for the old pump to
                // release before the next iteration can re-acquire.
                let _ = handle.await;
            }
        }
    }

    /// Set the stop flag and wait for the loop (and its cleanup) to finish.
    ///
    /// A second, concurrent call (an operator escalating an unresponsive
    /// shutdown) aborts any cleanup already in flight instead of queuing
    /// behind it: remaining pump handles are abandoned rather than awaited,
    /// which is safe because their leases simply expire and get picked up
    /// elsewhere.
    pub async fn stop_partitions(&self) {
        if self.stop.is_cancelled() {
            self.cleanup_abort.cancel();
        }
        self.stop.cancel();
        let handle = self.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn cleanup(&self) {
        let handles = self.pump_supervisor.remove_all_pumps(TerminationReason::Shutdown).await;
        for handle in handles {
            tokio::select! {
                _ = self.cleanup_abort.cancelled() => {
                    log::warn!(
                        "host={} cleanup aborted by a second stop signal; abandoning remaining pump handles",
                        self.config.host_id
                    );
                    break;
                }
                result = handle => {
                    if let Err(join_error) = result {
                        let error = Error::store(ActionTag::PartitionManagerCleanup, None, join_error);
                        self.notify(&error, ActionTag::PartitionManagerCleanup, None);
                    }
                }
            }
        }
    }
}

fn self_owned(mut lease: Lease, host_id: &str, duration: std::time::Duration) -> Lease {
    lease.owner = Some(host_id.to_string());
    lease.expiry = std::time::Instant::now() + duration;
    lease
}

/// Owner sentinel for a lease whose `renew_lease` call reported `Ok(false)`:
/// the store's boolean-only interface tells us we lost it, but not who to.
const UNKNOWN_OWNER: &str = "<unknown>";

fn lost_to_unknown_owner(mut lease: Lease) -> Lease {
    lease.owner = Some(UNKNOWN_OWNER.to_string());
    lease
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::{Pump, PumpFactory, TokioPumpSupervisor};
    use crate::store::{InMemoryCheckpointStore, InMemoryLeaseStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken as Cancel;

    struct NoopPump;

    #[async_trait::async_trait]
    impl Pump for NoopPump {
        async fn run(self: Box<Self>, mut lease: watch::Receiver<Lease>, shutdown: Cancel) {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = lease.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    fn noop_factory() -> impl PumpFactory {
        |_: &PartitionId, _: &Lease| Box::new(NoopPump) as Box<dyn Pump>
    }

    fn partitions(n: usize) -> Vec<PartitionId> {
        (0..n).map(|i| PartitionId::new(format!("p{i}"))).collect()
    }

    #[tokio::test]
    async fn cold_start_single_host_claims_every_partition() {
        let store = InMemoryLeaseStore::new(Duration::from_millis(5), Duration::from_millis(200));
        let checkpoints = InMemoryCheckpointStore::default();
        let supervisor = TokioPumpSupervisor::new(noop_factory());
        let ids = partitions(4);
        let manager = PartitionManager::new(
            store,
            checkpoints,
            supervisor,
            ids.clone(),
            PartitionManagerConfig::new("host-a"),
        );

        manager.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(manager.pump_supervisor().running_count(), 4);
        assert_eq!(manager.lease_store().owned_by("host-a").len(), 4);

        manager.stop_partitions().await;
        assert_eq!(manager.pump_supervisor().running_count(), 0);
    }

    #[tokio::test]
    async fn second_host_converges_to_an_even_split() {
        let store = Arc::new(InMemoryLeaseStore::new(
            Duration::from_millis(5),
            Duration::from_millis(500),
        ));
        let ids = partitions(4);
        for id in &ids {
            store.create_lease_if_absent(id).await.unwrap();
            store.seed_owner(id, "host-a");
        }
        store.create_lease_store_if_absent().await.unwrap();

        let manager_a = PartitionManager::new(
            store.clone(),
            InMemoryCheckpointStore::default(),
            TokioPumpSupervisor::new(noop_factory()),
            ids.clone(),
            PartitionManagerConfig::new("host-a"),
        );
        manager_a.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let manager_b = PartitionManager::new(
            store.clone(),
            InMemoryCheckpointStore::default(),
            TokioPumpSupervisor::new(noop_factory()),
            ids.clone(),
            PartitionManagerConfig::new("host-b"),
        );
        manager_b.initialize().await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        let a_count = manager_a.pump_supervisor().running_count();
        let b_count = manager_b.pump_supervisor().running_count();
        assert_eq!(a_count + b_count, 4);
        assert_eq!(a_count, 2);
        assert_eq!(b_count, 2);

        manager_a.stop_partitions().await;
        manager_b.stop_partitions().await;
    }

    #[tokio::test]
    async fn uneven_partition_count_halts_at_a_gap_of_one() {
        let store = Arc::new(InMemoryLeaseStore::new(
            Duration::from_millis(5),
            Duration::from_millis(500),
        ));
        let ids = partitions(5);
        for id in &ids {
            store.create_lease_if_absent(id).await.unwrap();
            store.seed_owner(id, "host-a");
        }
        store.create_lease_store_if_absent().await.unwrap();

        let manager_a = PartitionManager::new(
            store.clone(),
            InMemoryCheckpointStore::default(),
            TokioPumpSupervisor::new(noop_factory()),
            ids.clone(),
            PartitionManagerConfig::new("host-a"),
        );
        manager_a.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let manager_b = PartitionManager::new(
            store.clone(),
            InMemoryCheckpointStore::default(),
            TokioPumpSupervisor::new(noop_factory()),
            ids.clone(),
            PartitionManagerConfig::new("host-b"),
        );
        manager_b.initialize().await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        let a_count = manager_a.pump_supervisor().running_count();
        let b_count = manager_b.pump_supervisor().running_count();
        assert_eq!(a_count + b_count, 5);
        assert!((a_count as i64 - b_count as i64).abs() <= 1);

        manager_a.stop_partitions().await;
        manager_b.stop_partitions().await;
    }

    #[tokio::test]
    async fn lost_renewal_tears_down_the_pump() {
        let store = InMemoryLeaseStore::new(Duration::from_millis(5), Duration::from_millis(200));
        let ids = partitions(1);
        let manager = PartitionManager::new(
            store,
            InMemoryCheckpointStore::default(),
            TokioPumpSupervisor::new(noop_factory()),
            ids.clone(),
            PartitionManagerConfig::new("host-a"),
        );
        manager.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.pump_supervisor().running_count(), 1);

        // Simulate a competing host winning a concurrent renewal underneath us.
        manager.lease_store().seed_owner(&ids[0], "host-b");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.pump_supervisor().running_count(), 0);
        manager.stop_partitions().await;
    }

    #[tokio::test]
    async fn transient_store_error_is_skipped_without_disturbing_a_running_pump() {
        let store = InMemoryLeaseStore::new(Duration::from_millis(5), Duration::from_millis(200));
        let ids = partitions(1);
        let manager = PartitionManager::new(
            store,
            InMemoryCheckpointStore::default(),
            TokioPumpSupervisor::new(noop_factory()),
            ids.clone(),
            PartitionManagerConfig::new("host-a"),
        );
        manager.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.pump_supervisor().running_count(), 1);

        manager.lease_store().inject_failure(ids[0].clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.pump_supervisor().running_count(), 1);
        assert_eq!(manager.lease_store().owned_by("host-a"), vec![ids[0].clone()]);

        manager.stop_partitions().await;
    }

    #[tokio::test]
    async fn stop_partitions_tears_down_every_pump() {
        let store = InMemoryLeaseStore::new(Duration::from_millis(5), Duration::from_millis(200));
        let ids = partitions(3);
        let manager = PartitionManager::new(
            store,
            InMemoryCheckpointStore::default(),
            TokioPumpSupervisor::new(noop_factory()),
            ids.clone(),
            PartitionManagerConfig::new("host-a"),
        );
        manager.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(manager.pump_supervisor().running_count(), 3);

        manager.stop_partitions().await;
        assert_eq!(manager.pump_supervisor().running_count(), 0);
    }
}
