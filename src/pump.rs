//! The supervisor boundary between the partition manager and the
//! per-partition workers ("pumps") that actually receive and dispatch
//! events.
//!
//! The receive/dispatch logic itself is out of scope for this crate — that's
//! the embedder's event-hub client. What lives here is the generic part: a
//! `Pump` trait small enough for an embedder to implement, a `PumpFactory`
//! to construct one per partition, and a `PumpSupervisor` contract (plus a
//! `tokio`-task-based reference implementation) the manager drives.

use crate::model::{Lease, PartitionId, TerminationReason};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// A running subscriber for one partition.
///
/// `lease` is delivered as a [`watch::Receiver`] rather than a plain value so
/// that a lease refresh (the manager calling `add_pump` again on an already
/// running pump) can be observed without restarting the task.
#[async_trait]
pub trait Pump: Send + 'static {
    async fn run(self: Box<Self>, lease: watch::Receiver<Lease>, shutdown: CancellationToken);
}

/// Constructs a [`Pump`] for a partition the host has just acquired.
pub trait PumpFactory: Send + Sync {
    fn create(&self, partition_id: &PartitionId, lease: &Lease) -> Box<dyn Pump>;
}

impl<F> PumpFactory for F
where
    F: Fn(&PartitionId, &Lease) -> Box<dyn Pump> + Send + Sync,
{
    fn create(&self, partition_id: &PartitionId, lease: &Lease) -> Box<dyn Pump> {
        self(partition_id, lease)
    }
}

/// A handle resolving when a pump has fully released its subscriber and the
/// partition is safe to recreate.
///
/// Deliberately awaitable directly (`handle.await`) rather than exposing a
/// `.wait()` method, so call sites read as a plain synchronous await on the
/// returned handle. Resolves to `Err` if the pump task panicked, so a caller
/// that cares (the manager's cleanup path does) can still report it instead
/// of silently treating a panic as a clean release.
pub struct RemovalHandle(Pin<Box<dyn Future<Output = Result<(), JoinError>> + Send>>);

impl Future for RemovalHandle {
    type Output = Result<(), JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

fn handle_from_join(join: JoinHandle<()>) -> RemovalHandle {
    RemovalHandle(Box::pin(join))
}

/// Owns the set of running pumps.
///
/// `add_pump` is idempotent: if no pump exists for the partition, one is
/// started; if one already exists, its lease is refreshed in place via the
/// `watch` channel instead of restarting the task.
#[async_trait]
pub trait PumpSupervisor: Send + Sync {
    async fn add_pump(&self, partition_id: PartitionId, lease: Lease);
    async fn remove_pump(
        &self,
        partition_id: &PartitionId,
        reason: TerminationReason,
    ) -> Option<RemovalHandle>;
    async fn remove_all_pumps(&self, reason: TerminationReason) -> Vec<RemovalHandle>;
}

struct Tracked {
    lease_tx: watch::Sender<Lease>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Reference [`PumpSupervisor`] implementation: one tokio task per tracked
/// partition, torn down via a per-pump [`CancellationToken`].
pub struct TokioPumpSupervisor<F: PumpFactory> {
    factory: F,
    pumps: Mutex<HashMap<PartitionId, Tracked>>,
}

impl<F: PumpFactory> TokioPumpSupervisor<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            pumps: Mutex::new(HashMap::new()),
        }
    }

    /// Number of pumps currently tracked; exposed for tests asserting
    /// pump/lease coherence.
    pub fn running_count(&self) -> usize {
        self.pumps.lock().unwrap().len()
    }

    pub fn is_running(&self, partition_id: &PartitionId) -> bool {
        self.pumps.lock().unwrap().contains_key(partition_id)
    }
}

#[async_trait]
impl<F: PumpFactory + 'static> PumpSupervisor for TokioPumpSupervisor<F> {
    async fn add_pump(&self, partition_id: PartitionId, lease: Lease) {
        let existing_tx = {
            let pumps = self.pumps.lock().unwrap();
            pumps.get(&partition_id).map(|t| t.lease_tx.clone())
        };

        if let Some(lease_tx) = existing_tx {
            // Idempotent refresh: the running pump observes the new lease the
            // next time it inspects the watch channel.
            let _ = lease_tx.send(lease);
            return;
        }

        let pump = self.factory.create(&partition_id, &lease);
        let (lease_tx, lease_rx) = watch::channel(lease);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            pump.run(lease_rx, task_cancel).await;
        });

        self.pumps.lock().unwrap().insert(
            partition_id,
            Tracked {
                lease_tx,
                cancel,
                join,
            },
        );
    }

    async fn remove_pump(
        &self,
        partition_id: &PartitionId,
        reason: TerminationReason,
    ) -> Option<RemovalHandle> {
        let tracked = self.pumps.lock().unwrap().remove(partition_id)?;
        log::debug!("tearing down pump for partition {partition_id}: {reason}");
        tracked.cancel.cancel();
        Some(handle_from_join(tracked.join))
    }

    async fn remove_all_pumps(&self, reason: TerminationReason) -> Vec<RemovalHandle> {
        let tracked: Vec<Tracked> = self.pumps.lock().unwrap().drain().map(|(_, t)| t).collect();
        log::debug!("tearing down {} pumps: {reason}", tracked.len());
        tracked
            .into_iter()
            .map(|t| {
                t.cancel.cancel();
                handle_from_join(t.join)
            })
            .collect()
    }
}
