use crate::model::PartitionId;
use std::fmt;

/// Closed set of action tags carried on every error-channel notification.
///
/// Kept as a plain enum rather than a string so a [`NotificationSink`] can
/// exhaustively match on it (e.g. to drive per-reason metrics) instead of
/// parsing free text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionTag {
    CreatingLeaseStore,
    CreatingLease,
    CreatingCheckpointStore,
    CreatingCheckpoint,
    CheckingLeases,
    StealingLease,
    PartitionManagerMainLoop,
    PartitionManagerCleanup,
}

impl fmt::Display for ActionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionTag::CreatingLeaseStore => "CreatingLeaseStore",
            ActionTag::CreatingLease => "CreatingLease",
            ActionTag::CreatingCheckpointStore => "CreatingCheckpointStore",
            ActionTag::CreatingCheckpoint => "CreatingCheckpoint",
            ActionTag::CheckingLeases => "CheckingLeases",
            ActionTag::StealingLease => "StealingLease",
            ActionTag::PartitionManagerMainLoop => "PartitionManagerMainLoop",
            ActionTag::PartitionManagerCleanup => "PartitionManagerCleanup",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the coordinator and its store collaborators.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A store-reported failure for a specific (or store-wide) operation.
    #[error("{action} failed{partition}: {source}")]
    Store {
        action: ActionTag,
        partition: PartitionDisplay,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The fatal, retry-exhausted init failure of step 2-5 in the init phase.
    #[error("initialization step {action} failed after retry budget exhausted: {source}")]
    Init {
        action: ActionTag,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A record returned by a store was missing a field this crate requires.
    #[error("key {0} not found in store record")]
    Format(String),
}

/// Wrapper so [`Error::Store`]'s `Display` impl can render "for partition P"
/// or nothing, without making the field itself `Option` at every call site.
#[derive(Debug)]
pub struct PartitionDisplay(pub Option<PartitionId>);

impl fmt::Display for PartitionDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(p) => write!(f, " for partition {p}"),
            None => Ok(()),
        }
    }
}

impl Error {
    pub fn store(
        action: ActionTag,
        partition: Option<PartitionId>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Store {
            action,
            partition: PartitionDisplay(partition),
            source: Box::new(source),
        }
    }

    pub fn init(action: ActionTag, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Init {
            action,
            source: Box::new(source),
        }
    }
}

/// Sink embedders implement to observe recovered errors without the manager
/// ever crashing.
///
/// `host_id` and `partition_id` are passed separately from `error` (rather
/// than folded into one string) so a sink can attach them as structured
/// fields to its own logging/metrics system.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, host_id: &str, error: &Error, tag: ActionTag, partition_id: Option<&PartitionId>);
}

/// Default sink: forwards every notification to the `log` facade.
///
/// `CreatingLeaseStore`/`CreatingLease`/`CreatingCheckpointStore`/
/// `CreatingCheckpoint`/`PartitionManagerMainLoop` log at `error`; everything
/// else (recoverable per-iteration failures) logs at `warn`.
#[derive(Default, Debug, Clone, Copy)]
pub struct LoggingSink;

impl NotificationSink for LoggingSink {
    fn notify(&self, host_id: &str, error: &Error, tag: ActionTag, partition_id: Option<&PartitionId>) {
        let partition = partition_id
            .map(|p| p.to_string())
            .unwrap_or_else(|| "<none>".to_string());
        match tag {
            ActionTag::CreatingLeaseStore
            | ActionTag::CreatingLease
            | ActionTag::CreatingCheckpointStore
            | ActionTag::CreatingCheckpoint
            | ActionTag::PartitionManagerMainLoop => {
                log::error!("host={host_id} action={tag} partition={partition}: {error}");
            }
            _ => {
                log::warn!("host={host_id} action={tag} partition={partition}: {error}");
            }
        }
    }
}

/// A notification, as delivered to a [`ChannelSink`]'s receiver.
#[derive(Debug)]
pub struct Notification {
    pub host_id: String,
    pub tag: ActionTag,
    pub partition_id: Option<PartitionId>,
    pub message: String,
}

/// Sink for embedders who want to consume notifications programmatically
/// (e.g. to export metrics) rather than scraping log lines.
///
/// An unbounded channel so a slow or absent receiver never blocks the
/// reconciliation loop.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, host_id: &str, error: &Error, tag: ActionTag, partition_id: Option<&PartitionId>) {
        // The receiver may have been dropped (e.g. the embedder doesn't care
        // anymore); that's not itself an error worth propagating.
        let _ = self.tx.send(Notification {
            host_id: host_id.to_string(),
            tag,
            partition_id: partition_id.cloned(),
            message: error.to_string(),
        });
    }
}
