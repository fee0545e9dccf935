//! Serialized settlement of elapsed time into the aggregate.
//!
//! The store has no transactions, so two overlapping read-modify-write
//! cycles on the aggregate would lose one contribution. Every mutation of
//! [`TRACKER_STORAGE_KEY`] therefore goes through a single worker task that
//! processes requests one at a time, in submission order.
//!
//! Submission and acknowledgement are separate: [`SettlementQueue::dispatch`]
//! only enqueues and hands back a [`PendingSettlement`]. Callers that must
//! not wait on the store (the tracker) poll it later; dropping it does not
//! cancel the request, since once submitted the worker completes it.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::aggregate::{AggregateMap, TRACKER_STORAGE_KEY};
use crate::store::{KeyValueStore, StoreError};
use crate::types::DomainKey;

/// Settlement errors.
#[derive(Debug, Error)]
pub enum SettleError {
    /// The store rejected the read or the write.
    #[error("settlement failed: {0}")]
    Store(#[from] StoreError),
    /// The worker task is no longer running.
    #[error("settlement worker stopped")]
    WorkerGone,
}

enum Request {
    Settle {
        domain: DomainKey,
        seconds: f64,
        reply: oneshot::Sender<Result<f64, StoreError>>,
    },
    Initialize {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<AggregateMap, StoreError>>,
    },
    Clear {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

/// Handle to the settlement worker.
///
/// Cloning the handle shares the same worker. The worker exits once every
/// handle has been dropped and the queue has drained.
#[derive(Clone)]
pub struct SettlementQueue {
    tx: mpsc::UnboundedSender<Request>,
}

impl std::fmt::Debug for SettlementQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementQueue")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl SettlementQueue {
    /// Spawns the worker on the current tokio runtime.
    pub fn spawn(store: Arc<dyn KeyValueStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(store, rx));
        Self { tx }
    }

    /// Queues `seconds` for `domain` without waiting for the store.
    ///
    /// The returned handle yields the new total once the write is
    /// acknowledged.
    pub fn dispatch(
        &self,
        domain: DomainKey,
        seconds: f64,
    ) -> Result<PendingSettlement<f64>, SettleError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Settle {
            domain,
            seconds,
            reply,
        })?;
        Ok(PendingSettlement(rx))
    }

    /// Queues removal of the aggregate without waiting for the store.
    pub fn dispatch_clear(&self) -> Result<PendingSettlement<()>, SettleError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Clear { reply })?;
        Ok(PendingSettlement(rx))
    }

    /// Queues creation of an empty aggregate if none is stored yet.
    pub fn dispatch_initialize(&self) -> Result<PendingSettlement<()>, SettleError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Initialize { reply })?;
        Ok(PendingSettlement(rx))
    }

    /// Adds `seconds` to `domain` and returns the new total.
    ///
    /// Resolves only after the write has been acknowledged by the store.
    pub async fn settle(&self, domain: DomainKey, seconds: f64) -> Result<f64, SettleError> {
        self.dispatch(domain, seconds)?.wait().await
    }

    /// Creates an empty aggregate if none is stored yet.
    pub async fn initialize(&self) -> Result<(), SettleError> {
        self.dispatch_initialize()?.wait().await
    }

    /// Reads the aggregate, ordered after every previously submitted request.
    pub async fn snapshot(&self) -> Result<AggregateMap, SettleError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Snapshot { reply })?;
        PendingSettlement(rx).wait().await
    }

    /// Removes the aggregate entirely.
    pub async fn clear(&self) -> Result<(), SettleError> {
        self.dispatch_clear()?.wait().await
    }

    fn submit(&self, request: Request) -> Result<(), SettleError> {
        self.tx.send(request).map_err(|_| SettleError::WorkerGone)
    }
}

/// Acknowledgement of a queued request.
///
/// Dropping it does not cancel the request.
#[derive(Debug)]
pub struct PendingSettlement<T>(oneshot::Receiver<Result<T, StoreError>>);

impl<T> PendingSettlement<T> {
    /// Waits for the worker to finish the request.
    pub async fn wait(self) -> Result<T, SettleError> {
        Ok(self.0.await.map_err(|_| SettleError::WorkerGone)??)
    }

    /// Returns the outcome if the worker has finished, without waiting.
    pub fn try_result(&mut self) -> Option<Result<T, SettleError>> {
        match self.0.try_recv() {
            Ok(result) => Some(result.map_err(SettleError::from)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(SettleError::WorkerGone)),
        }
    }
}

async fn run_worker(store: Arc<dyn KeyValueStore>, mut rx: mpsc::UnboundedReceiver<Request>) {
    while let Some(request) = rx.recv().await {
        // A closed reply channel only means the caller stopped waiting.
        match request {
            Request::Settle {
                domain,
                seconds,
                reply,
            } => {
                let result = apply(store.as_ref(), &domain, seconds).await;
                match &result {
                    Ok(total) => debug!(%domain, seconds, total, "settled"),
                    Err(e) => warn!(%domain, seconds, error = %e, "settlement not written"),
                }
                let _ = reply.send(result);
            }
            Request::Initialize { reply } => {
                let _ = reply.send(initialize(store.as_ref()).await);
            }
            Request::Snapshot { reply } => {
                let result = store
                    .get(TRACKER_STORAGE_KEY)
                    .await
                    .map(|value| AggregateMap::from_stored(value.as_ref()));
                let _ = reply.send(result);
            }
            Request::Clear { reply } => {
                let result = store.remove(TRACKER_STORAGE_KEY).await;
                if result.is_ok() {
                    debug!("aggregate cleared");
                }
                let _ = reply.send(result);
            }
        }
    }
    debug!("settlement worker stopped");
}

async fn apply(store: &dyn KeyValueStore, domain: &DomainKey, seconds: f64) -> Result<f64, StoreError> {
    let stored = store.get(TRACKER_STORAGE_KEY).await?;
    let mut aggregate = AggregateMap::from_stored(stored.as_ref());
    aggregate.add(domain, seconds);
    store.set(TRACKER_STORAGE_KEY, aggregate.to_value()).await?;
    Ok(aggregate.get(domain.as_str()).unwrap_or_default())
}

async fn initialize(store: &dyn KeyValueStore) -> Result<(), StoreError> {
    if store.get(TRACKER_STORAGE_KEY).await?.is_none() {
        store
            .set(TRACKER_STORAGE_KEY, AggregateMap::new().to_value())
            .await?;
    }
    Ok(())
}
