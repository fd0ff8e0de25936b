use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::ExecutionKind;
use crate::queue::{Delivery, DeliveryLease, QueueError, TaskQueue};
use crate::worker::{Worker, WorkerResponse};

/// Retry-After used when a throttled response did not name one.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Where a leased delivery is sent.
#[async_trait]
pub trait DeliveryTarget: Send + Sync {
    async fn deliver(&self, delivery: &Delivery) -> WorkerResponse;
}

/// In-process delivery: the URL path picks kind and service.
#[async_trait]
impl DeliveryTarget for Worker {
    async fn deliver(&self, delivery: &Delivery) -> WorkerResponse {
        let Some((kind, service_id)) = parse_worker_url(&delivery.url) else {
            return WorkerResponse::bad_request(format!("not a worker url: {}", delivery.url));
        };
        self.handle_invocation(kind, service_id, delivery.invocation.clone())
            .await
    }
}

/// `{base}/worker/{kind}/{service}` -> `(kind, service)`.
pub fn parse_worker_url(url: &str) -> Option<(ExecutionKind, &str)> {
    let (_, rest) = url.rsplit_once("/worker/")?;
    let (kind, service) = rest.split_once('/')?;
    if service.is_empty() || service.contains('/') {
        return None;
    }
    Some((kind.parse().ok()?, service))
}

/// Dispatcher group handle.
/// - dropping `shutdown_tx` stops every dispatcher
/// - `shutdown_and_join()` waits for all of them
pub struct DispatcherGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl DispatcherGroup {
    /// Spawn `n` dispatchers.
    pub fn spawn(n: usize, queue: Arc<dyn TaskQueue>, target: Arc<dyn DeliveryTarget>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for dispatcher_id in 0..n {
            let q = Arc::clone(&queue);
            let t = Arc::clone(&target);
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                dispatch_loop(dispatcher_id, q, t, &mut rx).await;
            });
            joins.push(join);
        }

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stop taking new leases. In-flight deliveries run to completion.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}

async fn dispatch_loop(
    dispatcher_id: usize,
    queue: Arc<dyn TaskQueue>,
    target: Arc<dyn DeliveryTarget>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let lease = tokio::select! {
            _ = shutdown_rx.changed() => continue,
            lease = queue.lease() => lease,
        };

        // Queue closed.
        let Some(lease) = lease else {
            break;
        };

        let message_id = lease.message_id();
        let response = target.deliver(lease.delivery()).await;
        debug!(dispatcher_id, %message_id, status = response.status.as_u16(), "delivery answered");

        if let Err(err) = settle(lease, &response).await {
            warn!(dispatcher_id, %message_id, error = %err, "failed to settle delivery");
        }
    }
}

/// 2xx ack, 429 retry later, other 4xx reject, anything else fail.
async fn settle(lease: Box<dyn DeliveryLease>, response: &WorkerResponse) -> Result<(), QueueError> {
    let status = response.status;
    if status.is_success() {
        lease.ack().await
    } else if status.as_u16() == 429 {
        let delay = response.retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
        lease.retry_after(delay, response.body.to_string()).await
    } else if status.is_client_error() {
        lease.reject(response.body.to_string()).await
    } else {
        lease.fail(response.body.to_string()).await
    }
}
