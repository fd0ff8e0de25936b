//! SSE Gateway: turns one log channel into a stream of frames for a single
//! connection.
//!
//! Each connection runs its own poll loop. Reads are exclusive of the
//! cursor, empty reads back off exponentially, and a terminal entry ends the
//! connection right after it is forwarded. The loop never blocks on a slow
//! consumer for long: a frame channel that stays full counts as a close.

mod backoff;

pub use backoff::PollBackoff;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::config::GatewayConfig;
use crate::domain::{ChannelKey, StreamEntry, StreamId};
use crate::observability::stream_span;
use crate::ports::EventLog;

/// One stream subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub channel: ChannelKey,
    /// Resume strictly after this id.
    pub last_event_id: Option<StreamId>,
    /// Without a cursor, start from the newest entry instead of the
    /// beginning of the log.
    pub from_latest: bool,
}

impl StreamRequest {
    pub fn new(channel: ChannelKey) -> Self {
        Self {
            channel,
            last_event_id: None,
            from_latest: false,
        }
    }

    pub fn resume_after(mut self, id: StreamId) -> Self {
        self.last_event_id = Some(id);
        self
    }

    pub fn from_latest(mut self, from_latest: bool) -> Self {
        self.from_latest = from_latest;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayFrame {
    Entry(StreamEntry),
    KeepAlive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Terminal,
    IdleTimeout,
    ClientGone,
    Backpressure,
    StoreError,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Terminal => "terminal",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::ClientGone => "client_gone",
            CloseReason::Backpressure => "backpressure",
            CloseReason::StoreError => "store_error",
        }
    }
}

/// Close state shared by the poll loop and the stream handle.
#[derive(Debug)]
struct Connection {
    channel: ChannelKey,
    token: CancellationToken,
    reason: Mutex<Option<CloseReason>>,
}

impl Connection {
    fn new(channel: ChannelKey) -> Self {
        Self {
            channel,
            token: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    /// First caller wins; returns false if already closed.
    fn close(&self, reason: CloseReason) -> bool {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.token.cancel();
        info!(channel = %self.channel, reason = reason.as_str(), "stream closed");
        true
    }

    fn reason(&self) -> Option<CloseReason> {
        *self.reason.lock()
    }
}

/// Receiving end of one connection. Dropping it closes the connection.
#[derive(Debug)]
pub struct GatewayStream {
    frames: mpsc::Receiver<GatewayFrame>,
    connection: Arc<Connection>,
    task: Option<JoinHandle<CloseReason>>,
}

impl GatewayStream {
    /// Next frame; `None` once the connection has closed and drained.
    pub async fn recv(&mut self) -> Option<GatewayFrame> {
        self.frames.recv().await
    }

    /// Client abort. Idempotent.
    pub fn close(&self) -> bool {
        self.connection.close(CloseReason::ClientGone)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.connection.reason()
    }

    /// Wait for the poll loop to finish and report why it stopped.
    pub async fn closed(&mut self) -> Option<CloseReason> {
        match self.task.take() {
            Some(task) => task.await.ok(),
            None => self.connection.reason(),
        }
    }
}

impl Drop for GatewayStream {
    fn drop(&mut self) {
        self.connection.close(CloseReason::ClientGone);
    }
}

#[derive(Clone)]
pub struct SseGateway {
    log: Arc<dyn EventLog>,
    config: GatewayConfig,
}

enum Start {
    After(Option<StreamId>),
    /// Fast-forward landed on an entry that already ended the stream.
    Finished(StreamEntry),
}

impl SseGateway {
    pub fn new(log: Arc<dyn EventLog>, config: GatewayConfig) -> Self {
        Self { log, config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn open(&self, request: StreamRequest) -> GatewayStream {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let connection = Arc::new(Connection::new(request.channel.clone()));
        let start = self.starting_point(&request).await;

        let poller = Poller {
            log: Arc::clone(&self.log),
            config: self.config.clone(),
            channel: request.channel.clone(),
            tx,
            connection: Arc::clone(&connection),
        };
        let span = stream_span(request.channel.as_str());
        let task = tokio::spawn(
            async move {
                let reason = poller.run(start).await;
                poller.connection.close(reason);
                reason
            }
            .instrument(span),
        );

        GatewayStream {
            frames: rx,
            connection,
            task: Some(task),
        }
    }

    async fn starting_point(&self, request: &StreamRequest) -> Start {
        if request.last_event_id.is_some() || !request.from_latest {
            return Start::After(request.last_event_id);
        }
        match self.log.latest(&request.channel).await {
            Ok(Some(entry)) if entry.event.is_terminal() => Start::Finished(entry),
            Ok(latest) => Start::After(latest.map(|entry| entry.id)),
            Err(err) => {
                warn!(channel = %request.channel, error = %err, "fast-forward read failed, replaying from start");
                Start::After(None)
            }
        }
    }
}

struct Poller {
    log: Arc<dyn EventLog>,
    config: GatewayConfig,
    channel: ChannelKey,
    tx: mpsc::Sender<GatewayFrame>,
    connection: Arc<Connection>,
}

impl Poller {
    async fn run(&self, start: Start) -> CloseReason {
        let mut cursor = match start {
            Start::After(cursor) => cursor,
            Start::Finished(entry) => {
                return match self.forward(GatewayFrame::Entry(entry)).await {
                    Ok(()) => CloseReason::Terminal,
                    Err(reason) => reason,
                };
            }
        };

        let mut backoff = PollBackoff::new(self.config.poll_min(), self.config.poll_max());
        let keepalive_every = self.config.keepalive().max(Duration::from_millis(1));
        let mut keepalive = tokio::time::interval_at(Instant::now() + keepalive_every, keepalive_every);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_data = Instant::now();

        loop {
            if self.connection.token.is_cancelled() {
                return CloseReason::ClientGone;
            }

            let entries = match self
                .log
                .read_after(&self.channel, cursor, self.config.read_batch)
                .await
            {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(channel = %self.channel, error = %err, "stream read failed");
                    return CloseReason::StoreError;
                }
            };

            let delay = if entries.is_empty() {
                if last_data.elapsed() >= self.config.idle_timeout() {
                    return CloseReason::IdleTimeout;
                }
                backoff.next_delay()
            } else {
                let full_page = entries.len() >= self.config.read_batch;
                debug!(channel = %self.channel, count = entries.len(), "relaying entries");
                for entry in entries {
                    let terminal = entry.event.is_terminal();
                    cursor = Some(entry.id);
                    if let Err(reason) = self.forward(GatewayFrame::Entry(entry)).await {
                        return reason;
                    }
                    if terminal {
                        return CloseReason::Terminal;
                    }
                }
                last_data = Instant::now();
                backoff.reset();
                if full_page { Duration::ZERO } else { backoff.min() }
            };

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    biased;
                    _ = self.connection.token.cancelled() => return CloseReason::ClientGone,
                    _ = &mut sleep => break,
                    _ = keepalive.tick() => {
                        if let Err(reason) = self.forward(GatewayFrame::KeepAlive).await {
                            return reason;
                        }
                    }
                }
            }
        }
    }

    /// Hand a frame to the connection. A consumer that makes no room within
    /// `poll_max` is treated as gone.
    async fn forward(&self, frame: GatewayFrame) -> Result<(), CloseReason> {
        let frame = match self.tx.try_send(frame) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(CloseReason::ClientGone),
            Err(TrySendError::Full(frame)) => frame,
        };

        tokio::select! {
            biased;
            _ = self.connection.token.cancelled() => Err(CloseReason::ClientGone),
            permit = tokio::time::timeout(self.config.poll_max(), self.tx.reserve()) => match permit {
                Ok(Ok(permit)) => {
                    permit.send(frame);
                    Ok(())
                }
                Ok(Err(_)) => Err(CloseReason::ClientGone),
                Err(_) => Err(CloseReason::Backpressure),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Event, EventBody, Phase, PipelineStatus, StageStatus, TaskId};
    use crate::impls::InMemoryEventLog;
    use crate::ports::ManualClock;
    use chrono::{TimeZone, Utc};

    fn channel() -> ChannelKey {
        ChannelKey::for_task("jobs", "u1", &TaskId::new("vision-1"))
    }

    fn log() -> InMemoryEventLog {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        InMemoryEventLog::new(Arc::new(clock))
    }

    fn gateway(log: &InMemoryEventLog, config: GatewayConfig) -> SseGateway {
        SseGateway::new(Arc::new(log.clone()), config)
    }

    async fn append_starts(log: &InMemoryEventLog, n: usize) -> Vec<StreamId> {
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            ids.push(log.append(&channel(), &Event::new(EventBody::Start)).await.unwrap().id);
        }
        ids
    }

    fn done() -> Event {
        Event::new(EventBody::Done {
            text: Some("all".into()),
            data: None,
            usage: None,
        })
    }

    async fn next_entry(stream: &mut GatewayStream) -> Option<StreamEntry> {
        loop {
            match stream.recv().await? {
                GatewayFrame::Entry(entry) => return Some(entry),
                GatewayFrame::KeepAlive => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_strictly_after_cursor() {
        let log = log();
        let ids = append_starts(&log, 10).await;
        let gateway = gateway(&log, GatewayConfig::default());

        let mut stream = gateway
            .open(StreamRequest::new(channel()).resume_after(ids[4]))
            .await;

        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(next_entry(&mut stream).await.unwrap().id);
        }
        assert_eq!(received, ids[5..].to_vec());

        assert!(stream.close());
        assert!(!stream.close());
        assert_eq!(stream.closed().await, Some(CloseReason::ClientGone));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_entry_closes_without_further_reads() {
        let log = log();
        append_starts(&log, 3).await;
        log.append(&channel(), &done()).await.unwrap();
        let gateway = gateway(&log, GatewayConfig::default());

        let mut stream = gateway.open(StreamRequest::new(channel())).await;

        let mut kinds = Vec::new();
        while let Some(entry) = next_entry(&mut stream).await {
            kinds.push(entry.event.body.kind());
        }
        assert_eq!(kinds, vec!["start", "start", "start", "done"]);
        assert_eq!(stream.closed().await, Some(CloseReason::Terminal));

        let reads = log.read_calls();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(log.read_calls(), reads);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_status_is_terminal() {
        let log = log();
        log.append(
            &channel(),
            &Event::status(
                TaskId::new("vision-1"),
                PipelineStatus::at(Phase::JobVision, StageStatus::Failed),
            ),
        )
        .await
        .unwrap();
        let gateway = gateway(&log, GatewayConfig::default());

        let mut stream = gateway.open(StreamRequest::new(channel())).await;

        assert!(next_entry(&mut stream).await.is_some());
        assert!(next_entry(&mut stream).await.is_none());
        assert_eq!(stream.close_reason(), Some(CloseReason::Terminal));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_appended_later_are_picked_up_by_polling() {
        let log = log();
        let gateway = gateway(&log, GatewayConfig::default());
        let mut stream = gateway.open(StreamRequest::new(channel())).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        let id = log.append(&channel(), &Event::new(EventBody::Start)).await.unwrap().id;

        assert_eq!(next_entry(&mut stream).await.unwrap().id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn from_latest_skips_history() {
        let log = log();
        append_starts(&log, 3).await;
        let gateway = gateway(&log, GatewayConfig::default());

        let mut stream = gateway
            .open(StreamRequest::new(channel()).from_latest(true))
            .await;
        let fresh = log.append(&channel(), &done()).await.unwrap();

        let entry = next_entry(&mut stream).await.unwrap();
        assert_eq!(entry.id, fresh.id);
        assert!(next_entry(&mut stream).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn from_latest_on_finished_stream_delivers_the_terminal_entry() {
        let log = log();
        append_starts(&log, 2).await;
        let last = log.append(&channel(), &done()).await.unwrap();
        let gateway = gateway(&log, GatewayConfig::default());

        let mut stream = gateway
            .open(StreamRequest::new(channel()).from_latest(true))
            .await;

        assert_eq!(next_entry(&mut stream).await.unwrap().id, last.id);
        assert!(next_entry(&mut stream).await.is_none());
        assert_eq!(log.read_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_is_sent_while_idle() {
        let log = log();
        let config = GatewayConfig {
            keepalive_secs: 1,
            ..GatewayConfig::default()
        };
        let gateway = gateway(&log, config);
        let mut stream = gateway.open(StreamRequest::new(channel())).await;

        assert_eq!(stream.recv().await, Some(GatewayFrame::KeepAlive));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_times_out() {
        let log = log();
        let config = GatewayConfig {
            idle_timeout_secs: 1,
            keepalive_secs: 60,
            ..GatewayConfig::default()
        };
        let gateway = gateway(&log, config);
        let mut stream = gateway.open(StreamRequest::new(channel())).await;

        assert!(stream.recv().await.is_none());
        assert_eq!(stream.closed().await, Some(CloseReason::IdleTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_consumer_is_closed_for_backpressure() {
        let log = log();
        append_starts(&log, 3).await;
        let config = GatewayConfig {
            channel_capacity: 1,
            ..GatewayConfig::default()
        };
        let gateway = gateway(&log, config);
        let mut stream = gateway.open(StreamRequest::new(channel())).await;

        assert_eq!(stream.closed().await, Some(CloseReason::Backpressure));
    }
}
