//! Runs a [`StreamConsumer`] against an [`SseGateway`] in-process.

use std::collections::VecDeque;

use tokio::time::{Instant, sleep_until};
use tracing::{debug, info};

use super::{ClientInput, Effect, StreamConsumer};
use crate::domain::{ChannelKey, TaskId};
use crate::gateway::{GatewayFrame, GatewayStream, SseGateway, StreamRequest};

pub struct ConsumerDriver {
    gateway: SseGateway,
    service_id: String,
    user_id: String,
    consumer: StreamConsumer,
}

impl ConsumerDriver {
    pub fn new(
        gateway: SseGateway,
        service_id: impl Into<String>,
        user_id: impl Into<String>,
        consumer: StreamConsumer,
    ) -> Self {
        Self {
            gateway,
            service_id: service_id.into(),
            user_id: user_id.into(),
            consumer,
        }
    }

    /// Follow the consumer's effects until it closes, then hand it back.
    ///
    /// Also returns when the connection is gone and no timer is left that
    /// could bring it back.
    pub async fn run(mut self) -> StreamConsumer {
        let mut stream: Option<GatewayStream> = None;
        let mut subscribed = self.consumer.active_task().clone();
        let mut flush_at: Option<Instant> = None;
        let mut reconnect_at: Option<Instant> = None;
        let mut effects: VecDeque<Effect> = self.consumer.start().into();

        loop {
            while let Some(effect) = effects.pop_front() {
                match effect {
                    Effect::Subscribe { task_id, cursor } => {
                        let mut request = StreamRequest::new(self.channel(&task_id));
                        if let Some(cursor) = cursor {
                            request = request.resume_after(cursor);
                        }
                        debug!(%task_id, ?cursor, "subscribing");
                        stream = Some(self.gateway.open(request).await);
                        subscribed = task_id;
                        effects.extend(self.consumer.apply(ClientInput::Opened));
                    }
                    Effect::ArmReconnectTimer(delay) => reconnect_at = Some(Instant::now() + delay),
                    Effect::CancelReconnectTimer => reconnect_at = None,
                    Effect::ScheduleFlush(delay) => {
                        flush_at.get_or_insert_with(|| Instant::now() + delay);
                    }
                    Effect::Closed => {
                        info!(task_id = %self.consumer.active_task(), status = %self.consumer.status(), "consumer closed");
                    }
                }
            }

            if self.consumer.is_closed() {
                break;
            }
            if stream.is_none() && reconnect_at.is_none() && flush_at.is_none() {
                break;
            }

            let input = tokio::select! {
                frame = next_frame(stream.as_mut()) => match frame {
                    Some(GatewayFrame::Entry(entry)) => ClientInput::Delivered {
                        task_id: subscribed.clone(),
                        id: entry.id,
                        event: entry.event,
                    },
                    Some(GatewayFrame::KeepAlive) => continue,
                    None => {
                        stream = None;
                        ClientInput::TransportError
                    }
                },
                _ = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    flush_at = None;
                    ClientInput::FlushTimerFired
                }
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    reconnect_at = None;
                    ClientInput::ReconnectTimerFired
                }
            };
            effects.extend(self.consumer.apply(input));
        }

        self.consumer
    }

    fn channel(&self, task_id: &TaskId) -> ChannelKey {
        ChannelKey::for_task(&self.service_id, &self.user_id, task_id)
    }
}

async fn next_frame(stream: Option<&mut GatewayStream>) -> Option<GatewayFrame> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, GatewayConfig};
    use crate::domain::{Event, EventBody, Phase, PipelineStatus, StageStatus, Tier};
    use crate::impls::InMemoryEventLog;
    use crate::ports::{Clock, EventLog, ManualClock};
    use chrono::Utc;
    use std::sync::Arc;

    fn setup() -> (InMemoryEventLog, SseGateway) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let log = InMemoryEventLog::new(clock);
        let gateway = SseGateway::new(Arc::new(log.clone()), GatewayConfig::default());
        (log, gateway)
    }

    fn channel(task: &str) -> ChannelKey {
        ChannelKey::for_task("jobs", "u1", &TaskId::new(task))
    }

    async fn append(log: &InMemoryEventLog, task: &str, event_task: &str, body: EventBody) {
        log.append(&channel(task), &Event::for_task(TaskId::new(event_task), body))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn follows_handoff_across_channels() {
        let (log, gateway) = setup();
        append(&log, "vision-1", "vision-1", EventBody::Start).await;
        append(&log, "vision-1", "vision-1", EventBody::Token { text: "seen".into() }).await;
        append(
            &log,
            "vision-1",
            "match-2",
            EventBody::Status {
                status: PipelineStatus::at(Phase::Match, StageStatus::Pending),
                code: None,
                failure_code: None,
            },
        )
        .await;
        append(
            &log,
            "vision-1",
            "vision-1",
            EventBody::Done { text: Some("seen".into()), data: None, usage: None },
        )
        .await;
        append(&log, "match-2", "match-2", EventBody::Start).await;
        append(&log, "match-2", "match-2", EventBody::Token { text: "matched".into() }).await;
        append(
            &log,
            "match-2",
            "match-2",
            EventBody::Done { text: Some("matched".into()), data: None, usage: None },
        )
        .await;

        let consumer = StreamConsumer::new(Tier::Free, TaskId::new("vision-1"), ClientConfig::default());
        let consumer = ConsumerDriver::new(gateway, "jobs", "u1", consumer).run().await;

        assert!(consumer.is_closed());
        assert_eq!(consumer.status(), PipelineStatus::at(Phase::Match, StageStatus::Completed));
        assert_eq!(consumer.content(Phase::JobVision), "seen");
        assert_eq!(consumer.content(Phase::Match), "matched");
        assert_eq!(consumer.active_task(), &TaskId::new("match-2"));
    }
}
