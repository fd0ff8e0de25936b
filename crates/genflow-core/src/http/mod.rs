//! HTTP surface.
//!
//! - `POST /worker/{kind}/{service}`: one queue delivery
//! - `GET /stream`: SSE relay of one task channel
//! - `POST /tasks`: admission
//! - `GET /healthz`: liveness plus queue counts

mod error;

pub use error::{ApiError, ApiErrorBody, retry_after_secs};

use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::admission::{AdmissionDecision, AdmissionRequest};
use crate::app::Pipeline;
use crate::domain::{AdmissionCode, ChannelKey, ExecutionKind, StreamId, TaskId};
use crate::gateway::{GatewayFrame, StreamRequest};
use crate::worker::WorkerResponse;

const LAST_EVENT_ID: &str = "last-event-id";

pub fn router(pipeline: Pipeline) -> Router {
    Router::new()
        .route("/worker/{kind}/{service}", post(deliver))
        .route("/stream", get(stream))
        .route("/tasks", post(admit))
        .route("/healthz", get(healthz))
        .with_state(pipeline)
}

async fn deliver(
    State(pipeline): State<Pipeline>,
    Path((kind, service_id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let kind: ExecutionKind = match kind.parse() {
        Ok(kind) => kind,
        Err(err) => return ApiError::bad_request(err.to_string()).into_response(),
    };
    worker_response(pipeline.worker.handle(kind, &service_id, &body).await)
}

fn worker_response(response: WorkerResponse) -> Response {
    let mut http = (response.status, Json(response.body)).into_response();
    if let Some(retry_after) = response.retry_after {
        error::insert_retry_after(&mut http, retry_after);
    }
    http
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamQuery {
    user_id: String,
    service_id: String,
    task_id: String,
    #[serde(default)]
    from_latest: Option<String>,
    #[serde(default)]
    last_event_id: Option<String>,
}

impl StreamQuery {
    fn from_latest(&self) -> bool {
        matches!(self.from_latest.as_deref(), Some("1" | "true"))
    }
}

async fn stream(
    State(pipeline): State<Pipeline>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let header_cursor = headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty());
    let cursor = match header_cursor.or(query.last_event_id.as_deref()) {
        Some(raw) => Some(
            raw.parse::<StreamId>()
                .map_err(|err| ApiError::bad_request(err.to_string()))?,
        ),
        None => None,
    };

    let channel = ChannelKey::for_task(&query.service_id, &query.user_id, &TaskId::new(query.task_id.clone()));
    let mut request = StreamRequest::new(channel).from_latest(query.from_latest());
    if let Some(cursor) = cursor {
        request = request.resume_after(cursor);
    }
    debug!(channel = %request.channel, ?cursor, "stream opened");

    let mut frames = pipeline.gateway.open(request).await;
    let events = async_stream::stream! {
        while let Some(frame) = frames.recv().await {
            match frame {
                GatewayFrame::Entry(entry) => {
                    let data = entry.to_wire_json().to_string();
                    yield Ok::<SseEvent, Infallible>(SseEvent::default().data(data).id(entry.id.to_string()));
                }
                GatewayFrame::KeepAlive => yield Ok(SseEvent::default().comment("keepalive")),
            }
        }
    };

    Ok(Sse::new(events).into_response())
}

async fn admit(State(pipeline): State<Pipeline>, Json(request): Json<AdmissionRequest>) -> Response {
    let decision = pipeline.admission.admit(request).await;
    match decision {
        AdmissionDecision::Accepted { message_id, task_id } => (
            StatusCode::ACCEPTED,
            Json(json!({"ok": true, "messageId": message_id.to_string(), "taskId": task_id})),
        )
            .into_response(),
        AdmissionDecision::Replay { task_id } => (
            StatusCode::OK,
            Json(json!({"ok": true, "replay": true, "taskId": task_id})),
        )
            .into_response(),
        rejection => {
            let code = rejection.code();
            let status = match code {
                AdmissionCode::RateLimited | AdmissionCode::DailyLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
                AdmissionCode::Backpressured => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let mut error = ApiError::new(status, code.as_str(), "task not admitted");
            if let Some(retry_after) = rejection.retry_after() {
                error = error.with_retry_after(retry_after);
            }
            error.into_response()
        }
    }
}

async fn healthz(State(pipeline): State<Pipeline>) -> Result<Response, ApiError> {
    let counts = pipeline.queue_counts().await.map_err(|err| {
        warn!(error = %err, "queue counts unavailable");
        ApiError::internal(err.to_string())
    })?;
    Ok(Json(json!({"ok": true, "queue": counts})).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::PipelineBuilder;
    use crate::config::PipelineConfig;
    use crate::domain::{Event, EventBody, TaskInvocation};
    use crate::impls::ScriptedProvider;
    use crate::ports::EventLog;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::Utc;
    use serde_json::Value;
    use tower::ServiceExt;

    fn pipeline(config: PipelineConfig) -> Pipeline {
        PipelineBuilder::new(config)
            .register_provider("vision-lite", ScriptedProvider::tokens(["he", "llo"]))
            .unwrap()
            .build()
            .unwrap()
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn task(template: &str) -> Value {
        json!({
            "serviceId": "jobs",
            "userId": "u1",
            "templateId": template,
            "variables": {"jobId": "j-1"},
        })
    }

    fn invocation() -> TaskInvocation {
        TaskInvocation {
            task_id: TaskId::new("vision-1"),
            service_id: "jobs".into(),
            user_id: "u1".into(),
            locale: "en".into(),
            template_id: "job_summary".into(),
            variables: json!({}),
            enqueued_at: Utc::now(),
            retry_count: 0,
            has_quota: false,
            debit_id: None,
        }
    }

    #[tokio::test]
    async fn admitted_task_returns_202_with_ids() {
        let app = router(pipeline(PipelineConfig::default()));

        let response = app.oneshot(post_json("/tasks", &task("customize"))).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert!(body["messageId"].as_str().unwrap().starts_with("msg-"));
        assert!(body["taskId"].as_str().unwrap().starts_with("customize"));
    }

    #[tokio::test]
    async fn identical_task_is_replayed() {
        let app = router(pipeline(PipelineConfig::default()));

        let first = app.clone().oneshot(post_json("/tasks", &task("summary"))).await.unwrap();
        let first = json_body(first).await;
        let second = app.oneshot(post_json("/tasks", &task("summary"))).await.unwrap();

        assert_eq!(second.status(), StatusCode::OK);
        let second = json_body(second).await;
        assert_eq!(second["replay"], true);
        assert_eq!(second["taskId"], first["taskId"]);
    }

    #[tokio::test]
    async fn rate_limited_task_carries_retry_after() {
        let mut config = PipelineConfig::default();
        config.admission.rate_limit = 1;
        let app = router(pipeline(config));

        app.clone().oneshot(post_json("/tasks", &task("customize"))).await.unwrap();
        let response = app.oneshot(post_json("/tasks", &task("customize"))).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get("retry-after").is_some());
        assert_eq!(json_body(response).await["code"], "rate_limited");
    }

    #[tokio::test]
    async fn worker_delivery_runs_the_stage() {
        let pipeline = pipeline(PipelineConfig::default());
        let app = router(pipeline.clone());
        let body = serde_json::to_value(invocation()).unwrap();

        let response = app.oneshot(post_json("/worker/stream/jobs", &body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["ok"], true);
        let channel = ChannelKey::for_task("jobs", "u1", &TaskId::new("vision-1"));
        let entries = pipeline.log.read_after(&channel, None, 100).await.unwrap();
        assert!(entries.last().unwrap().event.is_terminal());
    }

    #[tokio::test]
    async fn unknown_worker_kind_is_400() {
        let app = router(pipeline(PipelineConfig::default()));
        let body = serde_json::to_value(invocation()).unwrap();

        let response = app.oneshot(post_json("/worker/bulk/jobs", &body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_worker_body_is_400() {
        let app = router(pipeline(PipelineConfig::default()));

        let response = app
            .oneshot(post_json("/worker/stream/jobs", &json!({"taskId": 7})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_relays_entries_until_terminal() {
        let pipeline = pipeline(PipelineConfig::default());
        let channel = ChannelKey::for_task("jobs", "u1", &TaskId::new("vision-1"));
        for body in [
            EventBody::Start,
            EventBody::Token { text: "hi".into() },
            EventBody::Done { text: Some("hi".into()), data: None, usage: None },
        ] {
            pipeline
                .log
                .append(&channel, &Event::for_task(TaskId::new("vision-1"), body))
                .await
                .unwrap();
        }
        let app = router(pipeline);

        let request = Request::builder()
            .uri("/stream?userId=u1&serviceId=jobs&taskId=vision-1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(text.matches("data: ").count(), 3);
        assert_eq!(text.matches("id: ").count(), 3);
        assert!(text.contains("\"type\":\"done\""));
        assert!(text.contains("\"eventId\""));
    }

    #[tokio::test]
    async fn last_event_id_header_resumes_after_cursor() {
        let pipeline = pipeline(PipelineConfig::default());
        let channel = ChannelKey::for_task("jobs", "u1", &TaskId::new("vision-1"));
        let first = pipeline
            .log
            .append(&channel, &Event::for_task(TaskId::new("vision-1"), EventBody::Start))
            .await
            .unwrap();
        pipeline
            .log
            .append(
                &channel,
                &Event::for_task(
                    TaskId::new("vision-1"),
                    EventBody::Done { text: None, data: None, usage: None },
                ),
            )
            .await
            .unwrap();
        let app = router(pipeline);

        let request = Request::builder()
            .uri("/stream?userId=u1&serviceId=jobs&taskId=vision-1&lastEventId=0-0")
            .header(LAST_EVENT_ID, first.id.to_string())
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert_eq!(text.matches("data: ").count(), 1);
        assert!(!text.contains("\"type\":\"start\""));
    }

    #[tokio::test]
    async fn stream_requires_task_coordinates() {
        let app = router(pipeline(PipelineConfig::default()));
        let request = Request::builder()
            .uri("/stream?userId=u1")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn healthz_reports_queue_counts() {
        let app = router(pipeline(PipelineConfig::default()));
        let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["queue"]["queued"], 0);
    }
}
