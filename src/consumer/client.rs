use std::sync::Arc;

use reqwest::{Method, Url};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, field, info, instrument, warn};

use super::trace::{TraceContext, TracePropagator, W3cPropagator};
use crate::config::ClientConfig;
use crate::error::{ConfigError, ConsumerError, Error, HttpErrorKind, Operation};
use crate::events::{EventBus, TaskEvent};
use crate::metrics::{DequeueOutcome, FacadeMetrics, MetricsRecorder};
use crate::state_machine::{StageType, StateMachine, Task, TaskId, TaskStatus};
use crate::transport::classify::invalid_body;
use crate::transport::{Dispatcher, HttpRequest, HttpResponse, ReqwestTransport, Transport};

/// A task to transition: either a local copy or an id to fetch first.
#[derive(Debug, Clone, Copy)]
pub enum TaskRef<'a> {
    Task(&'a Task),
    Id(&'a TaskId),
}

impl<'a> From<&'a Task> for TaskRef<'a> {
    fn from(task: &'a Task) -> Self {
        TaskRef::Task(task)
    }
}

impl<'a> From<&'a TaskId> for TaskRef<'a> {
    fn from(id: &'a TaskId) -> Self {
        TaskRef::Id(id)
    }
}

impl TaskRef<'_> {
    fn id(&self) -> &TaskId {
        match self {
            TaskRef::Task(task) => &task.id,
            TaskRef::Id(id) => id,
        }
    }
}

/// Body of `PUT /tasks/{id}/status`.
fn status_body(status: TaskStatus) -> Value {
    Value::Object(Map::from_iter([(
        "status".to_string(),
        Value::from(status.as_str()),
    )]))
}

/// Worker-side client: dequeues tasks and reports their outcome.
///
/// Each call owns its request lifecycle, so one consumer can be shared by many
/// concurrent tasks (wrap it in an `Arc`).
pub struct TaskConsumer<T = ReqwestTransport> {
    base_url: Url,
    dispatcher: Dispatcher<T>,
    propagator: Arc<dyn TracePropagator>,
    metrics: Arc<dyn MetricsRecorder>,
    events: EventBus,
    cancel: CancellationToken,
}

impl TaskConsumer<ReqwestTransport> {
    /// Builds a consumer with the reqwest transport described by `config`.
    pub fn from_config(config: &ClientConfig) -> Result<Self, Error> {
        let base_url = config.base_url()?;
        let transport = ReqwestTransport::new(&config.connection)?;
        let mut dispatcher = Dispatcher::new(transport, config.retry.clone());
        if config.metrics {
            dispatcher = dispatcher.with_metrics(Arc::new(FacadeMetrics));
        }
        Ok(Self::new(base_url, dispatcher).with_events(EventBus::new(config.events_capacity)))
    }
}

impl<T: Transport> TaskConsumer<T> {
    pub fn new(base_url: Url, dispatcher: Dispatcher<T>) -> Self {
        let metrics = dispatcher.metrics();
        Self {
            base_url,
            dispatcher,
            propagator: Arc::new(W3cPropagator),
            metrics,
            events: EventBus::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_propagator(mut self, propagator: Arc<dyn TracePropagator>) -> Self {
        self.propagator = propagator;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Ties this consumer's requests to an outer cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher<T> {
        &self.dispatcher
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels pending and future requests made through this consumer.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ConfigError::InvalidUrl {
                value: self.base_url.to_string(),
                reason: "URL cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, Error> {
        self.dispatcher.send_with_cancel(request, &self.cancel).await
    }

    fn decode_task(request: &HttpRequest, response: &HttpResponse) -> Result<Task, Error> {
        response.json::<Task>().map_err(|e| {
            Error::Http(invalid_body(
                &request.method,
                request.url.as_str(),
                response.status,
                &e,
            ))
        })
    }

    /// Takes the next task of `stage_type`, or `None` when the queue is empty.
    ///
    /// The service answers 404 for an empty queue; that is the only failure
    /// turned into a regular result.
    #[instrument(skip_all, fields(stage_type = %stage_type, task_id = field::Empty, task_attempts = field::Empty))]
    pub async fn dequeue(&self, stage_type: &StageType) -> Result<Option<Task>, Error> {
        let result = async {
            let url = self.endpoint(&["stages", stage_type.as_str(), "tasks", "dequeue"])?;
            let request = HttpRequest::new(Method::PATCH, url);
            let response = self.send(&request).await?;
            Self::decode_task(&request, &response)
        }
        .await;

        match result {
            Ok(task) => {
                let span = Span::current();
                span.record("task_id", task.id.as_str());
                span.record("task_attempts", task.attempts);
                info!(attempts = task.attempts, "dequeued task");

                self.metrics.record_dequeue(stage_type, DequeueOutcome::Task);
                self.events.publish(TaskEvent::Dequeued {
                    task_id: task.id.clone(),
                    stage_type: stage_type.clone(),
                    attempts: task.attempts,
                });
                Ok(Some(task))
            }
            Err(Error::Http(e)) if e.kind == HttpErrorKind::NotFound => {
                debug!("queue is empty");
                self.metrics.record_dequeue(stage_type, DequeueOutcome::Empty);
                self.events.publish(TaskEvent::QueueEmpty {
                    stage_type: stage_type.clone(),
                });
                Ok(None)
            }
            Err(err) => {
                warn!(kind = %err.kind(), error = %err, "dequeue failed");
                self.metrics.record_dequeue(stage_type, DequeueOutcome::Error);
                Err(ConsumerError::request_failed(Operation::Dequeue, err).into())
            }
        }
    }

    /// Fetches the current service-side copy of a task.
    #[instrument(skip_all, fields(task_id = %id))]
    pub async fn fetch_task(&self, id: &TaskId) -> Result<Task, Error> {
        let result = async {
            let url = self.endpoint(&["tasks", id.as_str()])?;
            let request = HttpRequest::get(url);
            let response = self.send(&request).await?;
            Self::decode_task(&request, &response)
        }
        .await;

        result.map_err(|err| ConsumerError::request_failed(Operation::FetchTask, err).into())
    }

    /// Marks an IN_PROGRESS task as COMPLETED.
    pub async fn mark_completed<'a>(&self, task: impl Into<TaskRef<'a>>) -> Result<Task, Error> {
        self.transition(task.into(), TaskStatus::Completed).await
    }

    /// Marks an IN_PROGRESS task as FAILED.
    pub async fn mark_failed<'a>(&self, task: impl Into<TaskRef<'a>>) -> Result<Task, Error> {
        self.transition(task.into(), TaskStatus::Failed).await
    }

    #[instrument(
        skip_all,
        fields(
            task_id = %task.id(),
            target_status = %target,
            link_trace_id = field::Empty,
            link_span_id = field::Empty,
        )
    )]
    async fn transition(&self, task: TaskRef<'_>, target: TaskStatus) -> Result<Task, Error> {
        let fetched;
        let task = match task {
            TaskRef::Task(task) => task,
            TaskRef::Id(id) => {
                fetched = self.fetch_task(id).await?;
                &fetched
            }
        };

        let parent = self.parent_context(task);
        if !parent.is_empty() {
            let span = Span::current();
            span.record("link_trace_id", parent.trace_id.as_str());
            span.record("link_span_id", parent.span_id.as_str());
        }

        if let Err(err) = StateMachine::validate(task, target) {
            warn!(found = %task.status, "rejecting status transition");
            self.events.publish(TaskEvent::TransitionRejected {
                task_id: task.id.clone(),
                found: task.status,
                target,
            });
            return Err(err.into());
        }

        let result = async {
            let url = self.endpoint(&["tasks", task.id.as_str(), "status"])?;
            let request =
                HttpRequest::new(Method::PUT, url).with_json(status_body(target));
            self.send(&request).await
        }
        .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(kind = %err.kind(), error = %err, "status update failed");
                return Err(ConsumerError::request_failed(Operation::UpdateStatus, err).into());
            }
        };

        // The service may answer with the updated record or with no body.
        let updated = response.json::<Task>().unwrap_or_else(|_| Task {
            status: target,
            ..task.clone()
        });

        info!("task status updated");
        self.metrics.record_transition(target);
        self.events.publish(TaskEvent::StatusUpdated {
            task_id: updated.id.clone(),
            status: target,
        });
        Ok(updated)
    }

    /// The producer's span context for `task`, or the empty default.
    fn parent_context(&self, task: &Task) -> TraceContext {
        match self.propagator.extract(&task.trace_context) {
            Ok(Some(context)) => context,
            Ok(None) => {
                debug!("task carries no trace context");
                TraceContext::default()
            }
            Err(reason) => {
                let err = ConsumerError::TraceContext {
                    task_id: task.id.clone(),
                    reason,
                };
                warn!(error = %err, "ignoring unusable trace context");
                TraceContext::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::metrics::tests::CountingMetrics;
    use crate::state_machine::TraceCarrier;
    use crate::transport::testing::ScriptedTransport;
    use crate::transport::{ConnectionOptions, RetryPolicy};
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_base_retry_delay_ms: 1,
            disable_jitter: true,
            ..RetryPolicy::default()
        }
    }

    fn consumer(server: &MockServer) -> TaskConsumer {
        let transport = ReqwestTransport::new(&ConnectionOptions::default()).unwrap();
        let base = Url::parse(&server.uri()).unwrap();
        TaskConsumer::new(base, Dispatcher::new(transport, policy()))
    }

    fn task_json(id: &str, status: &str) -> serde_json::Value {
        json!({
            "id": id,
            "stageType": "render",
            "status": status,
            "attempts": 1,
            "traceContext": {"traceparent": PARENT}
        })
    }

    #[tokio::test]
    async fn dequeue_returns_task() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/stages/render/tasks/dequeue"))
            .respond_with(ResponseTemplate::new(200).set_body_json(task_json("t-1", "IN_PROGRESS")))
            .expect(1)
            .mount(&server)
            .await;
        let consumer = consumer(&server);
        let mut events = consumer.subscribe();

        let task = consumer
            .dequeue(&StageType::new("render"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(task.id, TaskId::new("t-1"));
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(
            events.recv().await.unwrap(),
            TaskEvent::Dequeued {
                task_id: TaskId::new("t-1"),
                stage_type: StageType::new("render"),
                attempts: 1,
            }
        );
    }

    #[tokio::test]
    async fn empty_queue_is_none_for_any_stage() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "empty"})))
            .mount(&server)
            .await;
        let consumer = consumer(&server);

        for stage in ["render", "encode-video", "with space", "ünïcode"] {
            let result = consumer.dequeue(&StageType::new(stage)).await.unwrap();
            assert!(result.is_none(), "stage {stage}");
        }
    }

    #[tokio::test]
    async fn dequeue_failure_wraps_classified_cause() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        let consumer = consumer(&server);

        let err = consumer
            .dequeue(&StageType::new("render"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConsumerRequestFailed);
        assert_eq!(err.cause_kind(), ErrorKind::HttpServiceUnavailable);
        assert!(err.to_string().starts_with("dequeue failed"));
    }

    #[tokio::test]
    async fn dequeue_with_garbage_body_is_invalid_body() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = consumer(&server)
            .dequeue(&StageType::new("render"))
            .await
            .unwrap_err();
        assert_eq!(err.cause_kind(), ErrorKind::HttpInvalidBody);
    }

    #[tokio::test]
    async fn completing_a_failed_task_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let consumer = consumer(&server);
        let mut events = consumer.subscribe();
        let task = Task::new("t-2", TaskStatus::Failed);

        let err = consumer.mark_completed(&task).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConsumerInvalidStateTransition);
        assert!(err.to_string().contains("t-2"));
        assert_eq!(
            events.recv().await.unwrap(),
            TaskEvent::TransitionRejected {
                task_id: TaskId::new("t-2"),
                found: TaskStatus::Failed,
                target: TaskStatus::Completed,
            }
        );
    }

    #[tokio::test]
    async fn completing_by_id_a_task_not_in_progress_only_fetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks/t-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(task_json("t-9", "PENDING")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = consumer(&server)
            .mark_completed(&TaskId::new("t-9"))
            .await
            .unwrap_err();

        match err {
            Error::Consumer(ConsumerError::InvalidStateTransition {
                task_id,
                found,
                expected,
            }) => {
                assert_eq!(task_id, TaskId::new("t-9"));
                assert_eq!(found, TaskStatus::Pending);
                assert_eq!(expected, TaskStatus::InProgress);
            }
            other => panic!("expected an invalid transition, got {other:?}"),
        }
    }

    #[test]
    fn status_body_uses_wire_names() {
        assert_eq!(status_body(TaskStatus::Failed), json!({"status": "FAILED"}));
        assert_eq!(status_body(TaskStatus::Completed), json!({"status": "COMPLETED"}));
    }

    #[test]
    fn from_config_enables_facade_metrics_on_request() {
        let mut config = ClientConfig {
            base_url: Some("http://queue.local/".into()),
            ..ClientConfig::default()
        };
        let quiet = TaskConsumer::from_config(&config).unwrap();
        assert!(!quiet.dispatcher().metrics().enabled());

        config.metrics = true;
        let measured = TaskConsumer::from_config(&config).unwrap();
        assert!(measured.dispatcher().metrics().enabled());
    }

    #[tokio::test]
    async fn mark_completed_by_id_fetches_then_updates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks/t-3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(task_json("t-3", "IN_PROGRESS")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/tasks/t-3/status"))
            .and(body_json(json!({"status": "COMPLETED"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(task_json("t-3", "COMPLETED")))
            .expect(1)
            .mount(&server)
            .await;

        let task = consumer(&server)
            .mark_completed(&TaskId::new("t-3"))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn mark_failed_accepts_empty_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/tasks/t-4/status"))
            .and(body_json(json!({"status": "FAILED"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let task = Task::new("t-4", TaskStatus::InProgress);

        let updated = consumer(&server).mark_failed(&task).await.unwrap();
        assert_eq!(updated.id, task.id);
        assert_eq!(updated.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn broken_trace_context_does_not_abort_transition() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;
        let consumer = consumer(&server);

        let mut malformed = Task::new("t-5", TaskStatus::InProgress);
        malformed.trace_context =
            TraceCarrier::from([("traceparent".to_string(), "not-a-trace".to_string())]);
        let missing = Task::new("t-6", TaskStatus::InProgress);

        assert!(consumer.mark_completed(&malformed).await.is_ok());
        assert!(consumer.mark_completed(&missing).await.is_ok());
    }

    #[tokio::test]
    async fn update_failure_is_wrapped() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"message": "bad status"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        let task = Task::new("t-7", TaskStatus::InProgress);

        let err = consumer(&server).mark_completed(&task).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConsumerRequestFailed);
        assert_eq!(err.cause_kind(), ErrorKind::HttpBadRequest);
        assert_eq!(err.status(), Some(400));
        assert_eq!(err.to_string(), "status update failed: bad status");
    }

    #[tokio::test]
    async fn fetch_of_unknown_task_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = consumer(&server)
            .mark_failed(&TaskId::new("missing"))
            .await
            .unwrap_err();
        assert_eq!(err.cause_kind(), ErrorKind::HttpNotFound);
        assert!(err.to_string().starts_with("fetch task failed"));
    }

    #[tokio::test]
    async fn shutdown_cancels_requests() {
        let transport = ScriptedTransport::new(vec![]);
        let consumer = TaskConsumer::new(
            Url::parse("http://host/api/").unwrap(),
            Dispatcher::new(transport, policy()),
        );
        consumer.shutdown();

        let err = consumer
            .dequeue(&StageType::new("render"))
            .await
            .unwrap_err();
        assert_eq!(err.cause_kind(), ErrorKind::NetworkRequestCancelled);
        assert_eq!(consumer.dispatcher().transport().calls(), 0);
    }

    #[tokio::test]
    async fn endpoints_keep_base_path() {
        let transport = ScriptedTransport::new(vec![Ok(HttpResponse::new(404, ""))]);
        let consumer = TaskConsumer::new(
            Url::parse("http://host/api/v1/").unwrap(),
            Dispatcher::new(transport, policy()),
        );
        let url = consumer.endpoint(&["stages", "a/b", "tasks", "dequeue"]).unwrap();
        assert_eq!(url.as_str(), "http://host/api/v1/stages/a%2Fb/tasks/dequeue");
    }

    #[tokio::test]
    async fn metrics_see_dequeue_and_transition() {
        let metrics = Arc::new(CountingMetrics::default());
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::new(404, "")),
            Ok(HttpResponse::new(200, "")),
        ]);
        let consumer = TaskConsumer::new(
            Url::parse("http://host/").unwrap(),
            Dispatcher::new(transport, policy()).with_metrics(metrics.clone()),
        );

        consumer.dequeue(&StageType::new("render")).await.unwrap();
        consumer
            .mark_completed(&Task::new("t-8", TaskStatus::InProgress))
            .await
            .unwrap();

        assert_eq!(*metrics.dequeues.lock().unwrap(), vec![DequeueOutcome::Empty]);
        assert_eq!(
            *metrics.transitions.lock().unwrap(),
            vec![TaskStatus::Completed]
        );
    }
}
