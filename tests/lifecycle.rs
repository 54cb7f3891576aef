use reqwest::Url;
use serde_json::json;
use taskq::transport::{ConnectionOptions, Dispatcher, HttpRequest, ReqwestTransport, RetryPolicy};
use taskq::{
    ClientConfig, Error, ErrorCode, ErrorKind, NetworkErrorKind, StageType, TaskConsumer,
    TaskEvent, TaskStatus,
};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_base_retry_delay_ms: 1,
        disable_jitter: true,
        ..RetryPolicy::default()
    }
}

#[tokio::test]
async fn worker_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/stages/encode/tasks/dequeue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "t-100",
            "jobId": "j-1",
            "stageType": "encode",
            "status": "IN_PROGRESS",
            "attempts": 3,
            "traceContext": {
                "traceparent": "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/tasks/t-100/status"))
        .and(body_json(json!({"status": "COMPLETED"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = ClientConfig {
        base_url: Some(format!("{}/api/", server.uri())),
        retry: fast_retry(1),
        ..ClientConfig::default()
    };
    let consumer = TaskConsumer::from_config(&config).unwrap();
    let mut events = consumer.subscribe();

    let task = consumer
        .dequeue(&StageType::new("encode"))
        .await
        .unwrap()
        .expect("a task");
    assert_eq!(task.attempts, 3);

    let done = consumer.mark_completed(&task).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    assert!(matches!(events.recv().await.unwrap(), TaskEvent::Dequeued { attempts: 3, .. }));
    assert!(matches!(
        events.recv().await.unwrap(),
        TaskEvent::StatusUpdated { status: TaskStatus::Completed, .. }
    ));

    // A second report on the stale local copy is refused without a request.
    let again = consumer.mark_failed(&done).await.unwrap_err();
    assert_eq!(again.kind(), ErrorKind::ConsumerInvalidStateTransition);
}

#[tokio::test]
async fn transient_failures_are_retried_then_succeed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tasks/t-1"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/t-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "t-1",
            "status": "PENDING"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = ClientConfig {
        base_url: Some(server.uri()),
        retry: fast_retry(3),
        ..ClientConfig::default()
    };
    let consumer = TaskConsumer::from_config(&config).unwrap();

    let task = consumer.fetch_task(&"t-1".into()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn refused_connection_is_classified() {
    let transport = ReqwestTransport::new(&ConnectionOptions::default()).unwrap();
    let dispatcher = Dispatcher::new(transport, fast_retry(1));
    let request = HttpRequest::get(Url::parse("http://127.0.0.1:1/jobs").unwrap());

    match dispatcher.send(&request).await {
        Err(Error::Network(e)) => {
            assert_eq!(e.kind, NetworkErrorKind::ConnectionRefused);
            assert_eq!(e.code, Some(ErrorCode::ConnectionRefused));
            assert_eq!(
                e.message,
                "Failed to connect to http://127.0.0.1:1/jobs: Connection refused"
            );
            assert!(std::error::Error::source(&e).is_some());
        }
        other => panic!("expected a network error, got {other:?}"),
    }
}

#[test]
fn missing_base_url_fails_construction() {
    let err = TaskConsumer::from_config(&ClientConfig::default())
        .err()
        .expect("construction should fail");
    assert_eq!(err.kind(), ErrorKind::ConfigurationMissingRequiredField);
}
