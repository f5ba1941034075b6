mod common;

use common::{fast_settings, init_tracing, probe_runtime, wait_until, Gauge};
use meshagent::{AgentError, AgentInfo, ControlPlane, HttpControlPlane, Job, JobReport, JobRunner};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "s3cret";

#[tokio::test]
async fn test_fetch_next_job() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/agents/a1/jobs/next"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "j1",
            "flow_id": "f1",
            "flow_yaml": "flow:\n  name: x\nsteps: []\n",
            "environment": {"region": "eu"}
        })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/agents/a1/jobs/next"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let plane = HttpControlPlane::new(format!("{}/", server.uri()), TOKEN).unwrap();

    let job = plane.fetch_next_job("a1").await.unwrap().unwrap();
    assert_eq!(job.id, "j1");
    assert_eq!(job.flow_id.as_deref(), Some("f1"));
    assert_eq!(job.environment["region"], "eu");
    assert!(plane.fetch_next_job("a1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_report_carries_idempotency_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/agents/a1/jobs/j9/result"))
        .and(header("Idempotency-Key", "j9"))
        .and(body_partial_json(json!({"job_id": "j9", "idempotency_key": "j9", "status": "failed"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let plane = HttpControlPlane::new(server.uri(), TOKEN).unwrap();
    let report = JobReport::rejected(&Job::new("j9", "steps: []"), "bad flow");

    plane.report_result("a1", &report).await.unwrap();
}

#[tokio::test]
async fn test_error_statuses_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/agents/a1/heartbeat"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/agents/register"))
        .respond_with(ResponseTemplate::new(403).set_body_string("unknown agent token"))
        .mount(&server)
        .await;

    let plane = HttpControlPlane::new(server.uri(), TOKEN).unwrap();
    let info = AgentInfo::detect("a1", vec![]);

    let err = plane.register(&info).await.unwrap_err();
    assert!(matches!(&err, AgentError::ControlPlane { status: 403, message } if message == "unknown agent token"));
    assert!(!err.is_transient());

    let payload = meshagent::HeartbeatPayload {
        agent_id: "a1".to_string(),
        timestamp: chrono::Utc::now(),
        status: "healthy".to_string(),
        running_jobs: 0,
        max_concurrent: 1,
        load: 0.0,
        uptime_seconds: 1,
    };
    let err = plane.heartbeat("a1", &payload).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_registration_lifecycle_paths() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/agents/register"))
        .and(body_partial_json(json!({"id": "a1", "tags": ["gpu"]})))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/agents/a1/heartbeat"))
        .and(body_partial_json(json!({"agent_id": "a1", "running_jobs": 0})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/agents/a1/deregister"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let plane = Arc::new(HttpControlPlane::new(server.uri(), TOKEN).unwrap());
    let runner = JobRunner::new("a1", probe_runtime(Arc::new(Gauge::default())), plane.clone(), fast_settings(1));
    let heartbeat = meshagent::HeartbeatManager::new(
        AgentInfo::detect("a1", vec!["gpu".to_string()]),
        plane,
        runner,
        Duration::from_secs(30),
    );

    heartbeat.register().await.unwrap();
    heartbeat.send_heartbeat().await.unwrap();
    heartbeat.deregister().await;
}

#[tokio::test]
async fn test_runner_against_http_control_plane() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/agents/a1/jobs/next"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "remote-1",
            "flow_yaml": "flow:\n  name: remote\nsteps:\n  - id: hold\n    action: probe\n    config:\n      hold_ms: 20\n"
        })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/agents/a1/jobs/next"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/agents/a1/jobs/remote-1/result"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/agents/a1/jobs/remote-1/result"))
        .and(body_partial_json(json!({"status": "completed", "passed": 1})))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let plane = Arc::new(HttpControlPlane::new(server.uri(), TOKEN).unwrap());
    let runner = JobRunner::new("a1", probe_runtime(Arc::new(Gauge::default())), plane, fast_settings(1));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let runner = runner.clone();
        let shutdown = shutdown.clone();
        async move { runner.run(shutdown).await }
    });

    let mut delivered = false;
    for _ in 0..200 {
        let requests = server.received_requests().await.unwrap_or_default();
        let results: Vec<_> = requests
            .iter()
            .filter(|r| r.url.path().ends_with("/result"))
            .collect();
        if results.len() == 2 {
            let keys: Vec<_> = results
                .iter()
                .map(|r| r.headers.get("idempotency-key").map(|v| v.to_str().unwrap_or("").to_string()))
                .collect();
            assert_eq!(keys, vec![Some("remote-1".to_string()), Some("remote-1".to_string())]);
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.cancel();
    handle.await.unwrap();
    assert!(delivered, "result was not re-sent after the 502");
    assert!(wait_until(Duration::from_millis(10), || runner.running_count() == 0).await);
}
