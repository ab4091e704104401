use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};

use conduit_api::app::{build_app, BackgroundTasks, Orchestrator};
use conduit_infra::config::OrchestratorConfig;
use conduit_infra::queue::JobQueue;

struct TestServer {
    base_url: String,
    queue: Arc<dyn JobQueue>,
    tasks: Option<BackgroundTasks>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let mut config = OrchestratorConfig::default();
        config.outbox.poll_min = Duration::from_millis(5);
        config.outbox.poll_max = Duration::from_millis(20);
        config.outbox.shutdown_grace = Duration::from_millis(200);

        // Same wiring as prod, in-memory backends, ephemeral port.
        let orchestrator = Orchestrator::in_memory(&config);
        let queue = orchestrator.queue.clone();
        let (services, tasks) = orchestrator.start();
        let app = build_app(services);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            queue,
            tasks: Some(tasks),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn stop(mut self) {
        if let Some(tasks) = self.tasks.take() {
            tasks.shutdown().await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn initialize(
    client: &reqwest::Client,
    srv: &TestServer,
    entity: &str,
    body: Value,
) -> (StatusCode, Value) {
    let res = client
        .post(srv.url(&format!("/entities/{entity}/initialize")))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn outbox_processed_eventually(client: &reqwest::Client, srv: &TestServer, entity: &str) -> Vec<Value> {
    // The outbox is drained in the background; poll until every row is processed.
    for _ in 0..200 {
        let rows: Vec<Value> = client
            .get(srv.url(&format!("/entities/{entity}/outbox")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        if !rows.is_empty() && rows.iter().all(|r| !r["processed_at"].is_null()) {
            return rows;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("outbox rows were not processed within timeout");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_turns_ok_once_the_processor_polls() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let mut last = StatusCode::SERVICE_UNAVAILABLE;
    for _ in 0..200 {
        let res = client.get(srv.url("/health")).send().await.unwrap();
        last = res.status();
        if last == StatusCode::OK {
            let body: Value = res.json().await.unwrap();
            assert_eq!(body["status"], "ok");
            assert_eq!(body["outbox"]["running"], true);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last, StatusCode::OK);

    srv.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initialized_jobs_reach_the_queue_with_outbox_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = initialize(
        &client,
        &srv,
        "course-42",
        json!({
            "initial_state": "stage_2_init",
            "idempotency_key": "course-42:start",
            "jobs": [{ "queue_name": "document-processing", "payload": { "file": "syllabus.pdf" } }],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let outbox_id = body["outbox_entries"][0]["outbox_id"]
        .as_str()
        .unwrap()
        .to_string();

    let rows = outbox_processed_eventually(&client, &srv, "course-42").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["outbox_id"], outbox_id.as_str());

    let job = srv
        .queue
        .dequeue("document-processing")
        .await
        .unwrap()
        .expect("job was created");
    assert_eq!(job.job_id, outbox_id);
    assert_eq!(job.payload["entity_id"], "course-42");
    assert_eq!(job.payload["file"], "syllabus.pdf");

    srv.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_pipeline_walk_is_audited() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let mut states = Vec::new();
    for stage in 2..=5 {
        for phase in ["init", "processing", "complete"] {
            states.push(format!("stage_{stage}_{phase}"));
        }
    }
    states.push("finalizing".to_string());
    states.push("completed".to_string());

    for (i, state) in states.iter().enumerate() {
        let (status, body) = initialize(
            &client,
            &srv,
            "course-7",
            json!({ "initial_state": state, "idempotency_key": format!("course-7:{i}") }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "advancing to {state}: {body}");
        assert_eq!(body["state"], state.as_str());
    }

    let record: Value = client
        .get(srv.url("/entities/course-7"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["state"], "completed");

    let events: Vec<Value> = client
        .get(srv.url("/entities/course-7/transitions?limit=100"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(events.len(), states.len());
    assert!(events[0]["old_state"].is_null());
    assert_eq!(events.last().unwrap()["new_state"], "completed");
    assert!(events.iter().all(|e| e["initiated_by"] == "API"));

    // Skipping back into the pipeline without a restart is rejected.
    let (status, _) = initialize(
        &client,
        &srv,
        "course-7",
        json!({ "initial_state": "stage_3_init", "idempotency_key": "course-7:skip" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Restart goes back through pending.
    let (status, body) = initialize(
        &client,
        &srv,
        "course-7",
        json!({ "initial_state": "stage_2_init", "idempotency_key": "course-7:restart" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["state"], "stage_2_init");

    srv.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_list_starts_empty_and_requeue_rejects_live_rows() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(srv.url("/admin/outbox/abandoned?limit=10"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let rows: Vec<Value> = res.json().await.unwrap();
    assert!(rows.is_empty());

    initialize(
        &client,
        &srv,
        "course-9",
        json!({
            "initial_state": "stage_2_init",
            "idempotency_key": "course-9:start",
            "jobs": [{ "queue_name": "document-processing", "payload": {} }],
        }),
    )
    .await;
    let rows = outbox_processed_eventually(&client, &srv, "course-9").await;
    let outbox_id = rows[0]["outbox_id"].as_str().unwrap();

    let res = client
        .post(srv.url(&format!("/admin/outbox/{outbox_id}/requeue")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    srv.stop().await;
}
