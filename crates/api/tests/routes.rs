use std::sync::Arc;

use api::{router, AppState};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use db::models::WorkflowRow;
use db::MemoryStore;
use engine::{ExecutionJob, TriggeredBy};
use http_body_util::BodyExt;
use queue::{EventBus, JobQueue, MemoryBus, MemoryQueue, Priority};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    jobs: Arc<MemoryQueue<ExecutionJob>>,
    bus: Arc<MemoryBus>,
}

fn app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let jobs = Arc::new(MemoryQueue::new());
    let bus = Arc::new(MemoryBus::new());
    let router = router(AppState {
        workflows: store.clone(),
        queue: jobs.clone(),
        bus: bus.clone(),
    });
    TestApp {
        router,
        store,
        jobs,
        bus,
    }
}

fn hooked_workflow() -> WorkflowRow {
    WorkflowRow {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        name: "intake".into(),
        active: true,
        nodes: json!([
            { "id": "hook", "type": "webhookTrigger", "data": {} },
            { "id": "ping", "type": "action",
              "data": { "actionType": "WebHookNodeType", "parameters": { "url": "http://localhost/" } } }
        ]),
        edges: json!([{ "source": "hook", "target": "ping" }]),
        updated_at: Utc::now(),
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("user-agent", "curl/8.0")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_is_ok() {
    let app = app();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn webhook_post_queues_a_high_priority_job() {
    let app = app();
    let row = hooked_workflow();
    app.store.insert_workflow(row.clone());

    let uri = format!("/webhook/{}/hook?ref=abc", row.id);
    let mut request = post_json(&uri, json!({ "foo": 1 }));
    request
        .headers_mut()
        .insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["workflowId"], json!(row.id));

    let job = app.jobs.dequeue().await.unwrap().unwrap();
    assert_eq!(body["executionId"], json!(job.payload.execution_id));
    assert_eq!(job.priority, Priority::High);
    assert_eq!(job.payload.triggered_by, TriggeredBy::Webhook);
    assert_eq!(job.payload.user_id, row.user_id);

    let trigger = job.payload.trigger_data.unwrap();
    assert_eq!(trigger.node_id.as_deref(), Some("hook"));
    assert_eq!(trigger.webhook_payload, Some(json!({ "foo": 1 })));
    assert_eq!(trigger.query_params, Some(json!({ "ref": "abc" })));
    assert_eq!(trigger.method.as_deref(), Some("POST"));
    assert_eq!(trigger.ip.as_deref(), Some("203.0.113.9"));
    let headers = trigger.headers.unwrap();
    assert_eq!(headers["user-agent"], "curl/8.0");
    assert_eq!(headers["content-type"], "application/json");
}

#[tokio::test]
async fn webhook_get_carries_an_empty_payload() {
    let app = app();
    let row = hooked_workflow();
    app.store.insert_workflow(row.clone());

    let request = Request::builder()
        .uri(format!("/webhook/{}/hook", row.id))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);

    let trigger = app.jobs.dequeue().await.unwrap().unwrap().payload.trigger_data.unwrap();
    assert_eq!(trigger.webhook_payload, Some(json!({})));
    assert_eq!(trigger.method.as_deref(), Some("GET"));
    assert_eq!(trigger.ip, None);
}

#[tokio::test]
async fn webhook_requires_a_known_workflow_and_trigger_node() {
    let app = app();
    let row = hooked_workflow();
    app.store.insert_workflow(row.clone());

    let unknown_workflow = format!("/webhook/{}/hook", Uuid::new_v4());
    let (status, body) = send(&app.router, post_json(&unknown_workflow, json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    // An action node is not a webhook entry point.
    let not_a_trigger = format!("/webhook/{}/ping", row.id);
    let (status, _) = send(&app.router, post_json(&not_a_trigger, json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert!(app.jobs.is_empty());
}

#[tokio::test]
async fn execute_defaults_to_api_and_honours_manual() {
    let app = app();
    let row = hooked_workflow();
    app.store.insert_workflow(row.clone());
    let uri = format!("/workflows/{}/execute", row.id);

    let request = Request::builder()
        .method("POST")
        .uri(&uri)
        .header("user-agent", "dashboard")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");

    let job = app.jobs.dequeue().await.unwrap().unwrap();
    assert_eq!(body["executionId"], json!(job.payload.execution_id));
    assert_eq!(job.payload.triggered_by, TriggeredBy::Api);
    assert_eq!(job.priority, Priority::Normal);
    let metadata = job.payload.metadata.unwrap();
    assert_eq!(metadata.source.as_deref(), Some("api"));
    assert_eq!(metadata.user_agent.as_deref(), Some("dashboard"));

    let (status, _) = send(
        &app.router,
        post_json(&uri, json!({ "triggeredBy": "manual", "priority": "high" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job = app.jobs.dequeue().await.unwrap().unwrap();
    assert_eq!(job.payload.triggered_by, TriggeredBy::Manual);
    assert_eq!(job.priority, Priority::High);
}

#[tokio::test]
async fn execute_rejects_bad_bodies_and_unknown_workflows() {
    let app = app();
    let row = hooked_workflow();
    app.store.insert_workflow(row.clone());

    let (status, _) = send(
        &app.router,
        post_json(&format!("/workflows/{}/execute", row.id), json!({ "priority": "urgent" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app.router,
        post_json(&format!("/workflows/{}/execute", Uuid::new_v4()), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(app.jobs.is_empty());
}

#[tokio::test]
async fn schedule_refresh_publishes_the_workflow_id() {
    let app = app();
    let mut signals = app
        .bus
        .subscribe(triggers::SCHEDULE_REFRESH_CHANNEL)
        .await
        .unwrap();
    let workflow_id = Uuid::new_v4();

    let request = Request::builder()
        .method("POST")
        .uri(format!("/workflows/{workflow_id}/schedule/refresh"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let signal = signals.recv().await.unwrap();
    assert_eq!(signal, json!({ "workflowId": workflow_id }));
}
