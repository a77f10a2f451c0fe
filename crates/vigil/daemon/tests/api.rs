//! REST API behaviour against an in-process bus and engine.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tokio::sync::{oneshot, watch};
use tower::ServiceExt;
use vigil_control::{
    BusMessage, EngineSnapshot, HealthManager, InMemoryBus, InMemoryDesiredStateProvider,
    ManagerConfig, MessageBus,
};
use vigil_daemon::api::create_router;
use vigil_daemon::api::rest::state::AppState;
use vigil_types::{AppState as DropletState, DesiredState, DropletId, PackageState, Timestamp};

fn router(bus: Arc<InMemoryBus>, snapshots: watch::Receiver<EngineSnapshot>) -> Router {
    create_router(
        AppState::new(bus, snapshots, Duration::from_millis(500)),
        true,
    )
}

async fn json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_reports_degraded_without_desired_state() {
    let (_tx, rx) = watch::channel(EngineSnapshot::default());
    let response = router(Arc::new(InMemoryBus::new()), rx)
        .oneshot(get("/api/v1/health"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["status"], "degraded");
}

#[tokio::test]
async fn test_status_returns_latest_snapshot() {
    let (tx, rx) = watch::channel(EngineSnapshot::default());
    tx.send_replace(EngineSnapshot {
        droplets: 7,
        desired_state_available: true,
        ..EngineSnapshot::default()
    });

    let response = router(Arc::new(InMemoryBus::new()), rx)
        .oneshot(get("/api/v1/status"))
        .await
        .unwrap();

    let body = json(response).await;
    assert_eq!(body["engine"]["droplets"], 7);
    assert_eq!(body["engine"]["shadow_mode"], "live");
}

#[tokio::test]
async fn test_publish_reaches_subscribers() {
    let bus = Arc::new(InMemoryBus::new());
    let mut rx = bus.subscribe("droplet.updated").unwrap();
    let (_tx, snapshots) = watch::channel(EngineSnapshot::default());

    let response = router(bus, snapshots)
        .oneshot(post("/api/v1/bus/droplet.updated", r#"{"droplet": "app"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let message = rx.try_recv().unwrap();
    let body: serde_json::Value = message.decode().unwrap();
    assert_eq!(body["droplet"], "app");
}

#[tokio::test]
async fn test_request_without_responders() {
    let (_tx, snapshots) = watch::channel(EngineSnapshot::default());
    let response = router(Arc::new(InMemoryBus::new()), snapshots)
        .oneshot(post("/api/v1/bus/nobody.home?request=true", "{}"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json(response).await["code"], "NO_RESPONDERS");
}

#[tokio::test]
async fn test_reply_inbox_cannot_be_targeted() {
    let (_tx, snapshots) = watch::channel(EngineSnapshot::default());
    let response = router(Arc::new(InMemoryBus::new()), snapshots)
        .oneshot(post("/api/v1/bus/_INBOX.abc", "{}"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_request_answered_by_engine() {
    let bus = Arc::new(InMemoryBus::new());
    let provider = Arc::new(InMemoryDesiredStateProvider::new());
    provider
        .set(
            DropletId::new("app"),
            DesiredState {
                num_instances: 1,
                state: DropletState::Started,
                live_version: "v1".to_string(),
                package_state: PackageState::Staged,
                last_updated: Timestamp::from_secs(1.0),
            },
        )
        .await;

    let mut manager = HealthManager::virtual_time(
        ManagerConfig::default(),
        bus.clone(),
        provider,
        Timestamp::from_secs(1_000.0),
    );
    manager.attach_bus().unwrap();
    let mut snapshots = manager.snapshots();
    let app = router(bus.clone(), manager.snapshots());

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let engine = tokio::spawn(manager.run(async {
        let _ = stop_rx.await;
    }));
    snapshots
        .wait_for(|s| s.desired_state_available)
        .await
        .unwrap();

    bus.publish(
        BusMessage::json(
            "dea.heartbeat",
            &serde_json::json!({
                "dea": "dea-1",
                "droplets": [{
                    "droplet": "app",
                    "version": "v1",
                    "index": 0,
                    "instance": "g0",
                    "state": "RUNNING",
                    "state_timestamp": 1000.0
                }]
            }),
        )
        .unwrap(),
    )
    .unwrap();

    // The heartbeat may still be in flight; ask until it is counted.
    let mut healthy = 0;
    for _ in 0..50 {
        let response = app
            .clone()
            .oneshot(post(
                "/api/v1/bus/healthmanager.health?request=true",
                r#"{"droplets": [{"droplet": "app", "version": "v1"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        healthy = json(response).await[0]["healthy"].as_u64().unwrap();
        if healthy == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(healthy, 1);

    stop_tx.send(()).unwrap();
    engine.await.unwrap().unwrap();
}
