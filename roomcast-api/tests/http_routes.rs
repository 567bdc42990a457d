use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use roomcast_api::create_router;
use roomcast_sfu::{LoopbackEngine, SfuConfig, SfuManager};
use serde_json::Value;
use tower::ServiceExt;

async fn router() -> (axum::Router, std::sync::Arc<SfuManager>) {
    let sfu = SfuManager::with_engine(SfuConfig::default(), &LoopbackEngine::new())
        .await
        .unwrap();
    (create_router(sfu.clone(), 64 * 1024), sfu)
}

async fn get(router: axum::Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_health() {
    let (router, _) = router().await;
    let (status, body) = get(router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test]
async fn test_stats_counts_registry_entities() {
    let (router, sfu) = router().await;
    let (_session, _rx) = sfu.join().unwrap();

    let (status, body) = get(router, "/api/stats").await;
    assert_eq!(status, StatusCode::OK);
    let stats: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stats["peers"], 1);
    assert_eq!(stats["transports"], 0);
    assert_eq!(stats["producers"], 0);
    assert_eq!(stats["consumers"], 0);
}

#[tokio::test]
async fn test_peer_lookup() {
    let (router, sfu) = router().await;
    let (session, _rx) = sfu.join().unwrap();

    let (status, body) = get(router.clone(), &format!("/api/peers/{}", session.peer_id())).await;
    assert_eq!(status, StatusCode::OK);
    let peer: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(peer["id"], session.peer_id().as_str());
    assert!(peer["producers"].as_array().unwrap().is_empty());

    let (status, body) = get(router, "/api/peers/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["status"], 404);
    assert_eq!(error["error"], "peer not found: unknown");
}
