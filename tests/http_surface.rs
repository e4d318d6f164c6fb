use axum::{body::Body, http::Request};
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::util::ServiceExt;
use wsx::{Connection, Hub, Server};

fn idle_handler(conn: Arc<Connection>) -> impl std::future::Future<Output = ()> + Send {
    async move {
        while conn.read().await.is_ok() {}
    }
}

#[tokio::test]
async fn healthz_answers_ok() {
    let server = Server::builder("127.0.0.1:0").build();
    let app = server.router(idle_handler);

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"OK");
}

#[tokio::test]
async fn metrics_exposes_the_contract_names() {
    let hub = Hub::builder().build().await.unwrap();
    hub.broadcast("warm up the counters").await;

    let server = Server::builder("127.0.0.1:0").build();
    let app = server.router(idle_handler);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("ws_connections_active"), "{text}");
    assert!(text.contains("ws_hub_broadcast_total"), "{text}");
}

#[tokio::test]
async fn non_upgrade_request_to_ws_is_rejected() {
    let server = Server::builder("127.0.0.1:0").build();
    let app = server.router(idle_handler);

    let response = app
        .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn shutdown_before_start_returns_immediately() {
    let server = Server::builder("127.0.0.1:0").build();
    server
        .shutdown(std::time::Duration::from_secs(5))
        .await
        .expect("nothing to wait for");
}
