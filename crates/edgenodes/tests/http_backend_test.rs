use edgecore::{Artifact, DeliveryError, StorageBackend};
use edgenodes::HttpBackend;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend(server: &MockServer, token: Option<&str>) -> HttpBackend {
    HttpBackend::new(
        format!("{}/", server.uri()),
        token.map(str::to_string),
        Duration::from_secs(2),
    )
    .unwrap()
}

#[tokio::test]
async fn file_artifacts_are_put_under_container_and_name() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/raw/climate.cam.0.jpg"))
        .and(header("authorization", "Bearer s3cret"))
        .and(header("x-edgeflow-sequence", "7"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let artifact = Artifact::File {
        bytes: vec![0xff, 0xd8],
    };
    backend(&server, Some("s3cret"))
        .put("raw", "climate.cam.0.jpg", &artifact, 7)
        .await
        .unwrap();
}

#[tokio::test]
async fn record_artifacts_are_sent_as_json_rows() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/journals/env.csv"))
        .and(body_json(json!([{"temp": 21.5}, {"temp": 22.0}])))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let artifact = Artifact::Records {
        rows: vec![json!({"temp": 21.5}), json!({"temp": 22.0})],
    };
    backend(&server, None)
        .put("journals", "env.csv", &artifact, 0)
        .await
        .unwrap();
}

#[tokio::test]
async fn server_errors_are_retryable_and_auth_errors_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/raw/busy"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/raw/denied"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let backend = backend(&server, None);
    let artifact = Artifact::File { bytes: vec![1] };

    let busy = backend.put("raw", "busy", &artifact, 0).await.unwrap_err();
    assert!(matches!(busy, DeliveryError::Retryable(_)));
    let denied = backend.put("raw", "denied", &artifact, 0).await.unwrap_err();
    assert!(matches!(denied, DeliveryError::Terminal(_)));
    assert!(backend.check_connection().await);
}

#[tokio::test]
async fn unreachable_storage_is_retryable() {
    let server = MockServer::start().await;
    let backend = backend(&server, None);
    drop(server);

    let err = backend
        .put("raw", "a", &Artifact::File { bytes: vec![1] }, 0)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(!backend.check_connection().await);
}
