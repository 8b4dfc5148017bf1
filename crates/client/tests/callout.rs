use std::time::{Duration, Instant};

use crisscross_client::{CalloutClient, CalloutError, HttpConnector};
use crisscross_core::Connector;
use crisscross_models::Verb;
use kube::core::DynamicObject;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn bucket() -> serde_json::Value {
    json!({
        "apiVersion": "storage.example.org/v1alpha1",
        "kind": "Bucket",
        "metadata": { "name": "logs" },
        "spec": { "region": "eu-west-1" }
    })
}

#[tokio::test]
async fn observe_passes_fields_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/observe"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({ "managed": bucket() })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "externalObservation": {
                "resourceExists": true,
                "resourceLateInitialized": true,
                "connectionDetails": { "user": "YWxpY2U=" }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = CalloutClient::new(server.uri());
    let obs = client.observe(&bucket()).await.unwrap();
    assert!(obs.resource_exists);
    assert!(!obs.resource_up_to_date);
    assert!(obs.resource_late_initialized);
    assert_eq!(obs.connection_details.get("user"), Some(&b"alice"[..]));
}

#[tokio::test]
async fn create_update_delete_hit_their_paths() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "externalCreation": { "connectionDetails": { "endpoint": "aHR0cHM6Ly9sb2dz" } }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/update"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "externalUpdate": {} })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/delete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    // Trailing slash on the endpoint must not double up.
    let client = CalloutClient::new(format!("{}/", server.uri()));
    let created = client.create(&bucket()).await.unwrap();
    assert_eq!(created.connection_details.get("endpoint"), Some(&b"https://logs"[..]));
    let updated = client.update(&bucket()).await.unwrap();
    assert!(updated.connection_details.is_empty());
    client.delete(&bucket()).await.unwrap();
}

#[tokio::test]
async fn err_message_does_not_fail_the_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/delete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "errMessage": "bucket not empty" })))
        .mount(&server)
        .await;

    let client = CalloutClient::new(server.uri());
    assert!(client.delete(&bucket()).await.is_ok());
}

#[tokio::test]
async fn non_success_status_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/observe"))
        .respond_with(ResponseTemplate::new(503).set_body_string("backend down"))
        .mount(&server)
        .await;

    let err = CalloutClient::new(server.uri()).observe(&bucket()).await.unwrap_err();
    match err {
        CalloutError::Status { verb, status, body, .. } => {
            assert_eq!(verb, Verb::Observe);
            assert_eq!(status.as_u16(), 503);
            assert_eq!(body, "backend down");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/observe"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"externalObservation":{"resourceExists":"yes"}}"#))
        .mount(&server)
        .await;

    let err = CalloutClient::new(server.uri()).observe(&bucket()).await.unwrap_err();
    assert!(matches!(err, CalloutError::Decode { verb: Verb::Observe, .. }), "{err:?}");
}

#[tokio::test]
async fn transport_failure_propagates() {
    // Nothing listens on the discard port.
    let err = CalloutClient::new("http://127.0.0.1:9").update(&bucket()).await.unwrap_err();
    assert!(matches!(err, CalloutError::Transport { verb: Verb::Update, .. }), "{err:?}");
}

#[tokio::test]
async fn expired_deadline_never_sends() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let client = CalloutClient::new(server.uri()).with_deadline(Instant::now());
    let err = client.create(&bucket()).await.unwrap_err();
    assert!(matches!(err, CalloutError::DeadlineExceeded { verb: Verb::Create }), "{err:?}");
}

#[tokio::test]
async fn deadline_bounds_slow_responses() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/observe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let client = CalloutClient::new(server.uri()).with_deadline(Instant::now() + Duration::from_millis(200));
    let t0 = Instant::now();
    let err = client.observe(&bucket()).await.unwrap_err();
    assert!(t0.elapsed() < Duration::from_secs(4));
    match err {
        CalloutError::Transport { source, .. } => assert!(source.is_timeout(), "{source:?}"),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn connector_hands_out_bound_clients() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/observe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "externalObservation": { "resourceUpToDate": true } })))
        .expect(1)
        .mount(&server)
        .await;

    let obj: DynamicObject = serde_json::from_value(bucket()).unwrap();
    let connector = HttpConnector::new(server.uri());
    let external = connector.connect(&obj, Instant::now() + Duration::from_secs(30)).await.unwrap();
    let obs = external.observe(&obj).await.unwrap();
    assert!(obs.resource_up_to_date);
    assert!(!obs.resource_exists);
}
