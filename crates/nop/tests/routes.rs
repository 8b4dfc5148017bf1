use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

fn callout(path: &str) -> Request<Body> {
    let body = json!({ "managed": { "apiVersion": "storage.example.org/v1alpha1", "kind": "Bucket", "metadata": { "name": "b1" } } });
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(req: Request<Body>) -> (StatusCode, Value) {
    let resp = nop_paaf::router().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn observe_reports_existing_resource() {
    let (status, body) = send(callout("/observe")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["externalObservation"]["resourceExists"], json!(true));
    assert!(body.get("errMessage").is_none());
}

#[tokio::test]
async fn mutating_verbs_answer_empty_success() {
    for (path, field) in [("/create", "externalCreation"), ("/update", "externalUpdate")] {
        let (status, body) = send(callout(path)).await;
        assert_eq!(status, StatusCode::OK, "{path}");
        assert_eq!(body[field], json!({}), "{path}: {body}");
    }
    let (status, body) = send(callout("/delete")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));
}

#[tokio::test]
async fn any_body_is_accepted() {
    let req = Request::builder().method(Method::POST).uri("/observe").body(Body::from("not json")).unwrap();
    let (status, _) = send(req).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_routes_and_methods_are_rejected() {
    let resp = nop_paaf::router().oneshot(callout("/finalize")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let req = Request::builder().method(Method::GET).uri("/observe").body(Body::empty()).unwrap();
    let resp = nop_paaf::router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn observe_after_create_still_reports_existing() {
    let (status, body) = send(callout("/create")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "externalCreation": {} }));

    for _ in 0..2 {
        let (_, body) = send(callout("/observe")).await;
        assert_eq!(body["externalObservation"]["resourceExists"], json!(true));
    }
}
