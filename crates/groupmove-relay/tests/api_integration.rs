//! Integration tests for the HTTP API
//!
//! Most tests exercise the endpoints with tower::ServiceExt::oneshot() without
//! starting a real server. The last one runs two GroupMove nodes against a
//! relay bound to a local port.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use groupmove::{ChangeBatch, Color, Config, GroupMove, NewMoveItem, ParticipantId, Permission, PropertyId};
use groupmove_relay::{api, db::Database, AppState};
use http_body_util::BodyExt;
use tower::ServiceExt;

/// Create a test AppState with a temp directory
fn test_state(temp_dir: &std::path::Path) -> Arc<AppState> {
    let db = Arc::new(Database::open(&temp_dir.join("relay.db")).unwrap());
    Arc::new(AppState { db })
}

/// Helper to read a response body as JSON
async fn body_json(body: Body) -> serde_json::Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: &impl serde::Serialize) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = api::router(test_state(temp_dir.path()));

    let resp = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn test_append_and_read_batches() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let state = test_state(temp_dir.path());
    let property = PropertyId::new();
    let origin = ParticipantId::new();
    let batch = ChangeBatch::new(property, origin, &[]).unwrap();
    let uri = format!("/streams/{property}/batches");

    for expected in 1..=3 {
        let resp = api::router(state.clone()).oneshot(post_json(&uri, &batch)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp.into_body()).await["seq"], expected);
    }

    let resp = api::router(state.clone())
        .oneshot(get(&format!("{uri}?after=1&limit=1")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp.into_body()).await;
    let deliveries = json.as_array().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0]["seq"], 2);
    assert_eq!(deliveries[0]["stream"], property.to_string());

    // No query string reads from the start
    let resp = api::router(state).oneshot(get(&uri)).await.unwrap();
    assert_eq!(body_json(resp.into_body()).await.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_append_to_wrong_stream_rejected() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let state = test_state(temp_dir.path());
    let batch = ChangeBatch::new(PropertyId::new(), ParticipantId::new(), &[]).unwrap();
    let other = PropertyId::new();

    let resp = api::router(state.clone())
        .oneshot(post_json(&format!("/streams/{other}/batches"), &batch))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(state.db.batches_after(other, 0, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_ids_rejected() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let state = test_state(temp_dir.path());

    let resp = api::router(state.clone()).oneshot(get("/streams/not-a-uuid/batches")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = api::router(state).oneshot(get("/participants/nope/streams")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_participant_streams() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let state = test_state(temp_dir.path());
    let origin = ParticipantId::new();
    let property = PropertyId::new();
    state.db.append(&ChangeBatch::new(property, origin, &[]).unwrap()).unwrap();

    let resp = api::router(state.clone())
        .oneshot(get(&format!("/participants/{origin}/streams")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp.into_body()).await, serde_json::json!([property.to_string()]));

    let stranger = ParticipantId::new();
    let resp = api::router(state)
        .oneshot(get(&format!("/participants/{stranger}/streams")))
        .await
        .unwrap();
    assert_eq!(body_json(resp.into_body()).await, serde_json::json!([]));
}

#[tokio::test]
async fn test_share_publish_and_resolve() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let state = test_state(temp_dir.path());
    let invitation = serde_json::json!({ "property": PropertyId::new().to_string(), "records": [] });

    let resp = api::router(state.clone()).oneshot(post_json("/shares", &invitation)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let token = body_json(resp.into_body()).await["token"].as_str().unwrap().to_string();

    let resp = api::router(state.clone()).oneshot(get(&format!("/shares/{token}"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp.into_body()).await, invitation);

    let resp = api::router(state.clone()).oneshot(get("/shares/unknown")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = api::router(state).oneshot(post_json("/shares", &serde_json::json!([1, 2]))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_nodes_sync_through_relay() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = api::router(test_state(temp_dir.path()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { axum::serve(listener, app).await });
    let relay_url = format!("http://{addr}/");

    let alex = GroupMove::init(
        Config::new(temp_dir.path().join("alex"))
            .with_participant_name("Alex")
            .with_relay_url(relay_url.clone())
            .with_sync_interval(3600),
    )
    .await
    .unwrap();
    let sam = GroupMove::init(
        Config::new(temp_dir.path().join("sam"))
            .with_participant_name("Sam")
            .with_relay_url(relay_url)
            .with_sync_interval(3600),
    )
    .await
    .unwrap();

    let home = alex
        .properties()
        .create_property_with_defaults("Blair House", Color::default(), false, None, &["Kitchen"])
        .unwrap();
    let kitchen = alex.store().rooms(home.id)[0].id;
    alex.store()
        .create_move_item(kitchen, home.id, NewMoveItem { name: "Microwave".into(), ..Default::default() })
        .unwrap();
    alex.store().save().unwrap();

    let token = alex.sharing().publish_invitation(home.id, Permission::ReadWrite).await.unwrap();
    alex.sync_now().await.unwrap();
    sam.accept_share(&token).await.unwrap();

    sam.store()
        .create_move_item(kitchen, home.id, NewMoveItem { name: "Kettle".into(), ..Default::default() })
        .unwrap();
    sam.store().save().unwrap();
    sam.sync_now().await.unwrap();
    alex.sync_now().await.unwrap();

    let mut names: Vec<String> = alex.store().items_in_room(kitchen).into_iter().map(|i| i.name).collect();
    names.sort();
    assert_eq!(names, vec!["Kettle".to_string(), "Microwave".to_string()]);
    assert_eq!(alex.sync_status().pending_outbound, 0);
    assert_eq!(sam.sharing().current_participants(home.id).len(), 2);

    alex.shutdown().await.unwrap();
    sam.shutdown().await.unwrap();
    server.abort();
}
