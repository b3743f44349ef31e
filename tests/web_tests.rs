use axum::body::Body;
use futures::StreamExt;
use http::{Request, StatusCode, header};
use runstate::client::{Connector, HttpConnector, SubscribeOptions, SubscriptionRegistry, VIEWER_HEADER};
use runstate::stream::SseDecoder;
use runstate::{MuxEvent, RunState, RunStateConfig, TagOptions};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use tower::ServiceExt;

async fn room(rs: &RunState, stream_id: &str, visibility: &str, state: Value) -> String {
    let run = rs.host().start_run().expect("start run");
    rs.tags()
        .set_tag_for_run(&run, &format!("stream:{stream_id}"), None, TagOptions::unique())
        .await
        .expect("claim stream");
    rs.tags()
        .add_run_to_tag(visibility, &run)
        .await
        .expect("visibility tag");
    let mut channel = rs.channel(&run, state).expect("channel");
    channel.commit().await.expect("commit");
    run
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn decode_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body");
    serde_json::from_slice(&bytes).expect("json body")
}

/// Read SSE events from a never-ending body until `count` have arrived
async fn read_events(response: axum::response::Response, count: usize) -> Vec<MuxEvent> {
    let mut body = response.into_body().into_data_stream();
    let mut decoder = SseDecoder::new();
    let mut events = Vec::new();
    while events.len() < count {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("frame in time")
            .expect("body open")
            .expect("chunk");
        events.extend(decoder.push(&chunk).expect("valid frame"));
    }
    events
}

#[tokio::test]
async fn healthz_reports_ok() {
    let rs = RunState::in_memory(RunStateConfig::default()).expect("runstate");
    let response = rs.router().oneshot(get("/healthz")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(decode_json(response).await, json!({"status": "ok"}));
}

#[tokio::test]
async fn state_endpoint_returns_snapshot_with_start_index() {
    let rs = RunState::in_memory(RunStateConfig::default()).expect("runstate");
    room(&rs, "general", "auth:public", json!({"messages": ["hi"]})).await;

    let response = rs
        .router()
        .oneshot(get("/api/state/general"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        decode_json(response).await,
        json!({"state": {"messages": ["hi"]}, "startIndex": 1})
    );
}

#[tokio::test]
async fn state_endpoint_hides_unknown_and_private_streams() {
    let rs = RunState::in_memory(RunStateConfig::default()).expect("runstate");
    room(&rs, "staff", "auth:private", json!({"secret": true})).await;
    let router = rs.router();

    let unknown = router
        .clone()
        .oneshot(get("/api/state/nobody"))
        .await
        .expect("response");
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    assert_eq!(decode_json(unknown).await["code"], json!("not_found"));

    let hidden = router
        .clone()
        .oneshot(get("/api/state/staff"))
        .await
        .expect("response");
    assert_eq!(hidden.status(), StatusCode::NOT_FOUND);

    let signed_in = router
        .oneshot(
            Request::builder()
                .uri("/api/state/staff")
                .header(VIEWER_HEADER, "ada")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(signed_in.status(), StatusCode::OK);
    assert_eq!(decode_json(signed_in).await["state"], json!({"secret": true}));
}

#[tokio::test]
async fn stream_endpoint_sends_connected_then_messages() {
    let rs = RunState::in_memory(RunStateConfig::default()).expect("runstate");
    room(&rs, "general", "auth:public", json!({"n": 1})).await;
    room(&rs, "random", "auth:public", json!({"n": 2})).await;

    let response = rs
        .router()
        .oneshot(get("/api/stream?stream=general&stream=random&startIndex=0"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).expect("content type"),
        "text/event-stream"
    );

    let events = read_events(response, 3).await;
    assert_eq!(events[0], MuxEvent::Connected);

    let mut names: Vec<_> = events[1..]
        .iter()
        .map(|event| match event {
            MuxEvent::Message { stream, .. } => stream.clone().expect("named frame"),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["general", "random"]);
}

#[tokio::test]
async fn stream_endpoint_rejects_bad_start_index() {
    let rs = RunState::in_memory(RunStateConfig::default()).expect("runstate");
    let response = rs
        .router()
        .oneshot(get("/api/stream?stream=general&startIndex=soon"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(decode_json(response).await["code"], json!("input_error"));
}

#[tokio::test]
async fn http_connector_follows_a_served_stream() {
    let rs = RunState::in_memory(RunStateConfig::default()).expect("runstate");
    let run = room(&rs, "general", "auth:public", json!({"messages": []})).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let router = rs.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let connector = HttpConnector::new(format!("http://{addr}/"));
    let mut raw = assert_ok!(connector.connect("general", 0).await);
    let first = tokio::time::timeout(Duration::from_secs(5), raw.next())
        .await
        .expect("event in time")
        .expect("stream open");
    assert_eq!(assert_ok!(first), MuxEvent::Connected);
    drop(raw);

    let registry = SubscriptionRegistry::new(Arc::new(connector));
    let mut sub = registry
        .subscribe("general", SubscribeOptions::new())
        .expect("subscribe");
    sub.wait_for_count(1).await.expect("first message");

    let mut channel = rs.channel(&run, json!({"messages": []})).expect("channel");
    channel.state_mut()["messages"] = json!(["over the wire"]);
    // a fresh channel starts with a replace
    channel.commit().await.expect("commit");

    let view = tokio::time::timeout(Duration::from_secs(5), sub.wait_for_count(2))
        .await
        .expect("update in time")
        .expect("view");
    assert_eq!(view.state, json!({"messages": ["over the wire"]}));
}
