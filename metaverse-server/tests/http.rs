//! HTTP and WebSocket surface against a live listener
//!
//! Run with: cargo test -p metaverse-server --test http

use axum::{body::Body, http::Request, http::StatusCode};
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use metaverse_server::auth::Claims;
use metaverse_server::http::{create_router, AppState};
use metaverse_server::{Config, MetaverseServer};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config(jwt_secret: Option<&str>) -> Config {
    let mut config = Config::default();
    config.sfu.num_workers = 2;
    config.sfu.heartbeat_interval_secs = 1;
    config.sfu.peer_timeout_secs = 5;
    config.auth.jwt_secret = jwt_secret.map(str::to_string);
    config
}

async fn app_state(jwt_secret: Option<&str>) -> AppState {
    MetaverseServer::new(test_config(jwt_secret))
        .await
        .unwrap()
        .app_state()
}

async fn serve(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });
    addr
}

async fn get_json(state: &AppState, uri: &str) -> (StatusCode, Value) {
    let response = create_router(state.clone())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

/// Next JSON text frame, skipping heartbeats
async fn next_json(client: &mut Client) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    })
    .await
    .unwrap()
}

async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn test_health_and_stats() {
    let state = app_state(None).await;

    let (status, body) = get_json(&state, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["workers"], 2);
    assert_eq!(body["aliveWorkers"], 2);

    let (status, body) = get_json(&state, "/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active_rooms"], 0);
    assert_eq!(body["workers"].as_array().unwrap().len(), 2);

    let (status, body) = get_json(&state, "/stats/rooms/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "RoomNotFound");
}

#[tokio::test]
async fn test_signaling_over_websocket() {
    let state = app_state(None).await;
    let addr = serve(state.clone()).await;
    let url = format!("ws://{addr}/ws");

    let (mut alice, _) = connect_async(url.as_str()).await.unwrap();
    let (mut bob, _) = connect_async(url.as_str()).await.unwrap();

    send_json(&mut alice, json!({"id": 1, "method": "joinRoom", "data": {"roomId": "plaza", "peerId": "alice"}})).await;
    let ack = next_json(&mut alice).await;
    assert_eq!(ack["id"], 1);
    assert_eq!(ack["ok"], true);
    assert!(ack["data"]["routerCapabilities"]["codecs"].is_array());

    send_json(&mut bob, json!({"id": 1, "method": "joinRoom", "data": {"roomId": "plaza", "peerId": "bob"}})).await;
    assert_eq!(next_json(&mut bob).await["ok"], true);
    assert_eq!(
        next_json(&mut alice).await,
        json!({"event": "peerJoined", "data": {"peerId": "bob"}})
    );

    let (_, stats) = get_json(&state, "/stats/rooms/plaza").await;
    assert_eq!(stats["peer_count"], 2);

    // Malformed frame with a recoverable id
    send_json(&mut alice, json!({"id": 2, "method": "teleport"})).await;
    let nack = next_json(&mut alice).await;
    assert_eq!(nack["ok"], false);
    assert_eq!(nack["error"]["code"], "InvalidRequest");

    // Dropping the socket leaves the room
    bob.close(None).await.unwrap();
    assert_eq!(
        next_json(&mut alice).await,
        json!({"event": "peerLeft", "data": {"peerId": "bob"}})
    );
}

#[tokio::test]
async fn test_socket_requires_token_when_auth_enabled() {
    let state = app_state(Some("s3cret")).await;
    let addr = serve(state).await;

    let err = connect_async(format!("ws://{addr}/ws").as_str()).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED.as_u16());
        }
        other => panic!("expected HTTP rejection, got {other:?}"),
    }

    let claims = Claims {
        user_id: "user-1".to_string(),
        role: None,
        exp: Some(chrono::Utc::now().timestamp() + 600),
    };
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"s3cret")).unwrap();
    let (mut client, _) = connect_async(format!("ws://{addr}/ws?token={token}").as_str())
        .await
        .unwrap();
    send_json(&mut client, json!({"id": 7, "method": "joinRoom", "data": {"roomId": "r1"}})).await;
    let ack = next_json(&mut client).await;
    assert_eq!(ack["id"], 7);
    assert_eq!(ack["ok"], true);
    assert_eq!(ack["data"]["peerId"], "user-1");

    // The token's user cannot join under another name
    send_json(&mut client, json!({"id": 8, "method": "leaveRoom", "data": {}})).await;
    assert_eq!(next_json(&mut client).await["ok"], true);
    send_json(&mut client, json!({"id": 9, "method": "joinRoom", "data": {"roomId": "r1", "peerId": "mallory"}})).await;
    let nack = next_json(&mut client).await;
    assert_eq!(nack["ok"], false);
    assert_eq!(nack["error"]["code"], "InvalidRequest");
}

#[tokio::test]
async fn test_relay_call_flow() {
    let state = app_state(None).await;
    let addr = serve(state).await;
    let url = format!("ws://{addr}/ws/p2p");

    let (mut a, _) = connect_async(url.as_str()).await.unwrap();
    let (mut b, _) = connect_async(url.as_str()).await.unwrap();

    send_json(&mut a, json!({"event": "join-room", "data": {"roomid": "call", "email": "a@x.io"}})).await;
    assert_eq!(next_json(&mut a).await, json!({"event": "joined-room", "data": {"roomid": "call"}}));

    send_json(&mut b, json!({"event": "join-room", "data": {"roomid": "call", "email": "b@x.io"}})).await;
    assert_eq!(next_json(&mut b).await["event"], "joined-room");
    assert_eq!(next_json(&mut a).await, json!({"event": "user-joined", "data": {"email": "b@x.io"}}));

    send_json(&mut a, json!({"event": "call-user", "data": {"email": "b@x.io", "offer": {"sdp": "o"}}})).await;
    assert_eq!(
        next_json(&mut b).await,
        json!({"event": "incoming-call", "data": {"fromEmail": "a@x.io", "offer": {"sdp": "o"}}})
    );

    send_json(&mut b, json!({"event": "call-accepted", "data": {"to": "a@x.io", "answer": {"sdp": "a"}}})).await;
    assert_eq!(
        next_json(&mut a).await,
        json!({"event": "incoming-call-accepted", "data": {"from": "b@x.io", "answer": {"sdp": "a"}}})
    );
}
