use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use super::*;

const TOKEN: &str = "tok-1";

#[derive(Clone, Default)]
struct ServerState {
    calls: Arc<Mutex<Vec<String>>>,
}

impl ServerState {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().expect("calls lock").push(call.into());
    }
}

fn authorized(headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let expected = format!("Bearer {TOKEN}");
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Not authorized, no token" })),
        )),
    }
}

fn message_json(id: &str, sender: &str, receiver: &str, content: &str) -> Value {
    json!({
        "_id": id,
        "senderId": sender,
        "receiverId": receiver,
        "content": content,
        "timestamp": "2024-05-01T10:00:00.000Z",
        "read": false
    })
}

async fn spawn_api_server() -> (String, ServerState) {
    let state = ServerState::default();
    let app = Router::new()
        .route(
            "/api/messages/:friend_id",
            get(
                |State(state): State<ServerState>,
                 headers: HeaderMap,
                 Path(friend_id): Path<String>| async move {
                    authorized(&headers)?;
                    state.record(format!("GET messages/{friend_id}"));
                    Ok::<_, (StatusCode, Json<Value>)>(Json(json!([
                        message_json("m1", &friend_id, "me", "hello"),
                        message_json("m2", "me", &friend_id, "hi back"),
                    ])))
                },
            ),
        )
        .route(
            "/api/messages",
            post(
                |State(state): State<ServerState>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    authorized(&headers)?;
                    let receiver = body["receiverId"].as_str().unwrap_or_default().to_string();
                    let content = body["content"].as_str().unwrap_or_default().to_string();
                    state.record(format!("POST messages {receiver} {content}"));
                    Ok::<_, (StatusCode, Json<Value>)>((
                        StatusCode::CREATED,
                        Json(message_json("m9", "me", &receiver, &content)),
                    ))
                },
            ),
        )
        .route(
            "/api/messages/read/:friend_id",
            put(
                |State(state): State<ServerState>,
                 headers: HeaderMap,
                 Path(friend_id): Path<String>| async move {
                    authorized(&headers)?;
                    state.record(format!("PUT read/{friend_id}"));
                    Ok::<_, (StatusCode, Json<Value>)>(Json(json!({ "message": "Messages marked as read" })))
                },
            ),
        )
        .route(
            "/api/friends",
            get(|State(state): State<ServerState>, headers: HeaderMap| async move {
                authorized(&headers)?;
                state.record("GET friends");
                Ok::<_, (StatusCode, Json<Value>)>(Json(json!([
                    { "_id": "b", "friendshipId": "fs-b", "username": "bob", "email": "b@x.io", "unreadCount": 3 },
                    { "_id": "c", "friendshipId": "fs-c", "username": "carol", "email": "c@x.io" }
                ])))
            }),
        )
        .route(
            "/api/auth/login",
            post(|Json(body): Json<Value>| async move {
                if body["password"] == "secret" {
                    Ok(Json(json!({
                        "_id": "me",
                        "username": "alice",
                        "email": body["email"],
                        "token": TOKEN
                    })))
                } else {
                    Err((
                        StatusCode::UNAUTHORIZED,
                        Json(json!({ "message": "Invalid email or password" })),
                    ))
                }
            }),
        )
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}/api"), state)
}

#[tokio::test]
async fn fetches_conversation_with_bearer_token() {
    let (base_url, state) = spawn_api_server().await;
    let api = HttpChatApi::new(&base_url, TOKEN).expect("api");

    let messages = api.get_messages(&UserId::from("bob")).await.expect("messages");

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].sender_id, UserId::from("bob"));
    assert_eq!(
        state.calls.lock().expect("calls").as_slice(),
        ["GET messages/bob"]
    );
}

#[tokio::test]
async fn sends_marks_read_and_lists_friends() {
    let (base_url, state) = spawn_api_server().await;
    let api = HttpChatApi::new(&format!("{base_url}/"), TOKEN).expect("api");

    let sent = api
        .send_message(&UserId::from("bob"), "ping")
        .await
        .expect("send");
    assert_eq!(sent.content, "ping");
    assert_eq!(sent.receiver_id, UserId::from("bob"));

    api.mark_read(&UserId::from("bob")).await.expect("mark read");

    let friends = api.get_friends().await.expect("friends");
    assert_eq!(friends.len(), 2);
    assert_eq!(friends[0].unread(), 3);
    assert_eq!(friends[1].unread(), 0);

    assert_eq!(
        state.calls.lock().expect("calls").as_slice(),
        ["POST messages bob ping", "PUT read/bob", "GET friends"]
    );
}

#[tokio::test]
async fn rejected_requests_surface_backend_message() {
    let (base_url, _state) = spawn_api_server().await;
    let api = HttpChatApi::new(&base_url, "wrong-token").expect("api");

    let err = api.get_friends().await.expect_err("must be rejected");
    assert!(err.is_unauthorized());
    match err {
        ClientError::Api { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "Not authorized, no token");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn login_produces_session() {
    let (base_url, _state) = spawn_api_server().await;
    let auth = AuthApi::new(&base_url).expect("auth api");

    let session = auth.login("alice@x.io", "secret").await.expect("login");
    assert_eq!(session.user_id(), &UserId::from("me"));
    assert_eq!(session.user.email, "alice@x.io");
    assert_eq!(session.token, TOKEN);

    let err = auth
        .login("alice@x.io", "nope")
        .await
        .expect_err("bad password");
    assert!(err.to_string().contains("Invalid email or password"));
}

#[test]
fn for_session_requires_credentials() {
    let session = Session::new(
        shared::domain::UserProfile {
            id: UserId::from("me"),
            username: "alice".into(),
            email: "a@x.io".into(),
        },
        "",
    );
    assert!(matches!(
        HttpChatApi::for_session("http://localhost:4000/api", &session),
        Err(ClientError::NotSignedIn)
    ));
}

#[test]
fn endpoint_escapes_path_segments() {
    let base = Url::parse("http://localhost:4000/api").expect("url");
    let url = endpoint(&base, &["messages", "a/b"]).expect("endpoint");
    assert_eq!(url.as_str(), "http://localhost:4000/api/messages/a%2Fb");
}
