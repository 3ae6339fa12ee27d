//! HTTP and websocket endpoint tests.

use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use futures::{SinkExt, StreamExt};
use sanctum::game::GameType;
use sanctum_protocol::{ChatKind, ChatMessage};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{self, Message, client::IntoClientRequest};
use tower::ServiceExt;

mod common;
use common::{TestHubs, test_hubs};

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn get(uri: &str, user: Option<u64>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri).method(Method::GET);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user.to_string());
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let hubs = test_hubs().await;
    let response = hubs.router().oneshot(get("/health", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["chat_connections"], 0);
    assert_eq!(json["online_users"], 0);
}

#[tokio::test]
async fn test_create_and_fetch_room() {
    let hubs = test_hubs().await;
    let response = hubs
        .router()
        .oneshot(
            Request::builder()
                .uri("/games/rooms")
                .method(Method::POST)
                .header("x-user-id", "7")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"game_type": "tictactoe"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let room = body_json(response).await;
    assert_eq!(room["status"], "pending");
    assert_eq!(room["creator_id"], 7);
    assert_eq!(room["type"], "tictactoe");

    let id = room["id"].as_u64().unwrap();
    let response = hubs
        .router()
        .oneshot(get(&format!("/games/rooms/{id}"), Some(7)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["id"], id);

    let response = hubs
        .router()
        .oneshot(get("/games/rooms/424242", Some(7)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_stats_and_unknown_game_type() {
    let hubs = test_hubs().await;
    let response = hubs
        .router()
        .oneshot(get("/games/stats/tictactoe", Some(3)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["user_id"], 3);
    assert_eq!(stats["total_games"], 0);

    let response = hubs
        .router()
        .oneshot(get("/games/stats/chess", Some(3)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_user_is_unauthorized() {
    let hubs = test_hubs().await;
    for uri in ["/games/stats/tictactoe", "/ws/chat", "/ws/game?room_id=1"] {
        let response = hubs.router().oneshot(get(uri, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
    }
    let response = hubs
        .router()
        .oneshot(
            Request::builder()
                .uri("/games/stats/tictactoe")
                .header("x-user-id", "not-a-number")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

async fn serve(hubs: &TestHubs) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = hubs.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}")
}

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(base: &str, path: &str, user: u64) -> Result<Client, tungstenite::Error> {
    let mut request = format!("{base}{path}").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-user-id", user.to_string().parse().unwrap());
    tokio_tungstenite::connect_async(request)
        .await
        .map(|(stream, _)| stream)
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn status_of(err: tungstenite::Error) -> u16 {
    match err {
        tungstenite::Error::Http(response) => response.status().as_u16(),
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_game_over_real_sockets() {
    let hubs = test_hubs().await;
    let base = serve(&hubs).await;
    let room_id = hubs
        .games
        .create_room(1, GameType::TicTacToe)
        .await
        .unwrap()
        .id();

    let path = format!("/ws/game?room_id={room_id}");
    let mut creator = connect(&base, &path, 1).await.unwrap();
    let mut opponent = connect(&base, &path, 2).await.unwrap();
    for _ in 0..50 {
        if hubs.games.room_peers(room_id) == vec![1, 2] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Both seats are taken now.
    let err = connect(&base, &path, 3).await.unwrap_err();
    assert_eq!(status_of(err), 409);
    let err = connect(&base, "/ws/game", 3).await.unwrap_err();
    assert_eq!(status_of(err), 400);

    opponent
        .send(Message::text(json!({"type": "join_room"}).to_string()))
        .await
        .unwrap();
    let started = next_json(&mut creator).await;
    assert_eq!(started["type"], "game_started");
    assert_eq!(started["payload"]["opponent_id"], 2);
    assert_eq!(next_json(&mut creator).await["type"], "game_state");

    creator
        .send(Message::text(
            json!({"type": "make_move", "payload": {"x": 2, "y": 0}}).to_string(),
        ))
        .await
        .unwrap();
    let mut state = next_json(&mut opponent).await;
    while state["payload"]["board"][2][0] != "X" {
        state = next_json(&mut opponent).await;
    }
    assert_eq!(state["payload"]["next_turn"], 2);
}

#[tokio::test]
async fn test_chat_over_real_socket() {
    let hubs = test_hubs().await;
    let base = serve(&hubs).await;
    let mut client = connect(&base, "/ws/chat", 5).await.unwrap();

    client
        .send(Message::text(json!({"type": "join", "conversation_id": 77}).to_string()))
        .await
        .unwrap();
    for _ in 0..50 {
        if hubs.chat.conversation_members(77) == vec![5] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(hubs.chat.is_online(5));

    let message = ChatMessage::new(ChatKind::Message, 77, json!({"content": "welcome"}));
    hubs.chat.publish_to_conversation(77, &message).await;
    assert_eq!(next_json(&mut client).await["payload"]["content"], "welcome");

    client.close(None).await.unwrap();
    for _ in 0..50 {
        if !hubs.chat.is_online(5) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!hubs.chat.is_online(5));
}

#[tokio::test]
async fn test_shutdown_notice_reaches_client() {
    let hubs = test_hubs().await;
    let base = serve(&hubs).await;
    let mut client = connect(&base, "/ws/videochat?room_id=lobby&username=ada", 9).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "room_users");

    assert_eq!(hubs.signals.shutdown(), 1);
    assert_eq!(next_json(&mut client).await["type"], "server_shutdown");
}
