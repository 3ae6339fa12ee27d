//! Chat hub integration tests.

use std::sync::Arc;

use sanctum::chat::Participant;
use sanctum::ws::Connection;
use sanctum_protocol::{ChatKind, ChatMessage, RealtimeEvent};
use serde_json::json;

mod common;
use common::{drain, test_hubs};

#[tokio::test]
async fn test_registry_tracks_only_live_connections() {
    let hubs = test_hubs().await;
    let chat = &hubs.chat;

    let conns: Vec<Arc<Connection>> = [1, 1, 2, 3, 3, 3]
        .into_iter()
        .map(|user| Connection::new(user, 8).0)
        .collect();
    for conn in &conns {
        chat.register_user(conn);
    }
    chat.join_conversation(1, 10);
    chat.join_conversation(3, 10);
    chat.join_conversation(3, 11);
    assert_eq!(chat.online_users(), vec![1, 2, 3]);
    assert_eq!(chat.connection_count(), 6);

    chat.unregister_user(&conns[0]);
    chat.unregister_user(&conns[3]);
    chat.unregister_user(&conns[3]);
    assert_eq!(chat.connection_count(), 4);
    assert!(chat.is_online(1));
    assert_eq!(chat.conversation_members(10), vec![1, 3]);

    chat.unregister_user(&conns[1]);
    chat.unregister_user(&conns[4]);
    chat.unregister_user(&conns[5]);
    assert_eq!(chat.online_users(), vec![2]);
    assert!(chat.conversation_members(10).is_empty());
    assert!(chat.conversation_members(11).is_empty());
}

#[tokio::test]
async fn test_conversation_broadcast_is_exact() {
    let hubs = test_hubs().await;
    let chat = &hubs.chat;
    let (a, mut ra) = Connection::new(1, 8);
    let (b, mut rb) = Connection::new(2, 8);
    let (c, mut rc) = Connection::new(3, 8);
    for conn in [&a, &b, &c] {
        chat.register_user(conn);
    }
    chat.join_conversation(1, 101);
    chat.join_conversation(2, 101);
    chat.join_conversation(3, 202);

    let message = ChatMessage::new(
        ChatKind::Message,
        101,
        json!({"id": 55, "content": "hello"}),
    )
    .sent_by(1);
    chat.publish_to_conversation(101, &message).await;

    let expected = serde_json::to_value(&message).unwrap();
    assert_eq!(drain(&mut ra), vec![expected.clone()]);
    assert_eq!(drain(&mut rb), vec![expected]);
    assert!(drain(&mut rc).is_empty());
}

#[tokio::test]
async fn test_user_and_global_events() {
    let hubs = test_hubs().await;
    let chat = &hubs.chat;
    let (a_web, mut ra_web) = Connection::new(1, 8);
    let (a_app, mut ra_app) = Connection::new(1, 8);
    let (b, mut rb) = Connection::new(2, 8);
    for conn in [&a_web, &a_app, &b] {
        chat.register_user(conn);
    }

    let friend = RealtimeEvent::new("friend_request").with("from_user_id", 2);
    chat.publish_to_user(1, &friend).await;
    assert_eq!(drain(&mut ra_web)[0]["type"], "friend_request");
    assert_eq!(drain(&mut ra_app)[0]["payload"]["from_user_id"], 2);
    assert!(drain(&mut rb).is_empty());

    let notice = RealtimeEvent::new("maintenance").with("minutes", 5);
    chat.publish_broadcast(&notice).await;
    assert_eq!(drain(&mut ra_web).len(), 1);
    assert_eq!(drain(&mut ra_app).len(), 1);
    assert_eq!(drain(&mut rb)[0]["type"], "maintenance");
}

#[tokio::test]
async fn test_mentions_skip_sender_and_strangers() {
    let hubs = test_hubs().await;
    let chat = &hubs.chat;
    let (alice, mut ralice) = Connection::new(1, 8);
    let (bob, mut rbob) = Connection::new(2, 8);
    chat.register_user(&alice);
    chat.register_user(&bob);

    let participants = [
        Participant {
            user_id: 1,
            username: "Alice".into(),
        },
        Participant {
            user_id: 2,
            username: "bob".into(),
        },
    ];
    let notified = chat
        .announce_mentions(101, 7, 1, "@alice @bob @nobody @BOB", &participants)
        .await;
    assert_eq!(notified, vec![2]);

    let to_bob = drain(&mut rbob);
    assert_eq!(to_bob.len(), 1);
    assert_eq!(to_bob[0]["type"], RealtimeEvent::CHAT_MENTION);
    assert_eq!(to_bob[0]["payload"]["message_id"], 7);
    assert!(to_bob[0]["payload"]["created_at"].is_string());
    assert!(drain(&mut ralice).is_empty());
}
