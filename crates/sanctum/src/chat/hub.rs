//! User- and conversation-scoped hub for chat sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use sanctum_protocol::{
    ChatCommand, ChatKind, ChatMessage, ConversationId, RealtimeEvent, UserId,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::mentions::{Participant, resolve_mentions};
use crate::error::HubError;
use crate::notify::{self, BusError, BusMessage, Notifier};
use crate::ws::{self, Connection, ConnectionId, ConnectionOwner, Frame, InboundHandler, ScopedRegistry};

/// Longest message excerpt carried in a mention notification.
const MENTION_PREVIEW_CHARS: usize = 100;

/// Membership lookups the hub needs from the conversation store.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> anyhow::Result<bool>;
}

/// Lets every user join every conversation.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenDirectory;

#[async_trait]
impl ConversationDirectory for OpenDirectory {
    async fn is_participant(&self, _: ConversationId, _: UserId) -> anyhow::Result<bool> {
        Ok(true)
    }
}

#[derive(Default)]
struct ChatState {
    /// user -> connection id -> socket
    users: ScopedRegistry<UserId, ConnectionId, Arc<Connection>>,
    /// conversation -> joined users
    conversations: ScopedRegistry<ConversationId, UserId, ()>,
    /// user -> joined conversations
    memberships: ScopedRegistry<UserId, ConversationId, ()>,
}

pub struct ChatHub {
    state: RwLock<ChatState>,
    directory: Arc<dyn ConversationDirectory>,
    notifier: Arc<Notifier>,
    conversations_wired: Arc<AtomicBool>,
    notifications_wired: Arc<AtomicBool>,
}

impl ChatHub {
    pub fn new(notifier: Arc<Notifier>, directory: Arc<dyn ConversationDirectory>) -> Self {
        Self {
            state: RwLock::new(ChatState::default()),
            directory,
            notifier,
            conversations_wired: Arc::new(AtomicBool::new(false)),
            notifications_wired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn register_user(&self, conn: &Arc<Connection>) {
        let user_id = conn.user_id();
        let sockets = {
            let mut state = ws::write(&self.state);
            state.users.register(user_id, conn.id(), conn.clone());
            state.users.scope_len(&user_id)
        };
        info!(user_id, conn_id = conn.id(), sockets, "chat connection registered");
    }

    /// Remove exactly `conn`. The user's conversations are dropped with their last socket.
    pub fn unregister_user(&self, conn: &Arc<Connection>) {
        let user_id = conn.user_id();
        let mut state = ws::write(&self.state);
        if state.users.unregister(&user_id, &conn.id()).is_none() {
            return;
        }
        if state.users.contains_scope(&user_id) {
            drop(state);
            debug!(user_id, conn_id = conn.id(), "chat connection unregistered");
            return;
        }

        let left = state
            .memberships
            .remove_scope(&user_id)
            .map(|joined| joined.into_keys().collect::<Vec<_>>())
            .unwrap_or_default();
        for conversation_id in &left {
            state.conversations.unregister(conversation_id, &user_id);
        }
        drop(state);
        info!(user_id, conversations = left.len(), "user went offline");
    }

    pub fn join_conversation(&self, user_id: UserId, conversation_id: ConversationId) {
        let mut state = ws::write(&self.state);
        state.conversations.register(conversation_id, user_id, ());
        state.memberships.register(user_id, conversation_id, ());
        drop(state);
        debug!(user_id, conversation_id, "joined conversation");
    }

    pub fn leave_conversation(&self, user_id: UserId, conversation_id: ConversationId) {
        let mut state = ws::write(&self.state);
        state.conversations.unregister(&conversation_id, &user_id);
        state.memberships.unregister(&user_id, &conversation_id);
        drop(state);
        debug!(user_id, conversation_id, "left conversation");
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        ws::read(&self.state).users.contains_scope(&user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = ws::read(&self.state).users.scopes().copied().collect();
        users.sort_unstable();
        users
    }

    /// Users joined to a conversation on this instance.
    pub fn conversation_members(&self, conversation_id: ConversationId) -> Vec<UserId> {
        let mut members = ws::read(&self.state).conversations.members(&conversation_id);
        members.sort_unstable();
        members
    }

    pub fn connection_count(&self) -> usize {
        ws::read(&self.state).users.member_count()
    }

    pub fn online_count(&self) -> usize {
        ws::read(&self.state).users.len()
    }

    /// Push to every socket of every member of the conversation. Returns the number queued.
    pub fn broadcast_to_conversation<T: Serialize>(
        &self,
        conversation_id: ConversationId,
        message: &T,
    ) -> usize {
        match encode(message) {
            Some(frame) => self.deliver_to_conversation(conversation_id, frame),
            None => 0,
        }
    }

    pub fn broadcast_to_user<T: Serialize>(&self, user_id: UserId, message: &T) -> usize {
        match encode(message) {
            Some(frame) => self.deliver_to_user(user_id, frame),
            None => 0,
        }
    }

    pub fn broadcast_all<T: Serialize>(&self, message: &T) -> usize {
        let Some(frame) = encode(message) else {
            return 0;
        };
        let targets: Vec<Arc<Connection>> = ws::read(&self.state)
            .users
            .iter()
            .map(|(_, _, conn)| conn.clone())
            .collect();
        queue_all(&targets, &frame)
    }

    fn deliver_to_conversation(&self, conversation_id: ConversationId, frame: Frame) -> usize {
        let targets: Vec<Arc<Connection>> = {
            let state = ws::read(&self.state);
            state
                .conversations
                .members(&conversation_id)
                .iter()
                .flat_map(|user_id| state.users.snapshot(user_id))
                .collect()
        };
        queue_all(&targets, &frame)
    }

    fn deliver_to_user(&self, user_id: UserId, frame: Frame) -> usize {
        let targets = ws::read(&self.state).users.snapshot(&user_id);
        queue_all(&targets, &frame)
    }

    /// Fan a chat message out to a conversation on every instance.
    pub async fn publish_to_conversation(&self, conversation_id: ConversationId, message: &ChatMessage) {
        let Some(json) = to_json(message) else { return };
        if self.conversations_wired.load(Ordering::Acquire) {
            match self
                .notifier
                .publish(&notify::conversation_channel(conversation_id), &json)
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    warn!(conversation_id, error = %e, "chat publish failed, delivering locally")
                }
            }
        }
        self.deliver_to_conversation(conversation_id, Frame::from(json));
    }

    /// Push a realtime event to every socket of `user_id` on every instance.
    pub async fn publish_to_user(&self, user_id: UserId, event: &RealtimeEvent) {
        let Some(json) = to_json(event) else { return };
        if self.notifications_wired.load(Ordering::Acquire) {
            match self.notifier.publish_to_user(user_id, &json).await {
                Ok(()) => return,
                Err(e) => warn!(user_id, error = %e, "notification publish failed, delivering locally"),
            }
        }
        self.deliver_to_user(user_id, Frame::from(json));
    }

    pub async fn publish_broadcast(&self, event: &RealtimeEvent) {
        let Some(json) = to_json(event) else { return };
        if self.notifications_wired.load(Ordering::Acquire) {
            match self.notifier.publish_broadcast(&json).await {
                Ok(()) => return,
                Err(e) => warn!(error = %e, "broadcast publish failed, delivering locally"),
            }
        }
        self.broadcast_all(event);
    }

    /// Notify every participant mentioned in `content`, except the sender.
    ///
    /// Each mentioned user gets a `chat_mention` realtime event, and the
    /// conversation gets a `chat_mention` message. Returns the users notified.
    pub async fn announce_mentions(
        &self,
        conversation_id: ConversationId,
        message_id: u64,
        sender_id: UserId,
        content: &str,
        participants: &[Participant],
    ) -> Vec<UserId> {
        let mentioned = resolve_mentions(content, sender_id, participants);
        if mentioned.is_empty() {
            return mentioned;
        }
        let preview: String = content.chars().take(MENTION_PREVIEW_CHARS).collect();
        let created_at = Utc::now().to_rfc3339();

        for &user_id in &mentioned {
            let event = RealtimeEvent::new(RealtimeEvent::CHAT_MENTION)
                .with("conversation_id", conversation_id)
                .with("message_id", message_id)
                .with("mentioned_user_id", user_id)
                .with("from_user_id", sender_id)
                .with("preview", preview.as_str())
                .with("created_at", created_at.as_str());
            self.publish_to_user(user_id, &event).await;
            self.publish_to_conversation(
                conversation_id,
                &ChatMessage::mention(conversation_id, sender_id, user_id, message_id),
            )
            .await;
        }
        info!(conversation_id, message_id, sender_id, mentioned = mentioned.len(), "mentions announced");
        mentioned
    }

    /// Decode and execute one inbound frame from a chat socket.
    pub async fn handle_message(&self, conn: &Arc<Connection>, raw: &[u8]) {
        let user_id = conn.user_id();
        let message = match ChatMessage::from_slice(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(user_id, error = %e, "dropping malformed chat frame");
                return;
            }
        };
        let command = match ChatCommand::decode(&message) {
            Ok(command) => command,
            Err(e) => {
                warn!(user_id, kind = %message.kind, error = %e, "dropping invalid chat frame");
                return;
            }
        };

        match command {
            ChatCommand::Join(conversation_id) => {
                match self.directory.is_participant(conversation_id, user_id).await {
                    Ok(true) => self.join_conversation(user_id, conversation_id),
                    Ok(false) => {
                        debug!(user_id, conversation_id, "join refused");
                        conn.send_json(&ChatMessage::error(
                            Some(conversation_id),
                            HubError::NotParticipant.client_message(),
                        ));
                    }
                    Err(e) => {
                        error!(user_id, conversation_id, error = %e, "membership lookup failed");
                        conn.send_json(&ChatMessage::error(
                            Some(conversation_id),
                            HubError::Storage(e).client_message(),
                        ));
                    }
                }
            }
            ChatCommand::Leave(conversation_id) => self.leave_conversation(user_id, conversation_id),
            ChatCommand::Typing(conversation_id) => {
                let joined = ws::read(&self.state)
                    .conversations
                    .contains(&conversation_id, &user_id);
                if !joined {
                    debug!(user_id, conversation_id, "typing outside a joined conversation");
                    return;
                }
                let typing = ChatMessage::new(ChatKind::Typing, conversation_id, message.payload)
                    .sent_by(user_id);
                self.publish_to_conversation(conversation_id, &typing).await;
            }
            ChatCommand::Unknown(kind) => debug!(user_id, %kind, "ignoring chat frame"),
        }
    }

    pub fn is_wired(&self) -> bool {
        self.conversations_wired.load(Ordering::Acquire)
            && self.notifications_wired.load(Ordering::Acquire)
    }

    /// Subscribe to conversation and notification channels.
    pub async fn start_wiring(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, BusError> {
        let hub = Arc::clone(self);
        let conversations = self
            .notifier
            .subscribe(
                &format!("{}*", notify::CONVERSATION_PREFIX),
                cancel.clone(),
                self.conversations_wired.clone(),
                move |msg| hub.on_conversation_message(msg),
            )
            .await?;

        let hub = Arc::clone(self);
        let notifications = self
            .notifier
            .subscribe(
                "notifications:*",
                cancel,
                self.notifications_wired.clone(),
                move |msg| hub.on_notification(msg),
            )
            .await?;
        Ok(vec![conversations, notifications])
    }

    fn on_conversation_message(&self, msg: BusMessage) {
        let Some(conversation_id) = notify::parse_conversation_channel(&msg.channel) else {
            warn!(channel = %msg.channel, "ignoring message on malformed conversation channel");
            return;
        };
        match ChatMessage::from_slice(msg.payload.as_bytes()) {
            Ok(message) => {
                self.broadcast_to_conversation(conversation_id, &message);
            }
            Err(e) => warn!(conversation_id, error = %e, "dropping malformed chat payload"),
        }
    }

    fn on_notification(&self, msg: BusMessage) {
        let event: RealtimeEvent = match serde_json::from_str(&msg.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = %msg.channel, error = %e, "dropping malformed notification");
                return;
            }
        };
        if msg.channel == notify::BROADCAST_CHANNEL {
            self.broadcast_all(&event);
        } else if let Some(user_id) = notify::parse_user_channel(&msg.channel) {
            self.broadcast_to_user(user_id, &event);
        } else {
            warn!(channel = %msg.channel, "ignoring unknown notification channel");
        }
    }

    /// Tell every chat socket the server is going away and close their queues.
    pub fn shutdown(&self) -> usize {
        let drained = {
            let mut state = ws::write(&self.state);
            state.conversations.drain();
            state.memberships.drain();
            state.users.drain()
        };
        let notice = ChatMessage::shutdown();
        for (_, _, conn) in &drained {
            conn.send_json(&notice);
            conn.close();
        }
        info!(connections = drained.len(), "chat hub shut down");
        drained.len()
    }
}

fn to_json<T: Serialize>(message: &T) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(json) => Some(json),
        Err(e) => {
            error!(error = %e, "failed to serialize chat message");
            None
        }
    }
}

fn encode<T: Serialize>(message: &T) -> Option<Frame> {
    to_json(message).map(Frame::from)
}

fn queue_all(targets: &[Arc<Connection>], frame: &Frame) -> usize {
    targets
        .iter()
        .filter(|conn| conn.try_send(frame.clone()) == ws::SendOutcome::Queued)
        .count()
}

/// Per-connection adapter for chat sockets.
pub struct ChatSocket {
    hub: Arc<ChatHub>,
}

impl ChatSocket {
    pub fn new(hub: Arc<ChatHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl InboundHandler for ChatSocket {
    async fn on_message(&self, conn: &Arc<Connection>, raw: &[u8]) {
        self.hub.handle_message(conn, raw).await;
    }
}

#[async_trait]
impl ConnectionOwner for ChatSocket {
    async fn unregister(&self, conn: &Arc<Connection>) {
        self.hub.unregister_user(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    fn hub() -> ChatHub {
        ChatHub::new(Arc::new(Notifier::in_memory()), Arc::new(OpenDirectory))
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(frame.as_str()).unwrap());
        }
        out
    }

    struct Closed;

    #[async_trait]
    impl ConversationDirectory for Closed {
        async fn is_participant(&self, _: ConversationId, _: UserId) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn last_socket_takes_memberships_with_it() {
        let hub = hub();
        let (a1, _r1) = Connection::new(1, 8);
        let (a2, _r2) = Connection::new(1, 8);
        hub.register_user(&a1);
        hub.register_user(&a2);
        hub.register_user(&a2);
        hub.join_conversation(1, 101);
        assert_eq!(hub.connection_count(), 2);
        assert_eq!(hub.online_count(), 1);

        hub.unregister_user(&a1);
        assert!(hub.is_online(1));
        assert_eq!(hub.conversation_members(101), vec![1]);

        hub.unregister_user(&a2);
        assert!(!hub.is_online(1));
        assert!(hub.conversation_members(101).is_empty());
        assert!(hub.online_users().is_empty());
    }

    #[test]
    fn conversation_broadcast_reaches_members_only() {
        let hub = hub();
        let (a, mut ra) = Connection::new(1, 8);
        let (a_phone, mut ra_phone) = Connection::new(1, 8);
        let (b, mut rb) = Connection::new(2, 8);
        let (c, mut rc) = Connection::new(3, 8);
        for conn in [&a, &a_phone, &b, &c] {
            hub.register_user(conn);
        }
        hub.join_conversation(1, 101);
        hub.join_conversation(2, 101);

        let message = ChatMessage::new(ChatKind::Message, 101, json!({"content": "hi"}));
        assert_eq!(hub.broadcast_to_conversation(101, &message), 3);

        let expected = serde_json::to_value(&message).unwrap();
        assert_eq!(drain(&mut ra), vec![expected.clone()]);
        assert_eq!(drain(&mut ra_phone), vec![expected.clone()]);
        assert_eq!(drain(&mut rb), vec![expected]);
        assert!(drain(&mut rc).is_empty());
    }

    #[test]
    fn full_queue_does_not_block_others() {
        let hub = hub();
        let (slow, _rs) = Connection::new(1, 1);
        let (fast, mut rf) = Connection::new(2, 8);
        hub.register_user(&slow);
        hub.register_user(&fast);
        hub.join_conversation(1, 7);
        hub.join_conversation(2, 7);

        let message = ChatMessage::new(ChatKind::Message, 7, json!({}));
        hub.broadcast_to_conversation(7, &message);
        assert_eq!(hub.broadcast_to_conversation(7, &message), 1);
        assert_eq!(slow.dropped_count(), 1);
        assert_eq!(drain(&mut rf).len(), 2);
    }

    #[tokio::test]
    async fn join_and_typing_over_the_socket() {
        let hub = hub();
        let (a, mut ra) = Connection::new(1, 8);
        let (b, mut rb) = Connection::new(2, 8);
        hub.register_user(&a);
        hub.register_user(&b);

        hub.handle_message(&a, br#"{"type":"join","conversation_id":5}"#).await;
        hub.handle_message(&b, br#"{"type":"join","conversation_id":5}"#).await;
        hub.handle_message(&a, br#"{"type":"typing","conversation_id":5,"payload":{"on":true}}"#)
            .await;

        let frames = drain(&mut rb);
        assert_eq!(
            frames,
            vec![json!({"type":"typing","conversation_id":5,"user_id":1,"payload":{"on":true}})]
        );
        assert_eq!(drain(&mut ra).len(), 1);

        hub.handle_message(&b, br#"{"type":"leave","conversation_id":5}"#).await;
        assert_eq!(hub.conversation_members(5), vec![1]);
    }

    #[tokio::test]
    async fn garbage_and_unknown_frames_are_ignored() {
        let hub = hub();
        let (a, mut ra) = Connection::new(1, 8);
        hub.register_user(&a);

        hub.handle_message(&a, b"{{{").await;
        hub.handle_message(&a, br#"{"type":"join"}"#).await;
        hub.handle_message(&a, br#"{"type":"dance","conversation_id":5}"#).await;
        hub.handle_message(&a, br#"{"type":"typing","conversation_id":5}"#).await;
        assert!(drain(&mut ra).is_empty());
        assert!(!a.is_closed());
    }

    #[tokio::test]
    async fn outsiders_cannot_join() {
        let hub = ChatHub::new(Arc::new(Notifier::in_memory()), Arc::new(Closed));
        let (a, mut ra) = Connection::new(1, 8);
        hub.register_user(&a);

        hub.handle_message(&a, br#"{"type":"join","conversation_id":9}"#).await;
        let frames = drain(&mut ra);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["conversation_id"], 9);
        assert!(hub.conversation_members(9).is_empty());
    }

    #[tokio::test]
    async fn mentions_notify_named_participants() {
        let hub = hub();
        let (bob, mut rb) = Connection::new(2, 8);
        hub.register_user(&bob);
        hub.join_conversation(2, 101);
        let participants = vec![
            Participant {
                user_id: 1,
                username: "alice".into(),
            },
            Participant {
                user_id: 2,
                username: "bob".into(),
            },
        ];

        let notified = hub
            .announce_mentions(101, 55, 1, "@alice ping @Bob", &participants)
            .await;
        assert_eq!(notified, vec![2]);

        let frames = drain(&mut rb);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["type"], "chat_mention");
        assert_eq!(frames[0]["payload"]["preview"], "@alice ping @Bob");
        assert_eq!(frames[0]["payload"]["from_user_id"], 1);
        assert_eq!(frames[1]["conversation_id"], 101);
        assert_eq!(frames[1]["payload"]["mentioned_user_id"], 2);
    }

    #[test]
    fn shutdown_notifies_every_socket() {
        let hub = hub();
        let (a, mut ra) = Connection::new(1, 8);
        let (b, mut rb) = Connection::new(2, 8);
        hub.register_user(&a);
        hub.register_user(&b);

        assert_eq!(hub.shutdown(), 2);
        assert_eq!(drain(&mut ra)[0]["type"], "server_shutdown");
        assert_eq!(drain(&mut rb)[0]["payload"]["message"], "Server is shutting down");
        assert!(a.is_closed() && b.is_closed());
        assert!(hub.online_users().is_empty());
    }
}
