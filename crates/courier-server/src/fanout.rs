//! Delivery of committed writes to live connections.
//!
//! Handlers publish a [`DomainEvent`] after their unit of work commits.
//! Events go through a bounded queue to a single background task that
//! resolves recipients and offers each frame once per connection. A full
//! queue drops the event; delivery never feeds back into stored state.
//!
//! Events carry the connection that caused them, when known. That
//! connection is left out of room broadcasts but still gets the per-user
//! feed frames.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_shared::protocol::{
    ConversationCreated, ConversationPresence, FeedUpdated, MessageEdited, MessageRead,
    MessagesDeleted, ServerEvent, UserPresence,
};
use courier_shared::types::{ConnectionId, MessageSource, Presence, RoomId, UserId};
use courier_store::{
    DeleteOutcome, EditOutcome, GroupSendOutcome, PairFeed, ReadOutcome, SendOutcome,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::presence::PresenceRegistry;

#[derive(Debug, Clone)]
pub enum DomainEvent {
    /// A send or reply committed. Also announces the conversation when it
    /// was created by this send.
    MessageSent {
        outcome: Box<SendOutcome>,
        origin: Option<ConnectionId>,
    },
    MessageEdited {
        outcome: Box<EditOutcome>,
        origin: Option<ConnectionId>,
    },
    MessageRead(ReadOutcome),
    MessagesDeleted {
        outcome: Box<DeleteOutcome>,
        origin: Option<ConnectionId>,
    },
    GroupMessageSent {
        outcome: Box<GroupSendOutcome>,
        origin: Option<ConnectionId>,
    },
    PresenceChanged {
        user: UserId,
        presence: Presence,
        last_seen_at: DateTime<Utc>,
        peers: Vec<UserId>,
        origin: Option<ConnectionId>,
    },
}

impl DomainEvent {
    fn name(&self) -> &'static str {
        match self {
            DomainEvent::MessageSent { .. } => "message_sent",
            DomainEvent::MessageEdited { .. } => "message_edited",
            DomainEvent::MessageRead(_) => "message_read",
            DomainEvent::MessagesDeleted { .. } => "messages_deleted",
            DomainEvent::GroupMessageSent { .. } => "group_message_sent",
            DomainEvent::PresenceChanged { .. } => "presence_changed",
        }
    }
}

/// Publishing half of the fanout queue.
#[derive(Clone)]
pub struct EventFanout {
    tx: mpsc::Sender<DomainEvent>,
}

impl EventFanout {
    /// Start the fanout task.
    pub fn spawn(registry: Arc<PresenceRegistry>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<DomainEvent>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch(&registry, event).await;
            }
            info!("Fanout task stopped");
        });

        (Self { tx }, handle)
    }

    /// Queue an event without waiting. Returns `false` if it was dropped.
    pub fn publish(&self, event: DomainEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(event = event.name(), "Fanout queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(event = event.name(), "Fanout task gone, dropping event");
                false
            }
        }
    }
}

/// Deliver one event. Returns the number of frames accepted by connections.
pub async fn dispatch(registry: &PresenceRegistry, event: DomainEvent) -> usize {
    let name = event.name();
    let delivered = match event {
        DomainEvent::MessageSent { outcome, origin } => {
            message_sent(registry, &outcome, origin).await
        }
        DomainEvent::MessageEdited { outcome, origin } => {
            message_edited(registry, &outcome, origin).await
        }
        DomainEvent::MessageRead(out) => message_read(registry, &out).await,
        DomainEvent::MessagesDeleted { outcome, origin } => {
            messages_deleted(registry, &outcome, origin).await
        }
        DomainEvent::GroupMessageSent { outcome, origin } => {
            group_message_sent(registry, &outcome, origin).await
        }
        DomainEvent::PresenceChanged {
            user,
            presence,
            last_seen_at,
            peers,
            origin,
        } => presence_changed(registry, user, presence, last_seen_at, &peers, origin).await,
    };
    debug!(event = name, delivered, "Event fanned out");
    delivered
}

async fn push_previews(registry: &PresenceRegistry, feed: &PairFeed) -> usize {
    let mut delivered = 0;
    for user in feed.participants() {
        let Some(entry) = feed.entry_for(user) else {
            continue;
        };
        let event = ServerEvent::FeedUpdated(FeedUpdated {
            entry: entry.clone(),
            unread_count: feed.unread_for(user),
        });
        delivered += registry.send_to_user(user, &event).await;
    }
    delivered
}

async fn message_sent(
    registry: &PresenceRegistry,
    out: &SendOutcome,
    origin: Option<ConnectionId>,
) -> usize {
    let [initiator, recipient] = out.feed.participants();
    let mut delivered = 0;

    if out.is_new_conversation {
        let created = ServerEvent::ConversationCreated(ConversationCreated {
            conversation_id: out.conversation_id,
            initiator_id: initiator,
            recipient_id: recipient,
        });
        for user in [initiator, recipient] {
            delivered += registry.send_to_user(user, &created).await;
        }
    }

    delivered += push_previews(registry, &out.feed).await;

    let room = RoomId::for_pair(initiator, recipient);
    let event = ServerEvent::ConversationMessage(out.message.clone());
    delivered + registry.broadcast_to_room(&room, &event, origin).await
}

async fn message_edited(
    registry: &PresenceRegistry,
    out: &EditOutcome,
    origin: Option<ConnectionId>,
) -> usize {
    let room = match (out.source, out.peer) {
        (MessageSource::Conversation(_), Some(peer)) => RoomId::for_pair(out.message.sender.id, peer),
        (MessageSource::Conversation(_), None) => return 0,
        (MessageSource::Group(group), _) => RoomId::for_group(group),
    };

    let mut delivered = 0;
    if let Some(feed) = &out.feed {
        delivered += push_previews(registry, feed).await;
    }

    let event = ServerEvent::MessageEdited(MessageEdited {
        message: out.message.clone(),
        source: out.source,
        is_last_message: out.is_last_message,
    });
    delivered + registry.broadcast_to_room(&room, &event, origin).await
}

async fn message_read(registry: &PresenceRegistry, out: &ReadOutcome) -> usize {
    let event = ServerEvent::MessageRead(MessageRead {
        conversation_id: out.conversation_id,
        message_id: out.message_id,
        read_at: out.read_at,
    });
    registry.send_to_user(out.author_id, &event).await
}

async fn messages_deleted(
    registry: &PresenceRegistry,
    out: &DeleteOutcome,
    origin: Option<ConnectionId>,
) -> usize {
    let [initiator, recipient] = out.feed.participants();
    let mut delivered = 0;

    if out.is_last_message {
        delivered += push_previews(registry, &out.feed).await;
    }

    let event = ServerEvent::MessagesDeleted(MessagesDeleted {
        conversation_id: out.conversation_id,
        message_ids: out.message_ids.clone(),
        is_last_message: out.is_last_message,
        last_message: out.last_message.clone(),
        last_message_sent_at: out.last_message_sent_at,
        unread_count: out.feed.unread_for(recipient).unwrap_or(0),
    });
    let room = RoomId::for_pair(initiator, recipient);
    delivered + registry.broadcast_to_room(&room, &event, origin).await
}

async fn group_message_sent(
    registry: &PresenceRegistry,
    out: &GroupSendOutcome,
    origin: Option<ConnectionId>,
) -> usize {
    let preview = ServerEvent::FeedUpdated(FeedUpdated {
        entry: out.entry.clone(),
        unread_count: None,
    });
    let mut delivered = 0;
    for member in &out.members {
        delivered += registry.send_to_user(*member, &preview).await;
    }

    let room = RoomId::for_group(out.group_id);
    let event = ServerEvent::GroupMessage(out.message.clone());
    delivered + registry.broadcast_to_room(&room, &event, origin).await
}

async fn presence_changed(
    registry: &PresenceRegistry,
    user: UserId,
    presence: Presence,
    last_seen_at: DateTime<Utc>,
    peers: &[UserId],
    origin: Option<ConnectionId>,
) -> usize {
    let feed_event = ServerEvent::UserPresence(UserPresence {
        recipient_id: user,
        presence,
    });
    let room_event = ServerEvent::ConversationPresence(ConversationPresence {
        presence,
        last_seen_at,
    });

    let mut delivered = 0;
    for peer in peers {
        delivered += registry.send_to_user(*peer, &feed_event).await;
        let room = RoomId::for_pair(user, *peer);
        delivered += registry.broadcast_to_room(&room, &room_event, origin).await;
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::Outbound;
    use courier_store::Database;
    use courier_store::User;

    fn frames(conn: &mut crate::presence::LiveConnection) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(Outbound::Event(frame)) = conn.receiver.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    fn types(frames: &[serde_json::Value]) -> Vec<String> {
        frames
            .iter()
            .map(|f| f["type"].as_str().unwrap().to_string())
            .collect()
    }

    fn seeded_db() -> (Database, UserId, UserId) {
        let mut db = Database::open_in_memory().unwrap();
        let a = User::new("A", "a@example.com");
        let b = User::new("B", "b@example.com");
        let uow = db.begin().unwrap();
        uow.insert_user(&a).unwrap();
        uow.insert_user(&b).unwrap();
        uow.commit().unwrap();
        (db, a.id, b.id)
    }

    #[tokio::test]
    async fn test_first_send_announces_conversation_and_previews() {
        let (mut db, a, b) = seeded_db();
        let registry = PresenceRegistry::new(16);
        let mut a_conn = registry.connect(a).await;
        let mut b_conn = registry.connect(b).await;
        registry
            .join_room(RoomId::for_pair(a, b), b, b_conn.id)
            .await;

        let out = db.send_message(a, b, "hi").unwrap();
        let event = DomainEvent::MessageSent {
            outcome: Box::new(out),
            origin: None,
        };
        dispatch(&registry, event).await;

        assert_eq!(
            types(&frames(&mut a_conn)),
            vec!["conversation.created", "feed.updated"]
        );
        let b_frames = frames(&mut b_conn);
        assert_eq!(
            types(&b_frames),
            vec!["conversation.created", "feed.updated", "conversation.message"]
        );
        assert_eq!(b_frames[1]["data"]["unreadCount"], 1);
        assert_eq!(b_frames[2]["data"]["text"], "hi");
    }

    #[tokio::test]
    async fn test_write_origin_is_left_out_of_the_room() {
        let (mut db, a, b) = seeded_db();
        let registry = PresenceRegistry::new(16);
        let mut a_phone = registry.connect(a).await;
        let mut a_laptop = registry.connect(a).await;
        let mut b_conn = registry.connect(b).await;
        let room = RoomId::for_pair(a, b);
        for (user, conn) in [(a, a_phone.id), (a, a_laptop.id), (b, b_conn.id)] {
            registry.join_room(room.clone(), user, conn).await;
        }

        let sent = db.send_message(a, b, "hi").unwrap();
        let edited = db.edit_message(a, sent.message.id, "hello").unwrap();
        let origin = Some(a_phone.id);
        dispatch(
            &registry,
            DomainEvent::MessageSent {
                outcome: Box::new(sent.clone()),
                origin,
            },
        )
        .await;
        dispatch(
            &registry,
            DomainEvent::MessageEdited {
                outcome: Box::new(edited),
                origin,
            },
        )
        .await;
        let deleted = db.delete_messages(a, b, &[sent.message.id]).unwrap();
        dispatch(
            &registry,
            DomainEvent::MessagesDeleted {
                outcome: Box::new(deleted),
                origin,
            },
        )
        .await;

        let phone = types(&frames(&mut a_phone));
        assert!(phone.iter().all(|t| !t.starts_with("conversation.message")));
        assert!(phone.contains(&"feed.updated".to_string()));

        let laptop = types(&frames(&mut a_laptop));
        for expected in [
            "conversation.message",
            "conversation.message_edited",
            "conversation.messages_deleted",
        ] {
            assert!(laptop.contains(&expected.to_string()), "laptop missed {expected}");
        }
        let peer = types(&frames(&mut b_conn));
        assert!(peer.contains(&"conversation.message_edited".to_string()));
    }

    #[tokio::test]
    async fn test_presence_reaches_each_peer_connection() {
        let registry = PresenceRegistry::new(16);
        let user = UserId::new();
        let peer = UserId::new();
        let mut phone = registry.connect(peer).await;
        let mut laptop = registry.connect(peer).await;
        let origin = registry.connect(user).await;
        let room = RoomId::for_pair(user, peer);
        registry.join_room(room.clone(), peer, laptop.id).await;
        registry.join_room(room.clone(), user, origin.id).await;

        let delivered = dispatch(
            &registry,
            DomainEvent::PresenceChanged {
                user,
                presence: Presence::Offline,
                last_seen_at: Utc::now(),
                peers: vec![peer],
                origin: Some(origin.id),
            },
        )
        .await;

        assert_eq!(delivered, 3);
        assert_eq!(types(&frames(&mut phone)), vec!["feed.user_presence"]);
        assert_eq!(
            types(&frames(&mut laptop)),
            vec!["feed.user_presence", "conversation.presence"]
        );
    }

    #[tokio::test]
    async fn test_read_receipt_goes_to_author() {
        let (mut db, a, b) = seeded_db();
        let registry = PresenceRegistry::new(16);
        let mut a_conn = registry.connect(a).await;
        let mut b_conn = registry.connect(b).await;

        let sent = db.send_message(a, b, "hi").unwrap();
        let read = db.read_message(b, sent.message.id, a).unwrap();
        dispatch(&registry, DomainEvent::MessageRead(read)).await;

        assert_eq!(types(&frames(&mut a_conn)), vec!["conversation.message_read"]);
        assert!(frames(&mut b_conn).is_empty());
    }

    #[tokio::test]
    async fn test_publish_drops_when_queue_full() {
        let (tx, _rx) = mpsc::channel(1);
        let fanout = EventFanout { tx };
        let event = || DomainEvent::PresenceChanged {
            user: UserId::new(),
            presence: Presence::Online,
            last_seen_at: Utc::now(),
            peers: Vec::new(),
            origin: None,
        };

        assert!(fanout.publish(event()));
        assert!(!fanout.publish(event()));
    }

    #[tokio::test]
    async fn test_spawned_task_delivers() {
        let registry = Arc::new(PresenceRegistry::new(4));
        let user = UserId::new();
        let peer = UserId::new();
        let mut conn = registry.connect(peer).await;

        let (fanout, _task) = EventFanout::spawn(Arc::clone(&registry), 8);
        assert!(fanout.publish(DomainEvent::PresenceChanged {
            user,
            presence: Presence::Online,
            last_seen_at: Utc::now(),
            peers: vec![peer],
            origin: None,
        }));

        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), conn.receiver.recv())
            .await
            .unwrap();
        assert!(matches!(frame, Some(Outbound::Event(_))));
    }
}
