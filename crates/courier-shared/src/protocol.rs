use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ConnectionId, ConversationId, GroupId, MessageId, MessageSource, Presence, UserId,
};
use crate::views::{FeedEntry, MessageView};

/// Events pushed from the server to live connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// First frame on every connection. The id goes back in the session
    /// header of writes made from this connection.
    #[serde(rename = "session.ready")]
    SessionReady(SessionReady),

    /// A conversation appeared in the recipient's feed for the first time.
    #[serde(rename = "conversation.created")]
    ConversationCreated(ConversationCreated),

    /// A feed row changed (new message, preview refresh after edit/delete).
    #[serde(rename = "feed.updated")]
    FeedUpdated(FeedUpdated),

    /// A conversation peer changed presence.
    #[serde(rename = "feed.user_presence")]
    UserPresence(UserPresence),

    /// New message for connections currently viewing the conversation.
    #[serde(rename = "conversation.message")]
    ConversationMessage(MessageView),

    #[serde(rename = "conversation.message_edited")]
    MessageEdited(MessageEdited),

    #[serde(rename = "conversation.message_read")]
    MessageRead(MessageRead),

    #[serde(rename = "conversation.messages_deleted")]
    MessagesDeleted(MessagesDeleted),

    /// Presence update scoped to one open conversation.
    #[serde(rename = "conversation.presence")]
    ConversationPresence(ConversationPresence),

    /// New message for connections currently viewing the group.
    #[serde(rename = "group.message")]
    GroupMessage(MessageView),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReady {
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCreated {
    pub conversation_id: ConversationId,
    pub initiator_id: UserId,
    pub recipient_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedUpdated {
    pub entry: FeedEntry,
    /// Unread count from the point of view of the receiving user.
    pub unread_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub recipient_id: UserId,
    pub presence: Presence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPresence {
    pub presence: Presence,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEdited {
    pub message: MessageView,
    pub source: MessageSource,
    pub is_last_message: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRead {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesDeleted {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
    pub is_last_message: bool,
    pub last_message: Option<MessageView>,
    pub last_message_sent_at: DateTime<Utc>,
    pub unread_count: u64,
}

/// Frames sent by a client over its live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    Presence {
        presence: Presence,
        #[serde(default)]
        last_seen_at: Option<DateTime<Utc>>,
    },
    #[serde(rename_all = "camelCase")]
    JoinConversation { recipient_id: UserId },
    #[serde(rename_all = "camelCase")]
    LeaveConversation { recipient_id: UserId },
    #[serde(rename_all = "camelCase")]
    JoinGroup { group_id: GroupId },
    #[serde(rename_all = "camelCase")]
    LeaveGroup { group_id: GroupId },
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ClientEvent {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_event_uses_dotted_type_names() {
        let event = ServerEvent::UserPresence(UserPresence {
            recipient_id: UserId::new(),
            presence: Presence::Offline,
        });
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "feed.user_presence");
        assert_eq!(json["data"]["presence"], "OFFLINE");
    }

    #[test]
    fn session_ready_carries_connection_id() {
        let id = ConnectionId::new();
        let event = ServerEvent::SessionReady(SessionReady { connection_id: id });
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "session.ready");
        assert_eq!(json["data"]["connectionId"], id.to_string());
    }

    #[test]
    fn client_presence_frame_parses_without_timestamp() {
        let event = ClientEvent::from_json(r#"{"type":"presence","data":{"presence":"ONLINE"}}"#)
            .unwrap();
        assert_eq!(
            event,
            ClientEvent::Presence {
                presence: Presence::Online,
                last_seen_at: None
            }
        );
    }

    #[test]
    fn client_join_frame_requires_valid_id() {
        assert!(ClientEvent::from_json(
            r#"{"type":"join_conversation","data":{"recipientId":"nope"}}"#
        )
        .is_err());
    }
}
