//! Domain model structs persisted in the SQLite database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_shared::types::{
    ConversationId, FeedItemId, FeedType, GroupId, MessageId, MessageSource, ParticipantRole,
    Presence, UserId,
};
use courier_shared::views::{ParticipantView, UserSummary};

use crate::sql;

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A user as held by the directory collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
    pub is_official: bool,
    /// Private users cannot be messaged unless a conversation already exists.
    pub is_private: bool,
    pub is_deleted: bool,
    pub presence: Presence,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// A fresh, public, offline user.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            name: name.into(),
            email: email.into(),
            avatar: None,
            is_official: false,
            is_private: false,
            is_deleted: false,
            presence: Presence::Offline,
            last_seen_at: None,
            created_at: sql::now(),
        }
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            name: self.name.clone(),
            email: self.email.clone(),
            avatar: self.avatar.clone(),
            is_official: self.is_official,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Two-party aggregate. The participant pair is stored ordered so that the
/// unordered pair is a unique key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_low: UserId,
    pub participant_high: UserId,
    pub last_message_id: Option<MessageId>,
    pub last_message_sent_at: Option<DateTime<Utc>>,
    /// Bumped by every aggregate write; guards compare-and-set updates.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user: UserId) -> bool {
        self.participant_low == user || self.participant_high == user
    }

    /// The other participant, or `None` if `user` is not in the pair.
    pub fn peer_of(&self, user: UserId) -> Option<UserId> {
        if self.participant_low == user {
            Some(self.participant_high)
        } else if self.participant_high == user {
            Some(self.participant_low)
        } else {
            None
        }
    }
}

/// Order a pair the way conversations store it.
pub fn ordered_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    /// Unique handle used in invite links.
    pub login: String,
    pub avatar: Option<String>,
    pub is_official: bool,
    pub last_message_id: Option<MessageId>,
    pub last_message_sent_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Membership of a user in a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn view(&self) -> ParticipantView {
        ParticipantView {
            role: self.role,
            joined_at: self.joined_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub text: String,
    pub source: MessageSource,
    /// Always a message of the same `source`.
    pub reply_to: Option<MessageId>,
    pub has_been_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub has_been_edited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender_id: UserId,
        text: String,
        source: MessageSource,
        reply_to: Option<MessageId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender_id,
            text,
            source,
            reply_to,
            has_been_read: false,
            read_at: None,
            has_been_edited: false,
            created_at,
            updated_at: created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

/// Denormalized activity row; exactly one per (item, kind).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedItem {
    pub id: FeedItemId,
    pub kind: FeedType,
    pub item_id: Uuid,
    pub last_action_at: DateTime<Utc>,
}

impl FeedItem {
    pub fn new(kind: FeedType, item_id: Uuid, last_action_at: DateTime<Utc>) -> Self {
        Self {
            id: FeedItemId::new(),
            kind,
            item_id,
            last_action_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_of_returns_the_other_side() {
        let (low, high) = ordered_pair(UserId::new(), UserId::new());
        let conversation = Conversation {
            id: ConversationId::new(),
            participant_low: low,
            participant_high: high,
            last_message_id: None,
            last_message_sent_at: None,
            version: 0,
            created_at: sql::now(),
        };
        assert_eq!(conversation.peer_of(low), Some(high));
        assert_eq!(conversation.peer_of(high), Some(low));
        assert_eq!(conversation.peer_of(UserId::new()), None);
    }

    #[test]
    fn ordered_pair_is_symmetric() {
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(ordered_pair(a, b), ordered_pair(b, a));
    }
}
