//! Denormalized snapshots handed to callers and pushed to live connections.
//!
//! These are read-side shapes: they embed enough of the sender, reply target
//! and aggregate that a client can render them without another request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ConversationId, FeedItemId, FeedType, GroupId, MessageId, MessageSource, ParticipantRole,
    UserId,
};

/// Public profile fields of a user, embedded wherever a user is referenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
    pub is_official: bool,
}

/// The message being replied to, as shown above a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplySnapshot {
    pub id: MessageId,
    pub text: String,
    pub sender: UserSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: MessageId,
    pub sender: UserSummary,
    pub text: String,
    pub source: MessageSource,
    pub reply_to: Option<ReplySnapshot>,
    pub replies: Vec<MessageId>,
    pub has_been_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub has_been_edited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Membership details of a group sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedItemView {
    #[serde(rename_all = "camelCase")]
    Conversation {
        id: ConversationId,
        recipient: UserSummary,
        last_message: Option<MessageView>,
        unread_count: u64,
    },
    #[serde(rename_all = "camelCase")]
    Group {
        id: GroupId,
        name: String,
        login: String,
        avatar: Option<String>,
        is_official: bool,
        last_message: Option<MessageView>,
    },
}

impl FeedItemView {
    pub fn last_message(&self) -> Option<&MessageView> {
        match self {
            FeedItemView::Conversation { last_message, .. } => last_message.as_ref(),
            FeedItemView::Group { last_message, .. } => last_message.as_ref(),
        }
    }
}

/// One row of a user's feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    pub id: FeedItemId,
    #[serde(rename = "type")]
    pub kind: FeedType,
    pub last_action_at: DateTime<Utc>,
    pub item: FeedItemView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub items: Vec<FeedEntry>,
    /// Cursor for the next page, present only when this page was full.
    pub next_cursor: Option<String>,
}

/// Feed entries matching a search, by page number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub items: Vec<FeedEntry>,
    pub page: u32,
    /// Next page number, present only when more matches exist.
    pub next_page: Option<u32>,
}

/// A group as seen by someone looking it up directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupLookup {
    pub group: FeedItemView,
    pub member_count: u64,
    /// The viewer's own membership, absent when viewing through an invite.
    pub membership: Option<ParticipantView>,
}
