use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse a client-supplied identifier.
            pub fn parse(s: &str) -> Result<Self, IdError> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| IdError::Malformed {
                        kind: $kind,
                        value: s.to_string(),
                    })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

uuid_id!(
    /// Identity of a user, as resolved by the auth collaborator.
    UserId,
    "user"
);
uuid_id!(ConversationId, "conversation");
uuid_id!(GroupId, "group");
uuid_id!(MessageId, "message");
uuid_id!(FeedItemId, "feed item");
uuid_id!(
    /// One live transport connection (a device/tab of a user).
    ConnectionId,
    "connection"
);

// ---------------------------------------------------------------------------
// Message source
// ---------------------------------------------------------------------------

/// The aggregate a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageSource {
    Conversation(ConversationId),
    Group(GroupId),
}

impl MessageSource {
    pub fn kind(&self) -> FeedType {
        match self {
            MessageSource::Conversation(_) => FeedType::Conversation,
            MessageSource::Group(_) => FeedType::Group,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            MessageSource::Conversation(id) => id.0,
            MessageSource::Group(id) => id.0,
        }
    }

    /// Rebuild a source from its stored discriminator and id.
    pub fn from_parts(kind: FeedType, id: Uuid) -> Self {
        match kind {
            FeedType::Conversation => MessageSource::Conversation(ConversationId(id)),
            FeedType::Group => MessageSource::Group(GroupId(id)),
        }
    }
}

/// Discriminator shared by feed items and message sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedType {
    Conversation,
    Group,
}

impl FeedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedType::Conversation => "CONVERSATION",
            FeedType::Group => "GROUP",
        }
    }
}

impl FromStr for FeedType {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONVERSATION" => Ok(FeedType::Conversation),
            "GROUP" => Ok(FeedType::Group),
            other => Err(IdError::UnknownVariant {
                kind: "feed type",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Presence {
    Online,
    Away,
    #[default]
    Offline,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => "ONLINE",
            Presence::Away => "AWAY",
            Presence::Offline => "OFFLINE",
        }
    }
}

impl FromStr for Presence {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONLINE" => Ok(Presence::Online),
            "AWAY" => Ok(Presence::Away),
            "OFFLINE" => Ok(Presence::Offline),
            other => Err(IdError::UnknownVariant {
                kind: "presence",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantRole {
    Owner,
    Member,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Owner => "OWNER",
            ParticipantRole::Member => "MEMBER",
        }
    }
}

impl FromStr for ParticipantRole {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OWNER" => Ok(ParticipantRole::Owner),
            "MEMBER" => Ok(ParticipantRole::Member),
            other => Err(IdError::UnknownVariant {
                kind: "participant role",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

/// Logical broadcast channel joined by connections that are viewing a
/// specific conversation or group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl RoomId {
    /// Room for a participant pair. Argument order does not matter.
    pub fn for_pair(a: UserId, b: UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("conversation:{low}:{high}"))
    }

    pub fn for_group(group_id: GroupId) -> Self {
        Self(format!("group:{group_id}"))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_room_is_order_independent() {
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(RoomId::for_pair(a, b), RoomId::for_pair(b, a));
        assert_ne!(RoomId::for_pair(a, b), RoomId::for_pair(a, UserId::new()));
    }

    #[test]
    fn malformed_id_is_rejected() {
        let err = MessageId::parse("not-a-uuid").unwrap_err();
        assert!(matches!(err, IdError::Malformed { kind: "message", .. }));
    }

    #[test]
    fn message_source_serializes_as_tagged_union() {
        let id = GroupId::new();
        let json = serde_json::to_value(MessageSource::Group(id)).unwrap();
        assert_eq!(json["kind"], "GROUP");
        assert_eq!(json["id"], id.to_string());
    }

    #[test]
    fn presence_round_trips_through_storage_form() {
        for p in [Presence::Online, Presence::Away, Presence::Offline] {
            assert_eq!(p.as_str().parse::<Presence>().unwrap(), p);
        }
        assert!("BUSY".parse::<Presence>().is_err());
    }
}
