//! Message engine: every write touching a message, its aggregate and the
//! feed runs here as one unit of work.
//!
//! Each operation follows the same shape: restriction check, locate and
//! validate the aggregate, mutate message + aggregate + feed item inside a
//! single `BEGIN IMMEDIATE` transaction, then return a payload carrying
//! enough denormalized context to notify every affected user without a
//! second read. Any `?` before `commit` rolls the whole unit back.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use courier_shared::constants::{
    MAX_GROUP_LOGIN_LENGTH, MAX_GROUP_NAME_LENGTH, MAX_MESSAGE_LENGTH, MIN_GROUP_LOGIN_LENGTH,
};
use courier_shared::types::{
    ConversationId, FeedType, GroupId, MessageId, MessageSource, ParticipantRole, Presence, UserId,
};
use courier_shared::views::{
    FeedEntry, FeedItemView, FeedPage, GroupLookup, MessageView, ParticipantView, SearchPage,
};

use crate::database::{Database, UnitOfWork};
use crate::error::{Result, StoreError};
use crate::models::{Conversation, FeedItem, Group, Message, Participant, User};
use crate::sql;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A conversation feed item rendered for each of its two participants.
#[derive(Debug, Clone)]
pub struct PairFeed {
    pub initiator_id: UserId,
    pub initiator: FeedEntry,
    pub recipient_id: UserId,
    pub recipient: FeedEntry,
}

impl PairFeed {
    pub fn entry_for(&self, user: UserId) -> Option<&FeedEntry> {
        if user == self.initiator_id {
            Some(&self.initiator)
        } else if user == self.recipient_id {
            Some(&self.recipient)
        } else {
            None
        }
    }

    /// Unread count as seen by `user`.
    pub fn unread_for(&self, user: UserId) -> Option<u64> {
        match self.entry_for(user)?.item {
            FeedItemView::Conversation { unread_count, .. } => Some(unread_count),
            FeedItemView::Group { .. } => None,
        }
    }

    pub fn participants(&self) -> [UserId; 2] {
        [self.initiator_id, self.recipient_id]
    }
}

/// Result of `send_message` and `reply_to_message`.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub conversation_id: ConversationId,
    pub message: MessageView,
    pub is_new_conversation: bool,
    pub feed: PairFeed,
}

#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub message: MessageView,
    pub source: MessageSource,
    pub is_last_message: bool,
    /// Conversation peer to notify; `None` for group messages.
    pub peer: Option<UserId>,
    /// Refreshed previews, present when the edited message is the
    /// conversation's last one.
    pub feed: Option<PairFeed>,
}

#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub reader_id: UserId,
    pub author_id: UserId,
    pub read_at: DateTime<Utc>,
    /// The reader's unread count after this read.
    pub unread_count: u64,
}

#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
    /// Whether the last-message pointer moved.
    pub is_last_message: bool,
    pub last_message: Option<MessageView>,
    pub last_message_sent_at: DateTime<Utc>,
    pub feed: PairFeed,
}

#[derive(Debug, Clone)]
pub struct GroupSendOutcome {
    pub group_id: GroupId,
    pub message: MessageView,
    pub sender_role: ParticipantView,
    pub entry: FeedEntry,
    pub members: Vec<UserId>,
}

#[derive(Debug, Clone)]
pub struct GroupCreated {
    pub group: Group,
    pub owner: Participant,
    pub entry: FeedEntry,
}

#[derive(Debug, Clone)]
pub struct GroupJoined {
    pub participant: Participant,
    /// `false` when the user already was a member.
    pub newly_joined: bool,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Trim message text and enforce its length bounds.
pub fn normalize_text(raw: &str) -> Result<String> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(StoreError::InvalidArgument("message text is empty".into()));
    }
    if text.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(StoreError::InvalidArgument(format!(
            "message text exceeds {MAX_MESSAGE_LENGTH} characters"
        )));
    }
    Ok(text.to_string())
}

fn normalize_group_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    let len = name.chars().count();
    if len == 0 || len > MAX_GROUP_NAME_LENGTH {
        return Err(StoreError::InvalidArgument(format!(
            "group name must be 1 to {MAX_GROUP_NAME_LENGTH} characters"
        )));
    }
    Ok(name.to_string())
}

/// Logins are lowercased and limited to ASCII letters, digits and `_`.
fn normalize_group_login(raw: &str) -> Result<String> {
    let login = raw.trim().to_ascii_lowercase();
    let valid_chars = login
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_chars || !(MIN_GROUP_LOGIN_LENGTH..=MAX_GROUP_LOGIN_LENGTH).contains(&login.len()) {
        return Err(StoreError::InvalidArgument(format!(
            "group login must be {MIN_GROUP_LOGIN_LENGTH} to {MAX_GROUP_LOGIN_LENGTH} of [a-z0-9_]"
        )));
    }
    Ok(login)
}

fn distinct_pair(initiator: UserId, recipient: UserId) -> Result<()> {
    if initiator == recipient {
        return Err(StoreError::InvalidArgument(
            "cannot message yourself".into(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl Database {
    /// Send a message to `recipient`, creating the conversation and its
    /// feed item on first contact.
    pub fn send_message(
        &mut self,
        initiator: UserId,
        recipient: UserId,
        text: &str,
    ) -> Result<SendOutcome> {
        let text = normalize_text(text)?;
        distinct_pair(initiator, recipient)?;

        let uow = self.begin()?;
        uow.ensure_not_restricted(initiator, recipient)?;
        uow.get_active_user(initiator)?;
        let recipient_user = uow.get_active_user(recipient)?;
        let now = sql::now();

        let (mut conversation, is_new_conversation) =
            match uow.find_conversation_by_pair(initiator, recipient)? {
                Some(conversation) => (conversation, false),
                None if recipient_user.is_private => {
                    debug!(%recipient, "private recipient without conversation");
                    return Err(StoreError::NotFound("User"));
                }
                None => (uow.create_conversation(initiator, recipient, now)?, true),
            };

        let message = Message::new(
            initiator,
            text,
            MessageSource::Conversation(conversation.id),
            None,
            now,
        );
        uow.insert_message(&message)?;
        uow.set_conversation_last(&mut conversation, Some(message.id), Some(now))?;

        let item = upsert_conversation_item(&uow, &conversation, now)?;
        let feed = pair_feed(&uow, &item, initiator, recipient)?;
        let view = uow.message_view(&message)?;
        uow.commit()?;

        info!(
            conversation = %conversation.id,
            message = %message.id,
            new = is_new_conversation,
            "message sent"
        );
        Ok(SendOutcome {
            conversation_id: conversation.id,
            message: view,
            is_new_conversation,
            feed,
        })
    }

    /// Reply to `message_id` inside the conversation with `recipient`.
    pub fn reply_to_message(
        &mut self,
        initiator: UserId,
        recipient: UserId,
        message_id: MessageId,
        text: &str,
    ) -> Result<SendOutcome> {
        let text = normalize_text(text)?;
        distinct_pair(initiator, recipient)?;

        let uow = self.begin()?;
        uow.ensure_not_restricted(initiator, recipient)?;
        uow.get_active_user(initiator)?;
        uow.get_active_user(recipient)?;

        let target = uow.get_message(message_id)?;
        let mut conversation = uow
            .find_conversation_by_pair(initiator, recipient)?
            .ok_or(StoreError::NotFound("Conversation"))?;
        let source = MessageSource::Conversation(conversation.id);
        if target.source != source || !uow.source_contains(source, target.id)? {
            return Err(StoreError::NotFound("Message"));
        }

        let now = sql::now();
        let reply = Message::new(initiator, text, source, Some(target.id), now);
        uow.insert_message(&reply)?;
        uow.add_reply(target.id, reply.id)?;
        uow.set_conversation_last(&mut conversation, Some(reply.id), Some(now))?;

        let item = uow.touch_feed_item(FeedType::Conversation, conversation.id.0, now)?;
        let feed = pair_feed(&uow, &item, initiator, recipient)?;
        let view = uow.message_view(&reply)?;
        uow.commit()?;

        info!(conversation = %conversation.id, message = %reply.id, reply_to = %target.id, "reply sent");
        Ok(SendOutcome {
            conversation_id: conversation.id,
            message: view,
            is_new_conversation: false,
            feed,
        })
    }

    /// Replace the text of one of the initiator's messages.
    pub fn edit_message(
        &mut self,
        initiator: UserId,
        message_id: MessageId,
        text: &str,
    ) -> Result<EditOutcome> {
        let text = normalize_text(text)?;

        let uow = self.begin()?;
        let now = sql::now();
        if !uow.edit_message_text(message_id, initiator, &text, now)? {
            return Err(StoreError::Forbidden("message cannot be edited"));
        }
        let message = uow.get_message(message_id)?;

        let (is_last_message, peer, feed) = match message.source {
            MessageSource::Conversation(id) => {
                let conversation = uow.get_conversation(id)?;
                let is_last = conversation.last_message_id == Some(message.id);
                let peer = conversation.peer_of(initiator);
                let feed = match (is_last, peer) {
                    (true, Some(peer)) => {
                        let item = uow.get_feed_item(FeedType::Conversation, id.0)?;
                        Some(pair_feed(&uow, &item, initiator, peer)?)
                    }
                    _ => None,
                };
                (is_last, peer, feed)
            }
            MessageSource::Group(id) => {
                let group = uow.get_group(id)?;
                (group.last_message_id == Some(message.id), None, None)
            }
        };

        let view = uow.message_view(&message)?;
        uow.commit()?;

        debug!(message = %message_id, "message edited");
        Ok(EditOutcome {
            message: view,
            source: message.source,
            is_last_message,
            peer,
            feed,
        })
    }

    /// Mark one unread message authored by `recipient` as read by
    /// `initiator`.
    pub fn read_message(
        &mut self,
        initiator: UserId,
        message_id: MessageId,
        recipient: UserId,
    ) -> Result<ReadOutcome> {
        distinct_pair(initiator, recipient)?;

        let uow = self.begin()?;
        let conversation = uow
            .find_conversation_by_pair(initiator, recipient)?
            .ok_or(StoreError::NotFound("Message"))?;

        let message = uow.get_message(message_id)?;
        let in_conversation = message.source == MessageSource::Conversation(conversation.id);
        if !in_conversation || message.sender_id != recipient {
            return Err(StoreError::NotFound("Message"));
        }

        let read_at = sql::now();
        if !uow.mark_read(message_id, read_at)? {
            return Err(StoreError::NotFound("Message"));
        }
        let unread_count = uow.unread_count(conversation.id, initiator)?;
        uow.commit()?;

        debug!(conversation = %conversation.id, message = %message_id, "message read");
        Ok(ReadOutcome {
            conversation_id: conversation.id,
            message_id,
            reader_id: initiator,
            author_id: recipient,
            read_at,
            unread_count,
        })
    }

    /// Delete the initiator's messages from the conversation with
    /// `recipient`. Ids that do not exist, are not owned by the initiator or
    /// live elsewhere are ignored; if none remain the call fails.
    pub fn delete_messages(
        &mut self,
        initiator: UserId,
        recipient: UserId,
        message_ids: &[MessageId],
    ) -> Result<DeleteOutcome> {
        distinct_pair(initiator, recipient)?;

        let uow = self.begin()?;
        let mut conversation = uow
            .find_conversation_by_pair(initiator, recipient)?
            .ok_or(StoreError::NotFound("Conversation"))?;
        let source = MessageSource::Conversation(conversation.id);

        let matched = uow.owned_messages_in(source, initiator, message_ids)?;
        if matched.is_empty() {
            return Err(StoreError::NotFound("Message"));
        }

        uow.pull_from_source(source, &matched)?;

        let last_deleted = conversation
            .last_message_id
            .is_some_and(|last| matched.contains(&last));

        let (last_id, last_message_sent_at) = if last_deleted {
            let tail = uow.source_tail(source)?;
            let sent_at = tail
                .as_ref()
                .map(|m| m.created_at)
                .unwrap_or(conversation.created_at);
            let tail_id = tail.map(|m| m.id);
            uow.set_conversation_last(&mut conversation, tail_id, Some(sent_at))?;
            (tail_id, sent_at)
        } else {
            let last_id = conversation.last_message_id;
            let sent_at = conversation
                .last_message_sent_at
                .unwrap_or(conversation.created_at);
            let last_sent = conversation.last_message_sent_at;
            // The list changed even if the pointer did not.
            uow.set_conversation_last(&mut conversation, last_id, last_sent)?;
            (last_id, sent_at)
        };

        uow.delete_message_rows(initiator, &matched)?;

        // Read the last message back only now: a reply to a deleted message
        // has just lost its `reply_to`.
        let last_message = match last_id {
            Some(id) => Some(uow.message_view(&uow.get_message(id)?)?),
            None => None,
        };

        let item = if last_deleted {
            uow.touch_feed_item(FeedType::Conversation, conversation.id.0, last_message_sent_at)?
        } else {
            uow.get_feed_item(FeedType::Conversation, conversation.id.0)?
        };
        let feed = pair_feed(&uow, &item, initiator, recipient)?;
        uow.commit()?;

        info!(
            conversation = %conversation.id,
            deleted = matched.len(),
            last_changed = last_deleted,
            "messages deleted"
        );
        Ok(DeleteOutcome {
            conversation_id: conversation.id,
            message_ids: matched,
            is_last_message: last_deleted,
            last_message,
            last_message_sent_at,
            feed,
        })
    }

    /// Post a message to a group the initiator is a member of.
    pub fn send_group_message(
        &mut self,
        initiator: UserId,
        group_id: GroupId,
        text: &str,
    ) -> Result<GroupSendOutcome> {
        let text = normalize_text(text)?;

        let uow = self.begin()?;
        let mut group = uow.get_group(group_id)?;
        let participant = uow
            .find_participant(group_id, initiator)?
            .ok_or(StoreError::Forbidden("not a member of this group"))?;

        let now = sql::now();
        let message = Message::new(initiator, text, MessageSource::Group(group_id), None, now);
        uow.insert_message(&message)?;
        uow.set_group_last(&mut group, Some(message.id), Some(now))?;

        let item = uow.touch_feed_item(FeedType::Group, group_id.0, now)?;
        let entry = uow.feed_entry(&item, initiator)?;
        let members = uow.group_member_ids(group_id)?;
        let view = uow.message_view(&message)?;
        uow.commit()?;

        info!(group = %group_id, message = %message.id, "group message sent");
        Ok(GroupSendOutcome {
            group_id,
            message: view,
            sender_role: participant.view(),
            entry,
            members,
        })
    }

    /// Create a group owned by `initiator`, with its feed item.
    pub fn create_group(
        &mut self,
        initiator: UserId,
        name: &str,
        login: &str,
    ) -> Result<GroupCreated> {
        let name = normalize_group_name(name)?;
        let login = normalize_group_login(login)?;

        let uow = self.begin()?;
        uow.get_active_user(initiator)?;
        let now = sql::now();

        let group = Group {
            id: GroupId::new(),
            name,
            login,
            avatar: None,
            is_official: false,
            last_message_id: None,
            last_message_sent_at: None,
            version: 0,
            created_at: now,
        };
        uow.insert_group(&group)?;

        let owner = Participant {
            group_id: group.id,
            user_id: initiator,
            role: ParticipantRole::Owner,
            joined_at: now,
        };
        uow.add_participant(&owner)?;

        let item = FeedItem::new(FeedType::Group, group.id.0, now);
        uow.insert_feed_item(&item, &[])?;
        let entry = uow.feed_entry(&item, initiator)?;
        uow.commit()?;

        info!(group = %group.id, login = %group.login, "group created");
        Ok(GroupCreated { group, owner, entry })
    }

    /// Add `user` to a group as a member. Joining twice is a no-op.
    pub fn join_group(&mut self, user: UserId, group_id: GroupId) -> Result<GroupJoined> {
        let uow = self.begin()?;
        uow.get_active_user(user)?;
        uow.get_group(group_id)?;

        let candidate = Participant {
            group_id,
            user_id: user,
            role: ParticipantRole::Member,
            joined_at: sql::now(),
        };
        let newly_joined = uow.add_participant(&candidate)?;
        let participant = uow
            .find_participant(group_id, user)?
            .ok_or(StoreError::NotFound("Participant"))?;
        uow.commit()?;

        if newly_joined {
            debug!(group = %group_id, %user, "joined group");
        }
        Ok(GroupJoined {
            participant,
            newly_joined,
        })
    }

    /// One page of `viewer`'s feed, read from a consistent snapshot.
    pub fn get_feed(&mut self, viewer: UserId, cursor: Option<&str>) -> Result<FeedPage> {
        let uow = self.begin_read()?;
        uow.feed_page(viewer, cursor)
    }

    /// Search `viewer`'s feed by peer or group name.
    pub fn search_feed(&mut self, viewer: UserId, query: &str, page: u32) -> Result<SearchPage> {
        let uow = self.begin_read()?;
        uow.get_active_user(viewer)?;
        uow.search_feed(viewer, query, page)
    }

    /// Look a group up by id. Members always see it; anyone else needs an
    /// invite naming the group's login.
    pub fn lookup_group(
        &mut self,
        viewer: UserId,
        group_id: GroupId,
        invite: Option<&str>,
    ) -> Result<GroupLookup> {
        let uow = self.begin_read()?;
        uow.get_active_user(viewer)?;
        let group = uow.get_group(group_id)?;
        let membership = uow.find_participant(group_id, viewer)?;

        if membership.is_none() {
            let invited = invite
                .map(|code| code.trim().eq_ignore_ascii_case(&group.login))
                .unwrap_or(false);
            if !invited {
                return Err(StoreError::Forbidden("not a member of this group"));
            }
        }

        Ok(GroupLookup {
            member_count: uow.group_member_ids(group_id)?.len() as u64,
            group: uow.group_item_view(&group)?,
            membership: membership.map(|p| p.view()),
        })
    }

    /// Load a user that may open a live connection.
    pub fn active_user(&mut self, id: UserId) -> Result<User> {
        let uow = self.begin_read()?;
        let user = uow.get_active_user(id)?;
        Ok(user)
    }

    pub fn is_group_member(&mut self, group: GroupId, user: UserId) -> Result<bool> {
        let uow = self.begin_read()?;
        let found = uow.find_participant(group, user)?;
        Ok(found.is_some())
    }

    /// Persist a presence change and return every conversation peer of the
    /// user, for fanout.
    pub fn persist_presence(
        &mut self,
        user: UserId,
        presence: Presence,
        last_seen_at: DateTime<Utc>,
    ) -> Result<Vec<UserId>> {
        let uow = self.begin()?;
        uow.set_user_presence(user, presence, last_seen_at)?;
        let peers = uow.conversation_peers(user)?;
        uow.commit()?;
        Ok(peers)
    }
}

/// Bump the conversation's feed item, creating it if it does not exist yet.
fn upsert_conversation_item(
    uow: &UnitOfWork<'_>,
    conversation: &Conversation,
    at: DateTime<Utc>,
) -> Result<FeedItem> {
    match uow.find_feed_item(FeedType::Conversation, conversation.id.0)? {
        Some(_) => uow.touch_feed_item(FeedType::Conversation, conversation.id.0, at),
        None => {
            let item = FeedItem::new(FeedType::Conversation, conversation.id.0, at);
            uow.insert_feed_item(
                &item,
                &[conversation.participant_low, conversation.participant_high],
            )?;
            Ok(item)
        }
    }
}

fn pair_feed(
    uow: &UnitOfWork<'_>,
    item: &FeedItem,
    initiator: UserId,
    recipient: UserId,
) -> Result<PairFeed> {
    Ok(PairFeed {
        initiator_id: initiator,
        initiator: uow.feed_entry(item, initiator)?,
        recipient_id: recipient,
        recipient: uow.feed_entry(item, recipient)?,
    })
}
