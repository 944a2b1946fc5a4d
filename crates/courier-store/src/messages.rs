//! Message rows, the ordered message list of each aggregate, reply lists and
//! unread counters.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use courier_shared::types::{ConversationId, FeedType, MessageId, MessageSource, UserId};
use courier_shared::views::{MessageView, ReplySnapshot};

use crate::database::UnitOfWork;
use crate::error::{Result, StoreError};
use crate::models::Message;
use crate::sql::{enum_at, not_found, opt_ts_at, opt_uuid_at, ts, ts_at, uuid_at};

const MESSAGE_COLUMNS: &str = "m.id, m.sender_id, m.text, m.source_kind, m.source_id, m.reply_to,
                               m.has_been_read, m.read_at, m.has_been_edited,
                               m.created_at, m.updated_at";

impl UnitOfWork<'_> {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a message and append it to the tail of its source's list.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.execute(
            "INSERT INTO messages (id, sender_id, text, source_kind, source_id, reply_to,
                                   has_been_read, read_at, has_been_edited, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id.to_string(),
                message.sender_id.to_string(),
                message.text,
                message.source.kind().as_str(),
                message.source.id().to_string(),
                message.reply_to.map(|id| id.to_string()),
                message.has_been_read,
                message.read_at.as_ref().map(ts),
                message.has_been_edited,
                ts(&message.created_at),
                ts(&message.updated_at),
            ],
        )?;

        self.execute(
            "INSERT INTO source_messages (source_kind, source_id, message_id)
             VALUES (?1, ?2, ?3)",
            params![
                message.source.kind().as_str(),
                message.source.id().to_string(),
                message.id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Append `reply_id` to the reply list of `message_id`.
    pub fn add_reply(&self, message_id: MessageId, reply_id: MessageId) -> Result<()> {
        self.execute(
            "INSERT INTO message_replies (message_id, reply_id) VALUES (?1, ?2)",
            params![message_id.to_string(), reply_id.to_string()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1"),
            params![id.to_string()],
            row_to_message,
        )
        .map_err(not_found("Message"))
    }

    /// Reply ids of a message, oldest first.
    pub fn reply_ids(&self, id: MessageId) -> Result<Vec<MessageId>> {
        let mut stmt = self.prepare(
            "SELECT reply_id FROM message_replies WHERE message_id = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| {
            Ok(MessageId(uuid_at(row, 0)?))
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Ordered message ids of an aggregate, oldest first.
    pub fn source_message_ids(&self, source: MessageSource) -> Result<Vec<MessageId>> {
        let mut stmt = self.prepare(
            "SELECT message_id FROM source_messages
             WHERE source_kind = ?1 AND source_id = ?2
             ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(
            params![source.kind().as_str(), source.id().to_string()],
            |row| Ok(MessageId(uuid_at(row, 0)?)),
        )?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Whether `message_id` is in the aggregate's message list.
    pub fn source_contains(&self, source: MessageSource, message_id: MessageId) -> Result<bool> {
        let found = self.query_row(
            "SELECT EXISTS (
                 SELECT 1 FROM source_messages
                 WHERE source_kind = ?1 AND source_id = ?2 AND message_id = ?3
             )",
            params![
                source.kind().as_str(),
                source.id().to_string(),
                message_id.to_string()
            ],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    /// The last message of an aggregate's list, if any.
    pub fn source_tail(&self, source: MessageSource) -> Result<Option<Message>> {
        let message = self
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS}
                     FROM source_messages s JOIN messages m ON m.id = s.message_id
                     WHERE s.source_kind = ?1 AND s.source_id = ?2
                     ORDER BY s.position DESC
                     LIMIT 1"
                ),
                params![source.kind().as_str(), source.id().to_string()],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Of the requested ids, those that exist, were sent by `sender` and
    /// belong to `source`. Request order is kept; duplicates are dropped.
    pub fn owned_messages_in(
        &self,
        source: MessageSource,
        sender: UserId,
        ids: &[MessageId],
    ) -> Result<Vec<MessageId>> {
        let mut stmt = self.prepare(
            "SELECT EXISTS (
                 SELECT 1 FROM messages
                 WHERE id = ?1 AND sender_id = ?2 AND source_kind = ?3 AND source_id = ?4
             )",
        )?;

        let mut matched: Vec<MessageId> = Vec::new();
        for id in ids {
            if matched.contains(id) {
                continue;
            }
            let owned: bool = stmt.query_row(
                params![
                    id.to_string(),
                    sender.to_string(),
                    source.kind().as_str(),
                    source.id().to_string()
                ],
                |row| row.get(0),
            )?;
            if owned {
                matched.push(*id);
            }
        }
        Ok(matched)
    }

    /// Messages in a conversation not yet read by `viewer`, i.e. authored by
    /// the viewer's peer and still unread.
    pub fn unread_count(&self, conversation: ConversationId, viewer: UserId) -> Result<u64> {
        let count: i64 = self.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE source_kind = ?1 AND source_id = ?2
               AND sender_id != ?3 AND has_been_read = 0",
            params![
                FeedType::Conversation.as_str(),
                conversation.to_string(),
                viewer.to_string()
            ],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Render a message with sender summary, reply snapshot and reply list.
    pub fn message_view(&self, message: &Message) -> Result<MessageView> {
        let sender = self.user_summary(message.sender_id)?;

        let reply_to = match message.reply_to {
            Some(target_id) => {
                let target = self.get_message(target_id)?;
                Some(ReplySnapshot {
                    id: target.id,
                    text: target.text,
                    sender: self.user_summary(target.sender_id)?,
                })
            }
            None => None,
        };

        Ok(MessageView {
            id: message.id,
            sender,
            text: message.text.clone(),
            source: message.source,
            reply_to,
            replies: self.reply_ids(message.id)?,
            has_been_read: message.has_been_read,
            read_at: message.read_at,
            has_been_edited: message.has_been_edited,
            created_at: message.created_at,
            updated_at: message.updated_at,
        })
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Replace the text of a message sent by `sender`, only if it differs.
    /// Returns `false` when nothing matched.
    pub fn edit_message_text(
        &self,
        id: MessageId,
        sender: UserId,
        text: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.execute(
            "UPDATE messages SET text = ?1, has_been_edited = 1, updated_at = ?2
             WHERE id = ?3 AND sender_id = ?4 AND text != ?1",
            params![text, ts(&edited_at), id.to_string(), sender.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Mark a message read if it is still unread. Returns `false` otherwise.
    pub fn mark_read(&self, id: MessageId, read_at: DateTime<Utc>) -> Result<bool> {
        let affected = self.execute(
            "UPDATE messages SET has_been_read = 1, read_at = ?1
             WHERE id = ?2 AND has_been_read = 0",
            params![ts(&read_at), id.to_string()],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Remove ids from an aggregate's message list.
    pub fn pull_from_source(&self, source: MessageSource, ids: &[MessageId]) -> Result<usize> {
        let mut stmt = self.prepare(
            "DELETE FROM source_messages
             WHERE source_kind = ?1 AND source_id = ?2 AND message_id = ?3",
        )?;
        let mut removed = 0;
        for id in ids {
            removed += stmt.execute(params![
                source.kind().as_str(),
                source.id().to_string(),
                id.to_string()
            ])?;
        }
        Ok(removed)
    }

    /// Physically delete messages sent by `sender`. Replies pointing at them
    /// keep existing with `reply_to` cleared.
    pub fn delete_message_rows(&self, sender: UserId, ids: &[MessageId]) -> Result<usize> {
        let mut stmt = self.prepare("DELETE FROM messages WHERE id = ?1 AND sender_id = ?2")?;
        let mut deleted = 0;
        for id in ids {
            deleted += stmt.execute(params![id.to_string(), sender.to_string()])?;
        }
        if deleted != ids.len() {
            // The ids were matched inside this same unit; a shortfall means
            // the rows moved under us.
            return Err(StoreError::Conflict("Message"));
        }
        Ok(deleted)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let kind: FeedType = enum_at(row, 3)?;
    let source_id = uuid_at(row, 4)?;

    Ok(Message {
        id: MessageId(uuid_at(row, 0)?),
        sender_id: UserId(uuid_at(row, 1)?),
        text: row.get(2)?,
        source: MessageSource::from_parts(kind, source_id),
        reply_to: opt_uuid_at(row, 5)?.map(MessageId),
        has_been_read: row.get(6)?,
        read_at: opt_ts_at(row, 7)?,
        has_been_edited: row.get(8)?,
        created_at: ts_at(row, 9)?,
        updated_at: ts_at(row, 10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::{sql, Database};

    #[test]
    fn source_list_keeps_insertion_order() {
        let mut db = Database::open_in_memory().unwrap();
        let uow = db.begin().unwrap();
        let a = User::new("A", "a@example.com");
        let b = User::new("B", "b@example.com");
        uow.insert_user(&a).unwrap();
        uow.insert_user(&b).unwrap();
        let conversation = uow.create_conversation(a.id, b.id, sql::now()).unwrap();
        let source = MessageSource::Conversation(conversation.id);

        let ids: Vec<MessageId> = ["one", "two", "three"]
            .iter()
            .map(|text| {
                let message = Message::new(a.id, text.to_string(), source, None, sql::now());
                uow.insert_message(&message).unwrap();
                message.id
            })
            .collect();

        assert_eq!(uow.source_message_ids(source).unwrap(), ids);
        assert_eq!(uow.source_tail(source).unwrap().unwrap().id, ids[2]);
        assert_eq!(uow.unread_count(conversation.id, b.id).unwrap(), 3);
        assert_eq!(uow.unread_count(conversation.id, a.id).unwrap(), 0);

        assert_eq!(uow.pull_from_source(source, &[ids[2]]).unwrap(), 1);
        assert_eq!(uow.source_tail(source).unwrap().unwrap().id, ids[1]);
        assert!(!uow.source_contains(source, ids[2]).unwrap());
        assert!(uow.source_contains(source, ids[0]).unwrap());
    }
}
