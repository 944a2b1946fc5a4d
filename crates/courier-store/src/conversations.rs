//! Two-party conversation aggregate.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use courier_shared::types::{ConversationId, MessageId, UserId};

use crate::database::UnitOfWork;
use crate::error::{Result, StoreError};
use crate::models::{ordered_pair, Conversation};
use crate::sql::{not_found, opt_ts_at, opt_uuid_at, ts, ts_at, uuid_at};

const CONVERSATION_COLUMNS: &str = "id, participant_low, participant_high, last_message_id,
                                    last_message_sent_at, version, created_at";

impl UnitOfWork<'_> {
    /// Create the conversation for an unordered pair.
    pub fn create_conversation(
        &self,
        a: UserId,
        b: UserId,
        created_at: DateTime<Utc>,
    ) -> Result<Conversation> {
        if a == b {
            return Err(StoreError::InvalidArgument(
                "a conversation needs two distinct participants".into(),
            ));
        }
        let (low, high) = ordered_pair(a, b);
        let conversation = Conversation {
            id: ConversationId::new(),
            participant_low: low,
            participant_high: high,
            last_message_id: None,
            last_message_sent_at: None,
            version: 0,
            created_at,
        };

        self.execute(
            "INSERT INTO conversations (id, participant_low, participant_high, version, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![
                conversation.id.to_string(),
                low.to_string(),
                high.to_string(),
                ts(&created_at),
            ],
        )?;

        tracing::debug!(conversation = %conversation.id, "conversation created");
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id.to_string()],
            row_to_conversation,
        )
        .map_err(not_found("Conversation"))
    }

    /// Look up the conversation between two users, in either order.
    pub fn find_conversation_by_pair(&self, a: UserId, b: UserId) -> Result<Option<Conversation>> {
        let (low, high) = ordered_pair(a, b);
        let conversation = self
            .query_row(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE participant_low = ?1 AND participant_high = ?2"
                ),
                params![low.to_string(), high.to_string()],
                row_to_conversation,
            )
            .optional()?;
        Ok(conversation)
    }

    /// Every user that shares a conversation with `user`.
    pub fn conversation_peers(&self, user: UserId) -> Result<Vec<UserId>> {
        let mut stmt = self.prepare(
            "SELECT participant_high FROM conversations WHERE participant_low = ?1
             UNION
             SELECT participant_low FROM conversations WHERE participant_high = ?1",
        )?;
        let rows = stmt.query_map(params![user.to_string()], |row| Ok(UserId(uuid_at(row, 0)?)))?;

        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }

    /// Compare-and-set the last-message pointer. `conversation` is the
    /// snapshot read earlier in the unit; if its version no longer matches
    /// the row, [`StoreError::Conflict`] is returned and nothing is written.
    ///
    /// On success the snapshot is updated in place.
    pub fn set_conversation_last(
        &self,
        conversation: &mut Conversation,
        last_message_id: Option<MessageId>,
        last_message_sent_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let affected = self.execute(
            "UPDATE conversations
             SET last_message_id = ?1, last_message_sent_at = ?2, version = version + 1
             WHERE id = ?3 AND version = ?4",
            params![
                last_message_id.map(|id| id.to_string()),
                last_message_sent_at.as_ref().map(ts),
                conversation.id.to_string(),
                conversation.version,
            ],
        )?;
        if affected == 0 {
            tracing::warn!(conversation = %conversation.id, version = conversation.version, "stale conversation version");
            return Err(StoreError::Conflict("Conversation"));
        }

        conversation.last_message_id = last_message_id;
        conversation.last_message_sent_at = last_message_sent_at;
        conversation.version += 1;
        Ok(())
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: ConversationId(uuid_at(row, 0)?),
        participant_low: UserId(uuid_at(row, 1)?),
        participant_high: UserId(uuid_at(row, 2)?),
        last_message_id: opt_uuid_at(row, 3)?.map(MessageId),
        last_message_sent_at: opt_ts_at(row, 4)?,
        version: row.get(5)?,
        created_at: ts_at(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::{sql, Database};

    fn two_users(uow: &UnitOfWork<'_>) -> (User, User) {
        let a = User::new("A", "a@example.com");
        let b = User::new("B", "b@example.com");
        uow.insert_user(&a).unwrap();
        uow.insert_user(&b).unwrap();
        (a, b)
    }

    #[test]
    fn pair_lookup_ignores_order() {
        let mut db = Database::open_in_memory().unwrap();
        let uow = db.begin().unwrap();
        let (a, b) = two_users(&uow);

        let created = uow.create_conversation(b.id, a.id, sql::now()).unwrap();
        let found = uow.find_conversation_by_pair(a.id, b.id).unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(uow.conversation_peers(a.id).unwrap(), vec![b.id]);
    }

    #[test]
    fn duplicate_pair_is_rejected() {
        let mut db = Database::open_in_memory().unwrap();
        let uow = db.begin().unwrap();
        let (a, b) = two_users(&uow);

        uow.create_conversation(a.id, b.id, sql::now()).unwrap();
        assert!(matches!(
            uow.create_conversation(b.id, a.id, sql::now()),
            Err(StoreError::Sqlite(_))
        ));
    }

    #[test]
    fn stale_version_conflicts() {
        let mut db = Database::open_in_memory().unwrap();
        let uow = db.begin().unwrap();
        let (a, b) = two_users(&uow);

        let mut fresh = uow.create_conversation(a.id, b.id, sql::now()).unwrap();
        let mut stale = fresh.clone();

        uow.set_conversation_last(&mut fresh, None, Some(sql::now()))
            .unwrap();
        assert_eq!(fresh.version, 1);

        assert!(matches!(
            uow.set_conversation_last(&mut stale, None, None),
            Err(StoreError::Conflict("Conversation"))
        ));
        assert_eq!(stale.version, 0);
    }
}
