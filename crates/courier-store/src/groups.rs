//! Group aggregate and membership.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use courier_shared::types::{GroupId, MessageId, ParticipantRole, UserId};

use crate::database::UnitOfWork;
use crate::error::{Result, StoreError};
use crate::models::{Group, Participant};
use crate::sql::{enum_at, not_found, opt_ts_at, opt_uuid_at, ts, ts_at, uuid_at};

const GROUP_COLUMNS: &str = "id, name, login, avatar, is_official, last_message_id,
                             last_message_sent_at, version, created_at";

impl UnitOfWork<'_> {
    pub fn insert_group(&self, group: &Group) -> Result<()> {
        if self.group_login_taken(&group.login)? {
            return Err(StoreError::InvalidArgument(format!(
                "group login '{}' is taken",
                group.login
            )));
        }

        self.execute(
            "INSERT INTO chat_groups (id, name, login, avatar, is_official, last_message_id,
                                      last_message_sent_at, version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                group.id.to_string(),
                group.name,
                group.login,
                group.avatar,
                group.is_official,
                group.last_message_id.map(|id| id.to_string()),
                group.last_message_sent_at.as_ref().map(ts),
                group.version,
                ts(&group.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn group_login_taken(&self, login: &str) -> Result<bool> {
        let taken = self.query_row(
            "SELECT EXISTS (SELECT 1 FROM chat_groups WHERE login = ?1)",
            params![login],
            |row| row.get(0),
        )?;
        Ok(taken)
    }

    pub fn get_group(&self, id: GroupId) -> Result<Group> {
        self.query_row(
            &format!("SELECT {GROUP_COLUMNS} FROM chat_groups WHERE id = ?1"),
            params![id.to_string()],
            row_to_group,
        )
        .map_err(not_found("Group"))
    }

    /// Compare-and-set the group's last-message pointer. Same contract as
    /// `set_conversation_last`.
    pub fn set_group_last(
        &self,
        group: &mut Group,
        last_message_id: Option<MessageId>,
        last_message_sent_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let affected = self.execute(
            "UPDATE chat_groups
             SET last_message_id = ?1, last_message_sent_at = ?2, version = version + 1
             WHERE id = ?3 AND version = ?4",
            params![
                last_message_id.map(|id| id.to_string()),
                last_message_sent_at.as_ref().map(ts),
                group.id.to_string(),
                group.version,
            ],
        )?;
        if affected == 0 {
            tracing::warn!(group = %group.id, version = group.version, "stale group version");
            return Err(StoreError::Conflict("Group"));
        }

        group.last_message_id = last_message_id;
        group.last_message_sent_at = last_message_sent_at;
        group.version += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Participants
    // ------------------------------------------------------------------

    /// Add a member. Returns `false` if the user already was one.
    pub fn add_participant(&self, participant: &Participant) -> Result<bool> {
        let affected = self.execute(
            "INSERT OR IGNORE INTO participants (group_id, user_id, role, joined_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                participant.group_id.to_string(),
                participant.user_id.to_string(),
                participant.role.as_str(),
                ts(&participant.joined_at),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn find_participant(&self, group: GroupId, user: UserId) -> Result<Option<Participant>> {
        let participant = self
            .query_row(
                "SELECT group_id, user_id, role, joined_at FROM participants
                 WHERE group_id = ?1 AND user_id = ?2",
                params![group.to_string(), user.to_string()],
                row_to_participant,
            )
            .optional()?;
        Ok(participant)
    }

    /// Member ids of a group, in join order.
    pub fn group_member_ids(&self, group: GroupId) -> Result<Vec<UserId>> {
        let mut stmt = self.prepare(
            "SELECT user_id FROM participants WHERE group_id = ?1 ORDER BY joined_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![group.to_string()], |row| Ok(UserId(uuid_at(row, 0)?)))?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: GroupId(uuid_at(row, 0)?),
        name: row.get(1)?,
        login: row.get(2)?,
        avatar: row.get(3)?,
        is_official: row.get(4)?,
        last_message_id: opt_uuid_at(row, 5)?.map(MessageId),
        last_message_sent_at: opt_ts_at(row, 6)?,
        version: row.get(7)?,
        created_at: ts_at(row, 8)?,
    })
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    let role: ParticipantRole = enum_at(row, 2)?;
    Ok(Participant {
        group_id: GroupId(uuid_at(row, 0)?),
        user_id: UserId(uuid_at(row, 1)?),
        role,
        joined_at: ts_at(row, 3)?,
    })
}
