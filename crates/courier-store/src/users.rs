//! User directory reads and presence persistence.

use chrono::{DateTime, Utc};
use rusqlite::params;

use courier_shared::types::{Presence, UserId};
use courier_shared::views::UserSummary;

use crate::database::UnitOfWork;
use crate::error::{Result, StoreError};
use crate::models::User;
use crate::sql::{enum_at, not_found, opt_ts_at, ts, ts_at, uuid_at};

const USER_COLUMNS: &str = "id, name, email, avatar, is_official, is_private, is_deleted,
                            presence, last_seen_at, created_at";

impl UnitOfWork<'_> {
    /// Insert a user record. The directory collaborator owns this write.
    pub fn insert_user(&self, user: &User) -> Result<()> {
        self.execute(
            "INSERT INTO users (id, name, email, avatar, is_official, is_private, is_deleted,
                                presence, last_seen_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                user.id.to_string(),
                user.name,
                user.email,
                user.avatar,
                user.is_official,
                user.is_private,
                user.is_deleted,
                user.presence.as_str(),
                user.last_seen_at.as_ref().map(ts),
                ts(&user.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id.to_string()],
            row_to_user,
        )
        .map_err(not_found("User"))
    }

    /// Fetch a user that has not been soft-deleted.
    pub fn get_active_user(&self, id: UserId) -> Result<User> {
        let user = self.get_user(id)?;
        if user.is_deleted {
            return Err(StoreError::NotFound("User"));
        }
        Ok(user)
    }

    /// Summary of any user, deleted or not. Message authors stay renderable
    /// after their account is soft-deleted.
    pub fn user_summary(&self, id: UserId) -> Result<UserSummary> {
        Ok(self.get_user(id)?.summary())
    }

    /// Persist a presence change.
    pub fn set_user_presence(
        &self,
        id: UserId,
        presence: Presence,
        last_seen_at: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.execute(
            "UPDATE users SET presence = ?1, last_seen_at = ?2 WHERE id = ?3",
            params![presence.as_str(), ts(&last_seen_at), id.to_string()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound("User"));
        }
        Ok(())
    }

    /// Soft-delete a user. Their messages stay in place.
    pub fn soft_delete_user(&self, id: UserId) -> Result<()> {
        let affected = self.execute(
            "UPDATE users SET is_deleted = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound("User"));
        }
        Ok(())
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: UserId(uuid_at(row, 0)?),
        name: row.get(1)?,
        email: row.get(2)?,
        avatar: row.get(3)?,
        is_official: row.get(4)?,
        is_private: row.get(5)?,
        is_deleted: row.get(6)?,
        presence: enum_at(row, 7)?,
        last_seen_at: opt_ts_at(row, 8)?,
        created_at: ts_at(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sql, Database};

    #[test]
    fn presence_is_persisted() {
        let mut db = Database::open_in_memory().unwrap();
        let user = User::new("Ada", "ada@example.com");
        let seen = sql::now();

        let uow = db.begin().unwrap();
        uow.insert_user(&user).unwrap();
        uow.set_user_presence(user.id, Presence::Online, seen).unwrap();

        let stored = uow.get_user(user.id).unwrap();
        assert_eq!(stored.presence, Presence::Online);
        assert_eq!(stored.last_seen_at, Some(seen));
    }

    #[test]
    fn soft_deleted_user_is_not_active() {
        let mut db = Database::open_in_memory().unwrap();
        let user = User::new("Ada", "ada@example.com");

        let uow = db.begin().unwrap();
        uow.insert_user(&user).unwrap();
        uow.soft_delete_user(user.id).unwrap();

        assert!(uow.get_user(user.id).is_ok());
        assert!(matches!(
            uow.get_active_user(user.id),
            Err(StoreError::NotFound("User"))
        ));
    }
}
