//! Block lists and the messaging restriction check.

use rusqlite::params;

use courier_shared::types::UserId;

use crate::database::UnitOfWork;
use crate::error::{Result, StoreError};
use crate::sql::{self, ts};

impl UnitOfWork<'_> {
    /// Add `blocked` to `user`'s block list. Blocking twice is a no-op.
    pub fn block_user(&self, user: UserId, blocked: UserId) -> Result<()> {
        self.execute(
            "INSERT OR IGNORE INTO block_list (user_id, blocked_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![user.to_string(), blocked.to_string(), ts(&sql::now())],
        )?;
        Ok(())
    }

    /// Returns `true` if an entry was removed.
    pub fn unblock_user(&self, user: UserId, blocked: UserId) -> Result<bool> {
        let affected = self.execute(
            "DELETE FROM block_list WHERE user_id = ?1 AND blocked_id = ?2",
            params![user.to_string(), blocked.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Whether either party has blocked the other.
    pub fn is_messaging_restricted(&self, a: UserId, b: UserId) -> Result<bool> {
        let restricted = self.query_row(
            "SELECT EXISTS (
                 SELECT 1 FROM block_list
                 WHERE (user_id = ?1 AND blocked_id = ?2)
                    OR (user_id = ?2 AND blocked_id = ?1)
             )",
            params![a.to_string(), b.to_string()],
            |row| row.get(0),
        )?;
        Ok(restricted)
    }

    /// Fail with [`StoreError::Restricted`] if messaging between the two is
    /// blocked in either direction.
    pub fn ensure_not_restricted(&self, initiator: UserId, recipient: UserId) -> Result<()> {
        if self.is_messaging_restricted(initiator, recipient)? {
            tracing::debug!(%initiator, %recipient, "messaging restricted by block list");
            return Err(StoreError::Restricted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::models::User;
    use crate::Database;

    #[test]
    fn block_restricts_both_directions() {
        let mut db = Database::open_in_memory().unwrap();
        let a = User::new("A", "a@example.com");
        let b = User::new("B", "b@example.com");
        let c = User::new("C", "c@example.com");

        let uow = db.begin().unwrap();
        for u in [&a, &b, &c] {
            uow.insert_user(u).unwrap();
        }
        uow.block_user(a.id, b.id).unwrap();

        assert!(uow.is_messaging_restricted(a.id, b.id).unwrap());
        assert!(uow.is_messaging_restricted(b.id, a.id).unwrap());
        assert!(!uow.is_messaging_restricted(a.id, c.id).unwrap());

        assert!(uow.unblock_user(a.id, b.id).unwrap());
        assert!(!uow.is_messaging_restricted(b.id, a.id).unwrap());
        assert!(!uow.unblock_user(a.id, b.id).unwrap());
    }
}
