//! Database connection management and the unit-of-work wrapper.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation. Every multi-entity write
//! goes through a [`UnitOfWork`], which is a transaction that rolls back
//! unless [`UnitOfWork::commit`] is reached.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Default on-disk location of the server database.
    ///
    /// - Linux:   `~/.local/share/courier/courier.db`
    /// - macOS:   `~/Library/Application Support/com.courier.courier/courier.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\courier\courier\data\courier.db`
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "courier", "courier").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        Ok(data_dir.join("courier.db"))
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        Self::open_file(path, None)
    }

    /// Open a database whose writers wait up to `busy_timeout` for the
    /// SQLite lock, including while migrating.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        Self::open_file(path, Some(busy_timeout))
    }

    fn open_file(path: &Path, busy_timeout: Option<Duration>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        if let Some(timeout) = busy_timeout {
            conn.busy_timeout(timeout)?;
        }

        // WAL lets readers proceed while one writer holds the lock.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Start a write unit. The write lock is taken up front (`BEGIN
    /// IMMEDIATE`) so reads made inside the unit cannot be invalidated by
    /// another writer before commit.
    pub fn begin(&mut self) -> Result<UnitOfWork<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(UnitOfWork { tx })
    }

    /// Start a read-only unit giving a consistent snapshot across queries.
    pub fn begin_read(&mut self) -> Result<UnitOfWork<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)?;
        Ok(UnitOfWork { tx })
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

/// One atomic unit spanning every mutation of an operation.
///
/// Dropping the unit without calling [`commit`](UnitOfWork::commit) rolls
/// back, so `?` on any step discards everything applied before it.
pub struct UnitOfWork<'conn> {
    tx: Transaction<'conn>,
}

impl UnitOfWork<'_> {
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

impl Deref for UnitOfWork<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = Database::open_at(&path).expect("should open");
        assert!(db.path().is_some());
    }

    #[test]
    fn dropped_unit_rolls_back() {
        let mut db = Database::open_in_memory().unwrap();
        let user = User::new("Ada", "ada@example.com");
        {
            let uow = db.begin().unwrap();
            uow.insert_user(&user).unwrap();
        }
        let uow = db.begin_read().unwrap();
        assert!(matches!(
            uow.get_user(user.id),
            Err(StoreError::NotFound("User"))
        ));
    }

    #[test]
    fn committed_unit_persists() {
        let mut db = Database::open_in_memory().unwrap();
        let user = User::new("Ada", "ada@example.com");
        let uow = db.begin().unwrap();
        uow.insert_user(&user).unwrap();
        uow.commit().unwrap();

        let uow = db.begin_read().unwrap();
        assert_eq!(uow.get_user(user.id).unwrap().name, "Ada");
    }
}
