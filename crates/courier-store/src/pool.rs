//! Async access to a pool of [`Database`] handles.
//!
//! rusqlite connections are blocking and `!Sync`, so each unit of work
//! checks one handle out of an r2d2 pool on the blocking thread pool, runs
//! there and hands the handle back when it is dropped. Every handle is
//! opened through [`Database::open_with_busy_timeout`], so migrations and
//! pragmas apply to each of them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::{HandleError, ManageConnection, Pool};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Opens [`Database`] handles on one file for r2d2.
#[derive(Debug)]
pub struct DatabaseManager {
    path: PathBuf,
    busy_timeout: Duration,
}

impl DatabaseManager {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }
}

impl ManageConnection for DatabaseManager {
    type Connection = Database;
    type Error = StoreError;

    fn connect(&self) -> Result<Database> {
        Database::open_with_busy_timeout(&self.path, self.busy_timeout)
    }

    fn is_valid(&self, db: &mut Database) -> Result<()> {
        db.conn().execute_batch("SELECT 1")?;
        Ok(())
    }

    /// A handle left inside a transaction (its unit of work was leaked
    /// rather than dropped) is discarded instead of reused.
    fn has_broken(&self, db: &mut Database) -> bool {
        !db.conn().is_autocommit()
    }
}

#[derive(Debug)]
struct TracingErrorHandler;

impl HandleError<StoreError> for TracingErrorHandler {
    fn handle_error(&self, error: StoreError) {
        tracing::warn!(error = %error, "database pool connection error");
    }
}

#[derive(Clone)]
pub struct StorePool {
    pool: Pool<DatabaseManager>,
}

impl StorePool {
    /// Open `size` handles on the same database file.
    pub fn open(path: &Path, size: usize, busy_timeout: Duration) -> Result<Self> {
        if size == 0 {
            return Err(StoreError::Pool("pool size must be at least 1".into()));
        }
        let max_size = u32::try_from(size)
            .map_err(|_| StoreError::Pool(format!("pool size {size} is too large")))?;

        // Migrate once up front so the pool's handles open concurrently
        // against an up-to-date schema.
        let manager = DatabaseManager::new(path, busy_timeout);
        drop(manager.connect()?);

        let pool = Pool::builder()
            .max_size(max_size)
            .error_handler(Box::new(TracingErrorHandler))
            .build(manager)
            .map_err(|e| StoreError::Pool(format!("failed to open pool: {e}")))?;

        tracing::info!(path = %path.display(), size, "database pool opened");
        Ok(Self { pool })
    }

    pub fn size(&self) -> usize {
        self.pool.max_size() as usize
    }

    /// Run `f` against a pooled handle on the blocking thread pool. The
    /// handle goes back to the pool even if `f` panics; an open unit of
    /// work rolls back first.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut db = pool
                .get()
                .map_err(|e| StoreError::Pool(format!("no connection available: {e}")))?;
            f(&mut db)
        })
        .await
        .map_err(|e| StoreError::Pool(format!("blocking task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;

    #[tokio::test]
    async fn every_handle_sees_committed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StorePool::open(&dir.path().join("pool.db"), 2, Duration::from_secs(1)).unwrap();
        assert_eq!(pool.size(), 2);

        let user = User::new("Ada", "ada@example.com");
        let id = user.id;
        pool.run(move |db| {
            let uow = db.begin()?;
            uow.insert_user(&user)?;
            uow.commit()
        })
        .await
        .unwrap();

        let mut reads = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            reads.push(tokio::spawn(async move {
                pool.run(move |db| {
                    let uow = db.begin_read()?;
                    Ok(uow.get_user(id)?.name)
                })
                .await
            }));
        }
        for read in reads {
            assert_eq!(read.await.unwrap().unwrap(), "Ada");
        }
    }

    #[tokio::test]
    async fn concurrent_sends_serialize_on_the_write_lock() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StorePool::open(&dir.path().join("pool.db"), 4, Duration::from_secs(5)).unwrap();

        let a = User::new("A", "a@example.com");
        let b = User::new("B", "b@example.com");
        let (a_id, b_id) = (a.id, b.id);
        pool.run(move |db| {
            let uow = db.begin()?;
            uow.insert_user(&a)?;
            uow.insert_user(&b)?;
            uow.commit()
        })
        .await
        .unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.run(move |db| db.send_message(a_id, b_id, &format!("msg {i}")))
                    .await
            }));
        }
        let mut new_conversations = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().is_new_conversation {
                new_conversations += 1;
            }
        }
        assert_eq!(new_conversations, 1);

        let (conversations, messages) = pool
            .run(|db| {
                let count = |table: &str| -> Result<i64> {
                    Ok(db.conn().query_row(
                        &format!("SELECT COUNT(*) FROM {table}"),
                        [],
                        |r| r.get(0),
                    )?)
                };
                Ok((count("conversations")?, count("messages")?))
            })
            .await
            .unwrap();
        assert_eq!(conversations, 1);
        assert_eq!(messages, 8);
    }

    #[tokio::test]
    async fn panic_inside_a_unit_rolls_back_and_frees_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StorePool::open(&dir.path().join("pool.db"), 1, Duration::from_secs(1)).unwrap();

        let user = User::new("Ada", "ada@example.com");
        let id = user.id;
        let failed = pool
            .run(move |db| -> Result<()> {
                let uow = db.begin()?;
                uow.insert_user(&user)?;
                panic!("boom")
            })
            .await;
        assert!(matches!(failed, Err(StoreError::Pool(_))));

        // The single handle is usable again and the insert never landed.
        let found = pool
            .run(move |db| {
                let idle = db.conn().is_autocommit();
                let uow = db.begin_read()?;
                Ok((idle, uow.get_user(id).is_ok()))
            })
            .await
            .unwrap();
        assert_eq!(found, (true, false));
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            StorePool::open(&dir.path().join("pool.db"), 0, Duration::from_secs(1)),
            Err(StoreError::Pool(_))
        ));
    }
}
