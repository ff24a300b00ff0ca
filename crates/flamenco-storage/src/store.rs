use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use flamenco_core::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Tunable connection-level settings for [`Store::connect`].
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Kernel-level busy timeout SQLite itself applies before returning
    /// `SQLITE_BUSY` (§6 "DB busy timeout", default 20s).
    pub busy_timeout: Duration,
    /// Create the database file if it does not already exist.
    pub create_if_missing: bool,
    /// Maximum number of pooled connections. Only one of these will ever
    /// hold the write lock at a time; the rest serve concurrent readers.
    pub max_connections: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(20),
            create_if_missing: true,
            max_connections: 8,
        }
    }
}

/// The durable store backing the Flamenco Manager core engine.
///
/// Holds the connection pool and a process-wide reader/writer lock (§4.1):
/// at most one read/write transaction proceeds at a time, serialized by
/// [`Store::begin_write`]; any number of read-only transactions can proceed
/// concurrently via [`Store::begin_read`].
pub struct Store {
    pool: SqlitePool,
    writer: Arc<RwLock<()>>,
}

impl Store {
    pub async fn connect(database_url: &str, options: StoreOptions) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| Error::validation(format!("invalid database url: {e}")))?
            .create_if_missing(options.create_if_missing)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect_options)
            .await?;

        tracing::info!("opened store at {database_url}");

        Ok(Self {
            pool,
            writer: Arc::new(RwLock::new(())),
        })
    }

    /// Wrap an already-connected pool, e.g. one handed to a test by
    /// `#[sqlx::test]`. Production code should use [`Store::connect`].
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Arc::new(RwLock::new(())),
        }
    }

    /// Apply all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::internal(anyhow::Error::new(e)))?;
        tracing::info!("migrations applied");
        Ok(())
    }

    /// Open a read/write transaction.
    ///
    /// This blocks until the single process-wide writer lock is available,
    /// then begins a serializable SQLite transaction. Mutually exclusive
    /// with every other read/write transaction on this `Store` (§4.1, §5).
    pub async fn begin_write(&self) -> Result<WriteTxn> {
        let guard = self.writer.clone().write_owned().await;
        let tx = self.pool.begin().await?;
        Ok(WriteTxn {
            _guard: guard,
            tx: Some(tx),
        })
    }

    /// Open a read-only transaction.
    ///
    /// Multiple read-only transactions may proceed in parallel with each
    /// other; this only has to wait behind an in-flight read/write
    /// transaction, never behind another reader. Always rolled back at the
    /// end (§4.1).
    pub async fn begin_read(&self) -> Result<ReadTxn> {
        let guard = self.writer.clone().read_owned().await;
        let tx = self.pool.begin().await?;
        Ok(ReadTxn {
            _guard: guard,
            tx: Some(tx),
        })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// A read/write transaction. Effects are only visible to other
/// transactions after [`WriteTxn::commit`].
pub struct WriteTxn {
    _guard: OwnedRwLockWriteGuard<()>,
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
}

impl WriteTxn {
    pub fn conn(&mut self) -> &mut sqlx::SqliteConnection {
        self.tx.as_mut().expect("transaction already consumed")
    }

    pub async fn commit(mut self) -> Result<()> {
        let tx = self.tx.take().expect("transaction already consumed");
        tx.commit().await?;
        Ok(())
    }
}

/// A read-only transaction, always rolled back when dropped.
pub struct ReadTxn {
    _guard: OwnedRwLockReadGuard<()>,
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
}

impl ReadTxn {
    pub fn conn(&mut self) -> &mut sqlx::SqliteConnection {
        self.tx.as_mut().expect("transaction already consumed")
    }
}
