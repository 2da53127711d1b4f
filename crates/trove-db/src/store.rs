use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use trove_common::{Error, Result};
use tracing::{debug, info};

type SqlitePool = Pool<SqliteConnectionManager>;

const BUSY_TIMEOUT_MS: u32 = 5_000;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub pool_size: u32,
    /// Bound on connection checkout and on every blocking store call.
    pub operation_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            pool_size: 8,
            operation_timeout: Duration::from_secs(10),
        }
    }
}

/// Control-plane metadata database.
///
/// Only the registry and the migration engine in this crate run SQL against
/// it. There is no public way to execute arbitrary statements.
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
    operation_timeout: Duration,
}

impl MetadataStore {
    pub fn open(db_path: &Path, options: StoreOptions) -> Result<Self> {
        info!("opening metadata store at {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(&format!(
                "PRAGMA busy_timeout={BUSY_TIMEOUT_MS}; PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;"
            ))
        });

        let pool = Pool::builder()
            .max_size(options.pool_size.max(1))
            .connection_timeout(options.operation_timeout)
            .build(manager)
            .map_err(|e| Error::Database(format!("failed to open metadata store: {e}")))?;

        Ok(Self {
            pool,
            operation_timeout: options.operation_timeout,
        })
    }

    /// Single-connection in-memory store. Each SQLite memory connection is its
    /// own database, so the pool is pinned to one connection that never expires.
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys=ON;"));

        let operation_timeout = StoreOptions::default().operation_timeout;
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_timeout(operation_timeout)
            .build(manager)
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        Ok(Self {
            pool,
            operation_timeout,
        })
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Run blocking work on one pooled connection, bounded by the operation timeout.
    pub(crate) async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        self.run_with_timeout(op, self.operation_timeout, f).await
    }

    /// Like [`MetadataStore::run`] with an explicit bound, for long operations
    /// such as a full migration pass.
    ///
    /// The pooled connection goes back to the pool when the closure returns,
    /// whether it succeeded, failed, or panicked. A timed-out call keeps its
    /// connection until the blocking work finishes.
    pub(crate) async fn run_with_timeout<T, F>(
        &self,
        op: &'static str,
        timeout: Duration,
        f: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let checkout_timeout = self.operation_timeout;
        let task = tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get_timeout(checkout_timeout)
                .map_err(|e| Error::Database(format!("failed to check out connection: {e}")))?;
            f(&mut conn)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::Database(format!("{op} did not complete: {e}"))),
            Err(_) => {
                debug!("{op} exceeded {}ms", timeout.as_millis());
                Err(Error::Database(format!(
                    "{op} timed out after {}s",
                    timeout.as_secs_f64()
                )))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pool_state(&self) -> r2d2::State {
        self.pool.state()
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("max_size", &self.pool.max_size())
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}
