use rusqlite::{Connection, TransactionBehavior};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt::Write;
use std::sync::Arc;
use trove_common::{Error, MigrationId, Result};
use trove_security::Vault;
use tracing::{error, info, warn};

use crate::migrations::{
    MIGRATIONS, Migration, MigrationSecrets, SCHEMA_MIGRATIONS_TABLE, SECRET_INJECTIONS,
    SecretInjection,
};
use crate::store::MetadataStore;

/// Outcome of one migration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Ids applied by this pass, ascending.
    pub applied: Vec<MigrationId>,
    /// Defined migrations that were already recorded.
    pub already_applied: usize,
}

/// Brings the metadata store schema up to the latest defined migration.
pub struct Migrator {
    migrations: Vec<Migration>,
    injections: Vec<SecretInjection>,
    vault: Arc<Vault>,
    secrets: MigrationSecrets,
}

impl Migrator {
    /// Migrator over the built-in migration and secret-injection tables.
    pub fn new(vault: Arc<Vault>, secrets: MigrationSecrets) -> Self {
        Self::with_migrations(MIGRATIONS.to_vec(), SECRET_INJECTIONS.to_vec(), vault, secrets)
    }

    pub fn with_migrations(
        migrations: Vec<Migration>,
        injections: Vec<SecretInjection>,
        vault: Arc<Vault>,
        secrets: MigrationSecrets,
    ) -> Self {
        Self {
            migrations,
            injections,
            vault,
            secrets,
        }
    }

    pub fn migration(&self, id: MigrationId) -> Result<&Migration> {
        self.migrations
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::NotFound(format!("migration {id}")))
    }

    /// Check the migration table is contiguous from 1 and that every secret
    /// injection points at an existing migration containing its placeholder.
    pub fn validate(&self) -> Result<()> {
        for (index, migration) in self.migrations.iter().enumerate() {
            let expected = index as MigrationId + 1;
            if migration.id != expected {
                return Err(Error::Config(format!(
                    "migration '{}' has id {}, expected {expected}",
                    migration.name, migration.id
                )));
            }
        }

        for injection in &self.injections {
            let migration = self.migration(injection.migration_id).map_err(|_| {
                Error::Config(format!(
                    "secret injection references unknown migration {}",
                    injection.migration_id
                ))
            })?;
            if !migration.sql.contains(injection.placeholder) {
                return Err(Error::Config(format!(
                    "migration {} does not contain placeholder {}",
                    migration.id, injection.placeholder
                )));
            }
        }
        Ok(())
    }

    /// SQL for `migration` with any secret placeholders replaced.
    pub fn render(&self, migration: &Migration) -> Result<String> {
        render_sql(migration, &self.injections, &self.vault, &self.secrets).map(Cow::into_owned)
    }

    /// Applied ids in ascending order. Creates the tracking table if needed.
    pub async fn applied(&self, store: &MetadataStore) -> Result<Vec<MigrationId>> {
        store
            .run("read applied migrations", |conn| {
                applied_migrations(conn)
                    .map_err(|e| Error::Database(format!("failed to read applied migrations: {e}")))
            })
            .await
    }

    /// Apply every pending migration in ascending order on one connection.
    ///
    /// Stops at the first failure. Migrations committed before the failure
    /// stay committed.
    pub async fn run(&self, store: &MetadataStore) -> Result<MigrationReport> {
        self.validate()?;

        let migrations = self.migrations.clone();
        let injections = self.injections.clone();
        let vault = Arc::clone(&self.vault);
        let secrets = self.secrets.clone();
        let timeout = store.operation_timeout() * (migrations.len() as u32 + 1);

        let result = store
            .run_with_timeout("run migrations", timeout, move |conn| {
                let applied: BTreeSet<MigrationId> = applied_migrations(conn)
                    .map_err(|e| {
                        Error::Database(format!("failed to read applied migrations: {e}"))
                    })?
                    .into_iter()
                    .collect();

                let latest = migrations.last().map(|m| m.id).unwrap_or(0);
                if let Some(unknown) = applied.iter().find(|id| **id > latest) {
                    warn!("store records migration {unknown}, newer than latest known {latest}");
                }

                let mut report = MigrationReport::default();
                for migration in &migrations {
                    if applied.contains(&migration.id) {
                        report.already_applied += 1;
                        continue;
                    }

                    info!("applying migration {} ({})", migration.id, migration.name);
                    let sql = render_sql(migration, &injections, &vault, &secrets).map_err(
                        |e| Error::Migration {
                            id: migration.id,
                            reason: e.to_string(),
                        },
                    )?;

                    if apply_migration(conn, migration.id, &sql)? {
                        report.applied.push(migration.id);
                    } else {
                        report.already_applied += 1;
                    }
                }
                Ok(report)
            })
            .await;

        match &result {
            Ok(report) if report.applied.is_empty() => {
                info!("schema up to date ({} migrations)", report.already_applied)
            }
            Ok(report) => info!("applied {} migration(s)", report.applied.len()),
            Err(e) => error!("error running migrations: {e}"),
        }
        result
    }
}

/// Run the built-in migrations against `store`.
pub async fn run_migrations(
    store: &MetadataStore,
    vault: Arc<Vault>,
    secrets: MigrationSecrets,
) -> Result<MigrationReport> {
    Migrator::new(vault, secrets).run(store).await
}

/// Ensure `schema_migrations` exists and return the recorded ids, ascending.
pub fn applied_migrations(conn: &Connection) -> rusqlite::Result<Vec<MigrationId>> {
    conn.execute_batch(SCHEMA_MIGRATIONS_TABLE)?;
    let mut stmt =
        conn.prepare("SELECT migration_id FROM schema_migrations ORDER BY migration_id")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, MigrationId>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// Execute one migration and record it, atomically.
///
/// Returns `false` without touching the schema if the id was recorded by
/// someone else between the read of applied ids and this transaction.
pub fn apply_migration(conn: &mut Connection, id: MigrationId, sql: &str) -> Result<bool> {
    let fail = |e: rusqlite::Error| Error::Migration {
        id,
        reason: e.to_string(),
    };

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(fail)?;

    let exists: bool = tx
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE migration_id = ?1)",
            [id],
            |row| row.get(0),
        )
        .map_err(fail)?;
    if exists {
        info!("migration {id} already recorded, skipping");
        return Ok(false);
    }

    tx.execute_batch(sql).map_err(fail)?;
    tx.execute(
        "INSERT INTO schema_migrations (migration_id) VALUES (?1)",
        [id],
    )
    .map_err(fail)?;
    tx.commit().map_err(fail)?;

    info!("applied migration {id}");
    Ok(true)
}

/// Replace each placeholder registered for `migration` with the encrypted secret.
pub fn render_sql<'a>(
    migration: &'a Migration,
    injections: &[SecretInjection],
    vault: &Vault,
    secrets: &MigrationSecrets,
) -> Result<Cow<'a, str>> {
    let mut sql = Cow::Borrowed(migration.sql);
    for injection in injections
        .iter()
        .filter(|i| i.migration_id == migration.id)
    {
        let token = vault.encrypt(secrets.get(injection.secret))?;
        sql = Cow::Owned(sql.replace(injection.placeholder, &blob_literal(&token)));
    }
    Ok(sql)
}

/// SQLite blob literal, e.g. `X'0A1B'`.
pub fn blob_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2 + 3);
    out.push_str("X'");
    for b in bytes {
        let _ = write!(out, "{b:02X}");
    }
    out.push('\'');
    out
}
