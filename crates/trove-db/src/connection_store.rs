use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeDelta, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use std::sync::Arc;
use trove_common::{ConnectionId, Error, Result};
use trove_security::Vault;
use tracing::info;

use crate::model::{
    ConnectionInfo, ConnectionType, ConnectionUpdate, NewConnection, SslMode, StoredCredentials,
};
use crate::store::MetadataStore;
use crate::validation;

const INFO_COLUMNS: &str = "id, name, connection_type, host, port, database, username, \
                            ssl_mode, created_at, updated_at, is_active";

/// Registry operations consumed by the request layer.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    async fn create(&self, new: NewConnection) -> Result<ConnectionInfo>;
    async fn list(&self, active_only: bool) -> Result<Vec<ConnectionInfo>>;
    async fn get(&self, id: ConnectionId) -> Result<ConnectionInfo>;
    async fn update(&self, id: ConnectionId, update: ConnectionUpdate) -> Result<ConnectionInfo>;
    async fn delete(&self, id: ConnectionId) -> Result<()>;
}

/// Registered target databases, stored in `database_connections`.
///
/// Passwords are encrypted with the vault before they reach the store and
/// are only handed out still encrypted, through [`ConnectionStore::find_credentials`].
#[derive(Clone)]
pub struct ConnectionStore {
    store: MetadataStore,
    vault: Arc<Vault>,
}

impl ConnectionStore {
    pub fn new(store: MetadataStore, vault: Arc<Vault>) -> Self {
        Self { store, vault }
    }

    pub async fn create(&self, new: NewConnection) -> Result<ConnectionInfo> {
        validation::validate_new(&new)?;
        let password = self.vault.encrypt(&new.password)?;

        let info = self
            .store
            .run("create connection", move |conn| {
                conn.execute(
                    "INSERT INTO database_connections (
                        name, connection_type, host, port, database, username, password, ssl_mode
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        new.name,
                        new.connection_type.as_str(),
                        new.host,
                        new.port,
                        new.database,
                        new.username,
                        password,
                        new.ssl_mode.as_str(),
                    ],
                )
                .map_err(|e| write_error(e, &new.name, "create"))?;

                let id = ConnectionId::new(conn.last_insert_rowid());
                select_info(conn, id, false)?
                    .ok_or_else(|| Error::Database(format!("connection {id} vanished after insert")))
            })
            .await?;

        info!(
            "registered connection {} '{}' ({} at {}:{})",
            info.id, info.name, info.connection_type, info.host, info.port
        );
        Ok(info)
    }

    /// All connections ordered by name, optionally including soft-deleted ones.
    pub async fn list(&self, active_only: bool) -> Result<Vec<ConnectionInfo>> {
        self.store
            .run("list connections", move |conn| {
                let sql = if active_only {
                    format!(
                        "SELECT {INFO_COLUMNS} FROM database_connections \
                         WHERE is_active = 1 ORDER BY name"
                    )
                } else {
                    format!("SELECT {INFO_COLUMNS} FROM database_connections ORDER BY name")
                };
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| Error::Database(format!("failed to prepare list query: {e}")))?;
                let rows = stmt
                    .query_map([], row_to_info)
                    .map_err(|e| Error::Database(format!("failed to list connections: {e}")))?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| Error::Database(format!("failed to collect connections: {e}")))?;
                Ok(rows)
            })
            .await
    }

    pub async fn get(&self, id: ConnectionId) -> Result<ConnectionInfo> {
        self.store
            .run("get connection", move |conn| {
                select_info(conn, id, true)?.ok_or_else(|| not_found(id))
            })
            .await
    }

    /// Apply the fields present in `update` to an active connection.
    ///
    /// A supplied password is re-encrypted. An empty update returns the
    /// current record without writing.
    pub async fn update(&self, id: ConnectionId, update: ConnectionUpdate) -> Result<ConnectionInfo> {
        if update.is_empty() {
            return self.get(id).await;
        }
        validation::validate_update(&update)?;
        let password = update
            .password
            .as_deref()
            .map(|p| self.vault.encrypt(p))
            .transpose()?;

        let info = self
            .store
            .run("update connection", move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(|e| Error::Database(format!("failed to begin update: {e}")))?;
                let updated_at = next_updated_at(&tx, id)?;
                let changed = tx
                    .execute(
                        "UPDATE database_connections SET
                            name = COALESCE(?1, name),
                            connection_type = COALESCE(?2, connection_type),
                            host = COALESCE(?3, host),
                            port = COALESCE(?4, port),
                            database = COALESCE(?5, database),
                            username = COALESCE(?6, username),
                            password = COALESCE(?7, password),
                            ssl_mode = COALESCE(?8, ssl_mode),
                            updated_at = ?10
                         WHERE id = ?9 AND is_active = 1",
                        params![
                            update.name,
                            update.connection_type.map(|t| t.as_str()),
                            update.host,
                            update.port,
                            update.database,
                            update.username,
                            password,
                            update.ssl_mode.map(|m| m.as_str()),
                            id.get(),
                            updated_at,
                        ],
                    )
                    .map_err(|e| {
                        write_error(e, update.name.as_deref().unwrap_or_default(), "update")
                    })?;
                if changed == 0 {
                    return Err(not_found(id));
                }

                let info = select_info(&tx, id, true)?.ok_or_else(|| not_found(id))?;
                tx.commit()
                    .map_err(|e| Error::Database(format!("failed to commit update: {e}")))?;
                Ok(info)
            })
            .await?;

        info!("updated connection {} '{}'", info.id, info.name);
        Ok(info)
    }

    /// Soft delete: the row stays but is hidden from lookups and resolution.
    pub async fn delete(&self, id: ConnectionId) -> Result<()> {
        self.store
            .run("delete connection", move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(|e| Error::Database(format!("failed to begin delete: {e}")))?;
                let updated_at = next_updated_at(&tx, id)?;
                let changed = tx
                    .execute(
                        "UPDATE database_connections SET is_active = 0, updated_at = ?2 \
                         WHERE id = ?1 AND is_active = 1",
                        params![id.get(), updated_at],
                    )
                    .map_err(|e| Error::Database(format!("failed to delete connection: {e}")))?;
                if changed == 0 {
                    return Err(not_found(id));
                }
                tx.commit()
                    .map_err(|e| Error::Database(format!("failed to commit delete: {e}")))?;
                Ok(())
            })
            .await?;

        info!("deactivated connection {id}");
        Ok(())
    }

    /// Connection parameters of an active record, password still encrypted.
    pub async fn find_credentials(&self, id: ConnectionId) -> Result<StoredCredentials> {
        self.store
            .run("read connection credentials", move |conn| {
                conn.query_row(
                    "SELECT connection_type, host, port, database, username, password, ssl_mode
                     FROM database_connections
                     WHERE id = ?1 AND is_active = 1",
                    [id.get()],
                    |row| {
                        let ssl_mode: String = row.get(6)?;
                        Ok(StoredCredentials {
                            id,
                            connection_type: row.get(0)?,
                            host: row.get(1)?,
                            port: row.get(2)?,
                            database: row.get(3)?,
                            username: row.get(4)?,
                            password: row.get(5)?,
                            ssl_mode: ssl_mode.parse::<SslMode>().map_err(conversion_error)?,
                        })
                    },
                )
                .optional()
                .map_err(|e| Error::Database(format!("failed to read connection {id}: {e}")))?
                .ok_or_else(|| not_found(id))
            })
            .await
    }
}

#[async_trait]
impl ConnectionRegistry for ConnectionStore {
    async fn create(&self, new: NewConnection) -> Result<ConnectionInfo> {
        ConnectionStore::create(self, new).await
    }

    async fn list(&self, active_only: bool) -> Result<Vec<ConnectionInfo>> {
        ConnectionStore::list(self, active_only).await
    }

    async fn get(&self, id: ConnectionId) -> Result<ConnectionInfo> {
        ConnectionStore::get(self, id).await
    }

    async fn update(&self, id: ConnectionId, update: ConnectionUpdate) -> Result<ConnectionInfo> {
        ConnectionStore::update(self, id, update).await
    }

    async fn delete(&self, id: ConnectionId) -> Result<()> {
        ConnectionStore::delete(self, id).await
    }
}

fn not_found(id: ConnectionId) -> Error {
    Error::NotFound(format!("connection {id}"))
}

/// Timestamp for the next mutation of an active row: the current time at
/// microsecond precision, strictly after the stored `updated_at`.
fn next_updated_at(conn: &Connection, id: ConnectionId) -> Result<String> {
    let current: String = conn
        .query_row(
            "SELECT updated_at FROM database_connections WHERE id = ?1 AND is_active = 1",
            [id.get()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to read connection {id}: {e}")))?
        .ok_or_else(|| not_found(id))?;

    let floor = parse_timestamp(&current)? + TimeDelta::microseconds(1);
    Ok(format_timestamp(Utc::now().max(floor)))
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn select_info(conn: &Connection, id: ConnectionId, active_only: bool) -> Result<Option<ConnectionInfo>> {
    let sql = if active_only {
        format!("SELECT {INFO_COLUMNS} FROM database_connections WHERE id = ?1 AND is_active = 1")
    } else {
        format!("SELECT {INFO_COLUMNS} FROM database_connections WHERE id = ?1")
    };
    conn.query_row(&sql, [id.get()], row_to_info)
        .optional()
        .map_err(|e| Error::Database(format!("failed to read connection {id}: {e}")))
}

/// Map constraint violations to validation errors; everything else is a store failure.
fn write_error(err: rusqlite::Error, name: &str, action: &str) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Error::Validation(format!("connection with name '{name}' already exists"))
        }
        rusqlite::Error::SqliteFailure(code, message)
            if code.code == ErrorCode::ConstraintViolation =>
        {
            Error::Validation(format!(
                "connection rejected by store constraint: {}",
                message.as_deref().unwrap_or("unknown constraint")
            ))
        }
        _ => Error::Database(format!("failed to {action} connection: {err}")),
    }
}

fn row_to_info(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionInfo> {
    let connection_type: String = row.get(2)?;
    let ssl_mode: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(ConnectionInfo {
        id: ConnectionId::new(row.get(0)?),
        name: row.get(1)?,
        connection_type: connection_type
            .parse::<ConnectionType>()
            .map_err(conversion_error)?,
        host: row.get(3)?,
        port: row.get(4)?,
        database: row.get(5)?,
        username: row.get(6)?,
        ssl_mode: ssl_mode.parse::<SslMode>().map_err(conversion_error)?,
        created_at: parse_timestamp(&created_at).map_err(conversion_error)?,
        updated_at: parse_timestamp(&updated_at).map_err(conversion_error)?,
        is_active: row.get(10)?,
    })
}

fn conversion_error(e: Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(e.to_string())))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
    }

    Err(Error::Database(format!("invalid timestamp format: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::MigrationSecrets;
    use crate::migrator::Migrator;

    async fn registry() -> (ConnectionStore, Arc<Vault>) {
        let store = MetadataStore::in_memory().expect("failed to create in-memory store");
        let vault = Arc::new(Vault::new(&Vault::generate_key().unwrap()).unwrap());
        Migrator::new(Arc::clone(&vault), MigrationSecrets::default())
            .run(&store)
            .await
            .expect("migrations should apply");
        (ConnectionStore::new(store, Arc::clone(&vault)), vault)
    }

    fn demo(name: &str) -> NewConnection {
        NewConnection {
            name: name.to_string(),
            connection_type: ConnectionType::Postgresql,
            host: "h".into(),
            port: 5432,
            database: "d".into(),
            username: "u".into(),
            password: "p".into(),
            ssl_mode: SslMode::Prefer,
        }
    }

    #[tokio::test]
    async fn create_encrypts_password_and_returns_info() {
        let (registry, vault) = registry().await;
        let info = registry.create(demo("demo")).await.expect("create should succeed");

        assert_eq!(info.name, "demo");
        assert_eq!(info.port, 5432);
        assert_eq!(info.ssl_mode, SslMode::Prefer);
        assert!(info.is_active);

        let stored = registry.find_credentials(info.id).await.unwrap();
        assert_ne!(stored.password, b"p");
        assert_eq!(vault.decrypt(&stored.password).unwrap(), "p");
        assert_eq!(stored.connection_type, "postgresql");
    }

    #[tokio::test]
    async fn duplicate_names_are_validation_errors() {
        let (registry, _) = registry().await;
        registry.create(demo("dup")).await.unwrap();

        let err = registry.create(demo("dup")).await.unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert!(err.to_string().contains("'dup' already exists"));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_insert() {
        let (registry, _) = registry().await;

        let err = registry.create(demo("Not Valid")).await.unwrap_err();
        assert_eq!(err.code(), "validation_error");

        let mut zero_port = demo("zero-port");
        zero_port.port = 0;
        assert!(registry.create(zero_port).await.is_err());

        let names: Vec<String> = registry
            .list(false)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["sample"]);
    }

    #[tokio::test]
    async fn get_unknown_id_is_not_found() {
        let (registry, _) = registry().await;
        let err = registry.get(ConnectionId::new(999)).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn list_is_ordered_by_name() {
        let (registry, _) = registry().await;
        registry.create(demo("zeta")).await.unwrap();
        registry.create(demo("alpha")).await.unwrap();

        let names: Vec<String> = registry
            .list(true)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["alpha", "sample", "zeta"]);
    }

    #[tokio::test]
    async fn soft_delete_hides_record_from_active_paths() {
        let (registry, _) = registry().await;
        let info = registry.create(demo("gone")).await.unwrap();

        registry.delete(info.id).await.expect("delete should succeed");

        assert_eq!(registry.get(info.id).await.unwrap_err().code(), "not_found");
        assert_eq!(
            registry.find_credentials(info.id).await.unwrap_err().code(),
            "not_found"
        );
        assert!(
            !registry
                .list(true)
                .await
                .unwrap()
                .iter()
                .any(|c| c.id == info.id)
        );

        let all = registry.list(false).await.unwrap();
        let deleted = all.iter().find(|c| c.id == info.id).expect("still listed");
        assert!(!deleted.is_active);

        // deleting twice reports not found
        assert_eq!(registry.delete(info.id).await.unwrap_err().code(), "not_found");
    }

    #[tokio::test]
    async fn partial_update_changes_only_given_fields() {
        let (registry, _) = registry().await;
        let created = registry.create(demo("partial")).await.unwrap();

        let updated = registry
            .update(
                created.id,
                ConnectionUpdate {
                    host: Some("new-host".into()),
                    ssl_mode: Some(SslMode::Require),
                    ..Default::default()
                },
            )
            .await
            .expect("update should succeed");

        assert_eq!(updated.host, "new-host");
        assert_eq!(updated.ssl_mode, SslMode::Require);
        assert_eq!(updated.name, created.name);
        assert_eq!(updated.port, created.port);
        assert_eq!(updated.database, created.database);
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at > created.updated_at);
    }

    #[tokio::test]
    async fn back_to_back_mutations_advance_updated_at() {
        let (registry, _) = registry().await;
        let created = registry.create(demo("busy")).await.unwrap();

        let mut last = created.updated_at;
        for port in 1..=50u16 {
            let updated = registry
                .update(
                    created.id,
                    ConnectionUpdate {
                        port: Some(port),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert!(updated.updated_at > last, "update {port} did not advance updated_at");
            last = updated.updated_at;
        }

        registry.delete(created.id).await.unwrap();
        let deleted = registry
            .list(false)
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.id == created.id)
            .unwrap();
        assert!(deleted.updated_at > last);
    }

    #[test]
    fn write_error_classifies_constraint_failures() {
        let unique = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE),
            Some("UNIQUE constraint failed: database_connections.name".into()),
        );
        let err = write_error(unique, "dup", "create");
        assert_eq!(err.code(), "validation_error");
        assert!(err.to_string().contains("'dup' already exists"));

        let check = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_CHECK),
            Some("CHECK constraint failed: valid_port".into()),
        );
        let err = write_error(check, "x", "update");
        assert_eq!(err.code(), "validation_error");
        assert!(err.to_string().contains("valid_port"));

        let err = write_error(rusqlite::Error::QueryReturnedNoRows, "x", "update");
        assert_eq!(err.code(), "database_error");
    }

    #[tokio::test]
    async fn update_re_encrypts_password() {
        let (registry, vault) = registry().await;
        let created = registry.create(demo("rotate")).await.unwrap();
        let before = registry.find_credentials(created.id).await.unwrap();

        registry
            .update(
                created.id,
                ConnectionUpdate {
                    password: Some("new-secret".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let after = registry.find_credentials(created.id).await.unwrap();
        assert_ne!(before.password, after.password);
        assert_eq!(vault.decrypt(&after.password).unwrap(), "new-secret");
    }

    #[tokio::test]
    async fn empty_update_returns_record_unchanged() {
        let (registry, _) = registry().await;
        let created = registry.create(demo("noop")).await.unwrap();

        let same = registry
            .update(created.id, ConnectionUpdate::default())
            .await
            .unwrap();
        assert_eq!(same, created);
    }

    #[tokio::test]
    async fn update_errors() {
        let (registry, _) = registry().await;
        let first = registry.create(demo("first")).await.unwrap();
        registry.create(demo("second")).await.unwrap();

        let err = registry
            .update(
                first.id,
                ConnectionUpdate {
                    name: Some("second".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");

        registry.delete(first.id).await.unwrap();
        let err = registry
            .update(
                first.id,
                ConnectionUpdate {
                    host: Some("x".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn works_through_the_registry_trait() {
        let (store, _) = registry().await;
        let registry: Arc<dyn ConnectionRegistry> = Arc::new(store);

        let info = registry.create(demo("via-trait")).await.unwrap();
        assert_eq!(registry.get(info.id).await.unwrap().name, "via-trait");
    }
}
