//! Migration definitions for the metadata store.
//!
//! Each migration has an id and a SQL body. Ids start at 1 and are contiguous;
//! they are applied in order and recorded in `schema_migrations`.

use trove_common::MigrationId;

#[derive(Debug, Clone)]
pub struct Migration {
    pub id: MigrationId,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Where a secret injected into a migration comes from at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    SampleDbPassword,
}

/// Replace `placeholder` in a migration body with the vault encryption of a
/// runtime secret, rendered as a blob literal.
#[derive(Debug, Clone)]
pub struct SecretInjection {
    pub migration_id: MigrationId,
    pub placeholder: &'static str,
    pub secret: SecretSource,
}

/// Runtime values for [`SecretSource`]s.
#[derive(Clone)]
pub struct MigrationSecrets {
    pub sample_db_password: String,
}

impl MigrationSecrets {
    pub fn get(&self, source: SecretSource) -> &str {
        match source {
            SecretSource::SampleDbPassword => &self.sample_db_password,
        }
    }
}

impl Default for MigrationSecrets {
    fn default() -> Self {
        Self {
            sample_db_password: "postgres".to_string(),
        }
    }
}

impl std::fmt::Debug for MigrationSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationSecrets").finish_non_exhaustive()
    }
}

pub const SCHEMA_MIGRATIONS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS schema_migrations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        migration_id INTEGER NOT NULL UNIQUE,
        applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );
";

pub const SAMPLE_PASSWORD_PLACEHOLDER: &str = "'encrypted_password_placeholder'";

pub const CREATE_DATABASE_CONNECTIONS: Migration = Migration {
    id: 1,
    name: "create_database_connections",
    sql: "
    CREATE TABLE IF NOT EXISTS database_connections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        connection_type TEXT NOT NULL,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        database TEXT NOT NULL,
        username TEXT NOT NULL,
        password BLOB NOT NULL,
        ssl_mode TEXT NOT NULL DEFAULT 'prefer',
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        is_active INTEGER NOT NULL DEFAULT 1,

        CONSTRAINT valid_name CHECK (length(name) > 0 AND name NOT GLOB '*[^a-z0-9_-]*'),
        CONSTRAINT valid_connection_type CHECK (connection_type IN ('postgresql', 'mysql')),
        CONSTRAINT valid_port CHECK (port > 0 AND port < 65536),
        CONSTRAINT valid_ssl_mode CHECK (
            ssl_mode IN ('disable', 'allow', 'prefer', 'require', 'verify-ca', 'verify-full')
        ),
        CONSTRAINT valid_is_active CHECK (is_active IN (0, 1))
    );

    CREATE TRIGGER IF NOT EXISTS update_database_connections_updated_at
        AFTER UPDATE ON database_connections
        FOR EACH ROW
        WHEN NEW.updated_at = OLD.updated_at
    BEGIN
        UPDATE database_connections
        SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        WHERE id = NEW.id;
    END;

    CREATE INDEX IF NOT EXISTS idx_database_connections_name
        ON database_connections(name);

    CREATE INDEX IF NOT EXISTS idx_database_connections_is_active
        ON database_connections(is_active);
    ",
};

pub const SEED_SAMPLE_CONNECTION: Migration = Migration {
    id: 2,
    name: "seed_sample_connection",
    sql: "
    INSERT INTO database_connections (
        name, connection_type, host, port, database, username, password, ssl_mode
    ) VALUES (
        'sample', 'postgresql', 'sample-db', 5432, 'postgres', 'postgres',
        'encrypted_password_placeholder', 'prefer'
    )
    ON CONFLICT(name) DO NOTHING;
    ",
};

pub const MIGRATIONS: &[Migration] = &[CREATE_DATABASE_CONNECTIONS, SEED_SAMPLE_CONNECTION];

pub const SECRET_INJECTIONS: &[SecretInjection] = &[SecretInjection {
    migration_id: 2,
    placeholder: SAMPLE_PASSWORD_PLACEHOLDER,
    secret: SecretSource::SampleDbPassword,
}];
