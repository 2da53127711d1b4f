use sqlx::Connection;
use sqlx::postgres::PgConnection;
use std::sync::Arc;
use std::time::Duration;
use trove_common::{ConnectionId, Error, Result};
use trove_db::{ConnectionStore, ConnectionType};
use trove_security::Vault;
use tracing::{error, info};

use crate::target::{ConnectionTarget, TargetConnection};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Turns a connection id into a ready-to-use target.
///
/// Every call re-reads the registry row and re-decrypts the password; nothing
/// is cached and targets are not pooled.
#[derive(Clone)]
pub struct ConnectionBroker {
    registry: ConnectionStore,
    vault: Arc<Vault>,
    connect_timeout: Duration,
}

impl ConnectionBroker {
    pub fn new(registry: ConnectionStore, vault: Arc<Vault>) -> Self {
        Self {
            registry,
            vault,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub async fn resolve_connection(&self, id: ConnectionId) -> Result<ConnectionTarget> {
        let stored = self.registry.find_credentials(id).await.inspect_err(|e| {
            if !e.is_client_error() {
                error!("failed to look up connection {id}: {e}");
            }
        })?;

        let password = self.vault.decrypt(&stored.password).map_err(|e| {
            error!("failed to decrypt password for connection {id}: {e}");
            Error::Credential(format!("failed to decrypt password for connection {id}"))
        })?;

        let protocol = match stored.connection_type.parse::<ConnectionType>() {
            Ok(ConnectionType::Postgresql) => ConnectionType::Postgresql,
            _ => {
                error!(
                    "connection {id} has unsupported type {}",
                    stored.connection_type
                );
                return Err(Error::UnsupportedType(format!(
                    "{} (only postgresql connections are supported)",
                    stored.connection_type
                )));
            }
        };

        Ok(ConnectionTarget {
            id,
            protocol,
            host: stored.host,
            port: stored.port,
            database: stored.database,
            username: stored.username,
            password,
            ssl_mode: stored.ssl_mode,
        })
    }

    /// Resolve `id` and open a live connection to it within the connect timeout.
    pub async fn connect(&self, id: ConnectionId) -> Result<TargetConnection> {
        let target = self.resolve_connection(id).await?;
        let options = target.connect_options();

        let conn = tokio::time::timeout(self.connect_timeout, PgConnection::connect_with(&options))
            .await
            .map_err(|_| {
                error!(
                    "timed out after {}s connecting to {}",
                    self.connect_timeout.as_secs_f64(),
                    target.redacted_url()
                );
                Error::Upstream(format!("timed out connecting to connection {id}"))
            })?
            .map_err(|e| {
                error!("failed to connect to {}: {e}", target.redacted_url());
                Error::Upstream(format!("failed to connect to connection {id}"))
            })?;

        info!("connected to {}", target.redacted_url());
        Ok(TargetConnection::new(id, conn))
    }
}
