use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use trove_broker::ConnectionBroker;
use trove_common::ConnectionId;
use trove_db::{ConnectionInfo, ConnectionStore, ConnectionType, ConnectionUpdate, NewConnection, SslMode};

#[derive(Subcommand)]
pub enum ConnectionCommands {
    /// Register a target database
    Add(AddArgs),
    /// List registered connections
    List {
        /// Include soft-deleted connections
        #[arg(long)]
        all: bool,
    },
    /// Show one connection as JSON
    Get { id: ConnectionId },
    /// Change fields of a connection
    Update(UpdateArgs),
    /// Soft-delete a connection
    Delete { id: ConnectionId },
    /// Resolve a connection and print its target with the password masked
    Resolve { id: ConnectionId },
    /// Open a live connection and ping it
    Ping { id: ConnectionId },
}

#[derive(Args)]
pub struct AddArgs {
    /// Unique name (lowercase letters, digits, '-' and '_')
    pub name: String,

    #[arg(long = "type", default_value = "postgresql")]
    pub connection_type: ConnectionType,

    #[arg(long)]
    pub host: String,

    #[arg(long, default_value = "5432")]
    pub port: u16,

    #[arg(long)]
    pub database: String,

    #[arg(long)]
    pub username: String,

    #[arg(long, env = "TROVE_CONNECTION_PASSWORD", hide_env_values = true)]
    pub password: String,

    #[arg(long, default_value = "prefer")]
    pub ssl_mode: SslMode,
}

impl From<AddArgs> for NewConnection {
    fn from(args: AddArgs) -> Self {
        Self {
            name: args.name,
            connection_type: args.connection_type,
            host: args.host,
            port: args.port,
            database: args.database,
            username: args.username,
            password: args.password,
            ssl_mode: args.ssl_mode,
        }
    }
}

#[derive(Args)]
pub struct UpdateArgs {
    pub id: ConnectionId,

    #[arg(long)]
    pub name: Option<String>,

    #[arg(long = "type")]
    pub connection_type: Option<ConnectionType>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub database: Option<String>,

    #[arg(long)]
    pub username: Option<String>,

    /// New password. Only changed when passed explicitly.
    #[arg(long)]
    pub password: Option<String>,

    #[arg(long)]
    pub ssl_mode: Option<SslMode>,
}

impl UpdateArgs {
    fn into_parts(self) -> (ConnectionId, ConnectionUpdate) {
        (
            self.id,
            ConnectionUpdate {
                name: self.name,
                connection_type: self.connection_type,
                host: self.host,
                port: self.port,
                database: self.database,
                username: self.username,
                password: self.password,
                ssl_mode: self.ssl_mode,
            },
        )
    }
}

pub async fn run(
    action: ConnectionCommands,
    registry: ConnectionStore,
    broker: ConnectionBroker,
) -> Result<()> {
    match action {
        ConnectionCommands::Add(args) => {
            let info = registry.create(args.into()).await?;
            println!("registered connection {} ({})", info.id, info.name);
        }
        ConnectionCommands::List { all } => {
            let connections = registry.list(!all).await?;
            println!("Registered connections:");
            if connections.is_empty() {
                println!("  (none - add one with `trove connection add`)");
            }
            for c in &connections {
                println!("  {}", summary_line(c));
            }
        }
        ConnectionCommands::Get { id } => {
            let info = registry.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        ConnectionCommands::Update(args) => {
            let (id, update) = args.into_parts();
            if update.is_empty() {
                bail!("nothing to update; pass at least one field");
            }
            let info = registry.update(id, update).await?;
            println!("updated connection {} ({})", info.id, info.name);
        }
        ConnectionCommands::Delete { id } => {
            registry.delete(id).await?;
            println!("deleted connection {id}");
        }
        ConnectionCommands::Resolve { id } => {
            let target = broker.resolve_connection(id).await?;
            println!("{}", target.redacted_url());
        }
        ConnectionCommands::Ping { id } => {
            let mut conn = broker.connect(id).await?;
            conn.ping().await?;
            conn.close().await?;
            println!("connection {id} is reachable");
        }
    }

    Ok(())
}

fn summary_line(c: &ConnectionInfo) -> String {
    let status = if c.is_active { "" } else { " [deleted]" };
    format!(
        "{:>4}  {} [{}] {}@{}:{}/{}{status}",
        c.id.get(),
        c.name,
        c.connection_type,
        c.username,
        c.host,
        c.port,
        c.database
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn info(is_active: bool) -> ConnectionInfo {
        ConnectionInfo {
            id: ConnectionId::new(3),
            name: "warehouse".into(),
            connection_type: ConnectionType::Postgresql,
            host: "db".into(),
            port: 5432,
            database: "dw".into(),
            username: "etl".into(),
            ssl_mode: SslMode::Require,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            is_active,
        }
    }

    #[test]
    fn summary_marks_deleted_rows() {
        assert_eq!(
            summary_line(&info(true)),
            "   3  warehouse [postgresql] etl@db:5432/dw"
        );
        assert!(summary_line(&info(false)).ends_with(" [deleted]"));
    }

    #[test]
    fn update_args_without_fields_is_empty() {
        let args = UpdateArgs {
            id: ConnectionId::new(1),
            name: None,
            connection_type: None,
            host: None,
            port: None,
            database: None,
            username: None,
            password: None,
            ssl_mode: None,
        };
        let (id, update) = args.into_parts();
        assert_eq!(id, ConnectionId::new(1));
        assert!(update.is_empty());
    }
}
