pub mod connection_store;
pub mod migrations;
pub mod migrator;
pub mod model;
pub mod store;
pub mod validation;

pub use connection_store::{ConnectionRegistry, ConnectionStore};
pub use migrations::{MIGRATIONS, Migration, MigrationSecrets, SECRET_INJECTIONS, SecretInjection, SecretSource};
pub use migrator::{MigrationReport, Migrator, run_migrations};
pub use model::{
    ConnectionInfo, ConnectionType, ConnectionUpdate, NewConnection, SslMode, StoredCredentials,
};
pub use store::{MetadataStore, StoreOptions};
