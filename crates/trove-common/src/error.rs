use thiserror::Error;

use crate::types::MigrationId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Unknown or inactive connection, or a migration id out of range.
    #[error("not found: {0}")]
    NotFound(String),

    /// A field constraint was violated (pattern, range, enum value, unique name).
    #[error("validation error: {0}")]
    Validation(String),

    /// A stored secret could not be decrypted. Never carries plaintext or ciphertext.
    #[error("credential error: {0}")]
    Credential(String),

    #[error("unsupported connection type: {0}")]
    UnsupportedType(String),

    /// Opening or talking to a resolved target database failed.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("migration {id} failed: {reason}")]
    Migration { id: MigrationId, reason: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable code for collaborators (HTTP layer, CLI exit output).
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation_error",
            Self::Credential(_) => "credential_error",
            Self::UnsupportedType(_) => "unsupported_type",
            Self::Upstream(_) => "upstream_error",
            Self::Migration { .. } => "migration_failure",
            Self::Database(_) => "database_error",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// Message that is safe to hand back to a caller.
    ///
    /// Business errors keep their detail; anything that may carry driver
    /// output or secret material collapses to a generic message.
    pub fn public_message(&self) -> String {
        match self {
            Self::NotFound(_) | Self::Validation(_) | Self::UnsupportedType(_) => {
                self.to_string()
            }
            Self::Credential(_) => "failed to decrypt connection credentials".into(),
            Self::Upstream(_) => "failed to connect to database".into(),
            Self::Migration { id, .. } => format!("schema migration {id} failed"),
            _ => "internal error".into(),
        }
    }

    /// True for errors caused by the caller's input rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Validation(_) | Self::UnsupportedType(_)
        )
    }
}
