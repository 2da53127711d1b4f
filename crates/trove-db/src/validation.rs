use regex::Regex;
use std::sync::LazyLock;
use trove_common::{Error, Result};

use crate::model::{ConnectionUpdate, NewConnection};

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_-]+$").expect("name pattern is valid"));

const MAX_FIELD_LEN: usize = 255;

pub fn validate_name(name: &str) -> Result<()> {
    if !NAME_PATTERN.is_match(name) {
        return Err(Error::Validation(
            "name must be lowercase and contain only letters, numbers, underscores, and hyphens"
                .into(),
        ));
    }
    check_length("name", name)
}

pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(Error::Validation("port must be between 1 and 65535".into()));
    }
    Ok(())
}

fn validate_required(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{field} cannot be empty")));
    }
    check_length(field, value)
}

fn check_length(field: &str, value: &str) -> Result<()> {
    if value.len() > MAX_FIELD_LEN {
        return Err(Error::Validation(format!(
            "{field} must be at most {MAX_FIELD_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_new(conn: &NewConnection) -> Result<()> {
    validate_name(&conn.name)?;
    validate_port(conn.port)?;
    validate_required("host", &conn.host)?;
    validate_required("database", &conn.database)?;
    validate_required("username", &conn.username)?;
    Ok(())
}

/// Validate only the fields present in the update.
pub fn validate_update(update: &ConnectionUpdate) -> Result<()> {
    if let Some(name) = &update.name {
        validate_name(name)?;
    }
    if let Some(port) = update.port {
        validate_port(port)?;
    }
    if let Some(host) = &update.host {
        validate_required("host", host)?;
    }
    if let Some(database) = &update.database {
        validate_required("database", database)?;
    }
    if let Some(username) = &update.username {
        validate_required("username", username)?;
    }
    Ok(())
}
