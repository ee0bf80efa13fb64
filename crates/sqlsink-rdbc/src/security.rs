//! Identifier validation for values that end up spliced into SQL text.
//!
//! Execution options (the target database/namespace of a channel) are not
//! bound as parameters, so they must be plain identifiers before a backend
//! interpolates them into `SET search_path` or `USE` statements.

use crate::error::Error;

/// Validate a SQL identifier (database, schema or namespace names).
///
/// Enforces strict character rules:
/// - Must not be empty
/// - Maximum 255 characters
/// - Must start with ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters and underscores
///
/// # Examples
///
/// ```
/// use sqlsink_rdbc::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("metrics").is_ok());
/// assert!(validate_sql_identifier("_staging_2").is_ok());
///
/// assert!(validate_sql_identifier("x; DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("123abc").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > 255 {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max 255)",
            name.len()
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': contains invalid character '{}'",
                name, c
            )));
        }
    }

    Ok(())
}

/// Validate and double-quote an identifier (ANSI quoting).
pub fn quote_identifier(name: &str) -> crate::Result<String> {
    validate_sql_identifier(name)?;
    Ok(format!("\"{}\"", name))
}
