//! Structural validation for inbound socket payloads.
//!
//! Socket events arrive as arbitrary JSON; every gateway handler validates
//! shape and field formats here before touching any state, rejecting with a
//! typed error.

use regex::Regex;
use std::sync::LazyLock;

use crate::{Error, Result};

/// Maximum lengths for inbound fields
pub mod limits {
    /// Maximum id length (`job_id`, `room_id`, message id)
    pub const ID_MAX: usize = 128;
    /// Maximum display-name length
    pub const DISPLAY_NAME_MAX: usize = 64;
    /// Maximum room password length
    pub const PASSWORD_MAX: usize = 128;
}

mod patterns {
    use super::{LazyLock, Regex};

    /// Ids: word characters, dots, colons, hyphens. No whitespace.
    pub static ID: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._:-]+$").expect("Invalid id regex"));

    /// Control characters that must not appear in display names.
    pub static CONTROL_CHARS: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").expect("Invalid control char regex")
    });
}

/// Validate an opaque id field (job id, room id, message id, producer id).
pub fn validate_id(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidInput(format!("{field} is required")));
    }
    if value.len() > limits::ID_MAX {
        return Err(Error::InvalidInput(format!(
            "{field} exceeds {} characters",
            limits::ID_MAX
        )));
    }
    if !patterns::ID.is_match(value) {
        return Err(Error::InvalidInput(format!(
            "{field} contains invalid characters"
        )));
    }
    Ok(())
}

/// Validate a user-facing display name.
pub fn validate_display_name(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidInput("userName is required".to_string()));
    }
    if value.len() > limits::DISPLAY_NAME_MAX {
        return Err(Error::InvalidInput(format!(
            "userName exceeds {} characters",
            limits::DISPLAY_NAME_MAX
        )));
    }
    if patterns::CONTROL_CHARS.is_match(value) {
        return Err(Error::InvalidInput(
            "userName contains control characters".to_string(),
        ));
    }
    Ok(())
}

/// Validate an optional room password.
pub fn validate_password(value: &str) -> Result<()> {
    if value.len() > limits::PASSWORD_MAX {
        return Err(Error::InvalidInput(format!(
            "password exceeds {} characters",
            limits::PASSWORD_MAX
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        assert!(validate_id("jobId", "j1").is_ok());
        assert!(validate_id("jobId", "550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_id("roomId", "room_42.a:b").is_ok());
    }

    #[test]
    fn test_invalid_ids() {
        assert!(validate_id("jobId", "").is_err());
        assert!(validate_id("jobId", "has space").is_err());
        assert!(validate_id("jobId", "semi;colon").is_err());
        assert!(validate_id("jobId", &"x".repeat(200)).is_err());
    }

    #[test]
    fn test_display_names() {
        assert!(validate_display_name("Alice").is_ok());
        assert!(validate_display_name("Alice B.").is_ok());
        assert!(validate_display_name("").is_err());
        assert!(validate_display_name("bad\u{0007}name").is_err());
        assert!(validate_display_name(&"x".repeat(100)).is_err());
    }

    #[test]
    fn test_passwords() {
        assert!(validate_password("").is_ok());
        assert!(validate_password("s3cret").is_ok());
        assert!(validate_password(&"x".repeat(200)).is_err());
    }
}
