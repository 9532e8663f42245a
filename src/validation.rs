//! Validation for topic, group and consumer names.
//!
//! Names end up embedded in store keys such as `logq:{topic}:{group}:consumer`,
//! so they must never contain the key separator or anything a store backend
//! could misinterpret.
//!
//! # Validation Rules
//!
//! All names must:
//! - Not be empty
//! - Not exceed their maximum length
//! - Contain only ASCII alphanumeric characters, dots (`.`), underscores (`_`), and hyphens (`-`)
//! - Not be "." or ".."
//! - Not start with a hyphen
//!
//! ```
//! use logq::validation::{validate_topic_name, validate_group_name};
//!
//! assert!(validate_topic_name("send_email").is_ok());
//! assert!(validate_group_name("email-workers").is_ok());
//!
//! assert!(validate_topic_name("").is_err());
//! assert!(validate_group_name("a:b").is_err());
//! ```

use crate::error::{QueueError, QueueResult};

/// Maximum length for topic names.
pub const MAX_TOPIC_NAME_LENGTH: usize = 249;

/// Maximum length for consumer group names.
pub const MAX_GROUP_NAME_LENGTH: usize = 255;

/// Maximum length for consumer names.
pub const MAX_CONSUMER_NAME_LENGTH: usize = 255;

/// Validate a topic name.
pub fn validate_topic_name(topic: &str) -> QueueResult<()> {
    validate_identifier(topic, MAX_TOPIC_NAME_LENGTH, "topic name")
}

/// Validate a consumer group name.
pub fn validate_group_name(group: &str) -> QueueResult<()> {
    validate_identifier(group, MAX_GROUP_NAME_LENGTH, "group name")
}

/// Validate a consumer name.
pub fn validate_consumer_name(consumer: &str) -> QueueResult<()> {
    validate_identifier(consumer, MAX_CONSUMER_NAME_LENGTH, "consumer name")
}

fn validate_identifier(value: &str, max_len: usize, kind: &'static str) -> QueueResult<()> {
    let invalid = |reason: String| QueueError::InvalidName { kind, reason };

    if value.is_empty() {
        return Err(invalid("cannot be empty".to_string()));
    }

    if value.len() > max_len {
        return Err(invalid(format!(
            "'{}' is too long ({} chars, max {} chars)",
            truncate_for_display(value, 50),
            value.len(),
            max_len
        )));
    }

    if value == "." || value == ".." {
        return Err(invalid("cannot be '.' or '..'".to_string()));
    }

    if value.starts_with('-') {
        return Err(invalid(format!(
            "'{}' cannot start with a hyphen",
            truncate_for_display(value, 50)
        )));
    }

    for (i, c) in value.chars().enumerate() {
        let is_valid = c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-';
        if !is_valid {
            return Err(invalid(format!(
                "invalid character '{}' (U+{:04X}) at position {}. \
                 Only ASCII letters, digits, '.', '_', and '-' are allowed",
                c.escape_default(),
                c as u32,
                i
            )));
        }
    }

    Ok(())
}

fn truncate_for_display(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len])
    }
}
