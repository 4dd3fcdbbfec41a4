//! Topic name validation
//!
//! Topic names:
//! - Must be 1 to 128 characters
//! - May only contain ASCII letters, digits, `_`, `-`, `.` and `:`
//! - Must not start or end with `.`
//! - Must not contain empty levels (`..`)
//!
//! `.` separates a topic family root from its sub-topics, e.g. `chat.room42`
//! belongs to the `chat` family.

/// Maximum topic name length in bytes
pub const MAX_TOPIC_LENGTH: usize = 128;

/// Validate a topic name used in subscribe, unsubscribe and publish
pub fn validate_topic(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic cannot be empty");
    }

    if topic.len() > MAX_TOPIC_LENGTH {
        return Err("topic exceeds maximum length");
    }

    if !topic
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':'))
    {
        return Err("topic contains invalid characters");
    }

    if topic.starts_with('.') || topic.ends_with('.') {
        return Err("topic cannot start or end with a separator");
    }

    if topic.contains("..") {
        return Err("topic cannot contain empty levels");
    }

    Ok(())
}

/// Check whether a topic is the family root or one of its sub-topics
pub fn topic_in_family(topic: &str, root: &str) -> bool {
    match topic.strip_prefix(root) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}
