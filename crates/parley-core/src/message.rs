//! Timestamps, delivery IDs and payload validation for routed messages.

use parley_protocol::{Attachment, ConnectionId, MessageId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Minimum display name length, in characters.
pub const MIN_DISPLAY_NAME_LENGTH: usize = 3;

/// Maximum display name length, in characters.
pub const MAX_DISPLAY_NAME_LENGTH: usize = 20;

/// Maximum reaction length in bytes.
pub const MAX_EMOJI_LENGTH: usize = 32;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Timestamp source for a router instance.
///
/// Every call returns a value strictly greater than the previous one, even
/// when the wall clock stalls or steps backwards.
#[derive(Debug, Default)]
pub struct Clock {
    last: AtomicU64,
}

impl Clock {
    /// Create a new clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp in milliseconds.
    pub fn now(&self) -> u64 {
        let wall = now_millis();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(wall.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        wall.max(previous + 1)
    }
}

/// Delivery ID used when the persistence sink did not assign one.
///
/// Unique per router because [`Clock`] never repeats a timestamp.
#[must_use]
pub fn fallback_delivery_id(timestamp: u64, sender: &ConnectionId) -> MessageId {
    format!("{timestamp}-{sender}")
}

/// Validate and normalize a display name.
///
/// # Errors
///
/// Returns an error message if the trimmed name is too short or too long.
pub fn validate_display_name(name: &str) -> Result<String, &'static str> {
    let name = name.trim();
    let len = name.chars().count();
    if len < MIN_DISPLAY_NAME_LENGTH {
        return Err("Display name must be at least 3 characters");
    }
    if len > MAX_DISPLAY_NAME_LENGTH {
        return Err("Display name must be at most 20 characters");
    }
    if name.chars().any(char::is_control) {
        return Err("Display name contains invalid characters");
    }
    Ok(name.to_string())
}

/// Validate a message body and its attachment.
///
/// # Errors
///
/// Returns an error message if the message is empty or too large.
pub fn validate_body(
    body: &str,
    attachment: Option<&Attachment>,
    max_len: usize,
) -> Result<(), &'static str> {
    if body.trim().is_empty() && attachment.is_none() {
        return Err("Message cannot be empty");
    }
    let size = body.len() + attachment.map_or(0, Attachment::encoded_len);
    if size > max_len {
        return Err("Message too large");
    }
    Ok(())
}

/// Validate a reaction emoji.
///
/// # Errors
///
/// Returns an error message if the emoji is empty or too long.
pub fn validate_emoji(emoji: &str) -> Result<(), &'static str> {
    if emoji.trim().is_empty() {
        return Err("Reaction cannot be empty");
    }
    if emoji.len() > MAX_EMOJI_LENGTH {
        return Err("Reaction too long");
    }
    Ok(())
}
