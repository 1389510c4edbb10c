//! Position identity — deterministic content-addressed IDs for stances.
//!
//! A position's ID is a pure function of its text: the first 12 hex
//! characters of SHA-256 over the normalized text. Identical normalized
//! texts produce identical IDs across rounds, sessions, and processes.

use sha2::{Digest, Sha256};

/// Number of hex characters retained from the SHA-256 digest.
pub const POSITION_ID_LEN: usize = 12;

/// Maximum position text length after trimming.
pub const MAX_POSITION_TEXT: usize = 4000;

/// Maximum reasoning length after trimming.
pub const MAX_REASONING_TEXT: usize = 8000;

/// Normalize position text for hashing: trim, collapse internal whitespace
/// runs to single spaces, lower-case.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Compute the 12-character lowercase hex position ID for a text.
///
/// The ID is stable under leading/trailing whitespace, internal whitespace
/// runs, and letter case.
pub fn position_id(text: &str) -> String {
    let digest = Sha256::digest(normalize(text).as_bytes());
    let mut id = String::with_capacity(POSITION_ID_LEN);
    for byte in digest.iter() {
        id.push_str(&format!("{:02x}", byte));
        if id.len() >= POSITION_ID_LEN {
            break;
        }
    }
    id.truncate(POSITION_ID_LEN);
    id
}

/// Validate position text bounds (1–4000 chars after trimming).
pub fn validate_position_text(text: &str) -> Result<&str, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("position text is empty after trimming".to_string());
    }
    if trimmed.chars().count() > MAX_POSITION_TEXT {
        return Err(format!(
            "position text exceeds {} chars after trimming",
            MAX_POSITION_TEXT
        ));
    }
    Ok(trimmed)
}

/// Validate reasoning text bounds (1–8000 chars after trimming).
pub fn validate_reasoning_text(text: &str) -> Result<&str, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("reasoning is empty after trimming".to_string());
    }
    if trimmed.chars().count() > MAX_REASONING_TEXT {
        return Err(format!(
            "reasoning exceeds {} chars after trimming",
            MAX_REASONING_TEXT
        ));
    }
    Ok(trimmed)
}
