//! Sandbox and container identifiers.

/// Length of the abbreviated id used in logs and on-disk names.
pub const SHORT_ID_LEN: usize = 12;

/// Generate a new 64-character hex identifier.
pub fn generate_id() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

/// Abbreviate an id for display.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
