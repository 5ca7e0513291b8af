//! Deterministic cloud resource naming
//!
//! Reconcilers never store provider resource ids; they find their resources
//! again by name. Names are therefore pure functions of the listener inputs,
//! hashed down when the provider enforces a length limit.

use std::sync::LazyLock;

use md5::{Digest, Md5};

/// Characters the major providers refuse inside resource names
static INVALID_NAME_CHARS: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("[^a-zA-Z0-9-]+").expect("Invalid regex pattern"));

/// Hex MD5 of the input
pub fn md5_hex(input: &str) -> String {
    const_hex::encode(Md5::digest(input.as_bytes()))
}

/// Short stable hash suffix used inside length-limited names
pub fn short_hash(input: &str) -> String {
    md5_hex(input)[..8].to_string()
}

/// Replace characters providers reject with hyphens and strip the edges
pub fn sanitize_name(raw: &str) -> String {
    INVALID_NAME_CHARS
        .replace_all(raw, "-")
        .trim_matches('-')
        .to_string()
}

/// Build `{prefix}-{input}` bounded to `max_len` characters
///
/// When the sanitized name fits it is used as-is, so names stay readable.
/// Otherwise the head is truncated and an 8 character hash of the full
/// input keeps the result unique and stable.
pub fn compact_name(prefix: &str, input: &str, max_len: usize) -> String {
    let sanitized = sanitize_name(input);
    let full = format!("{}-{}", prefix, sanitized);
    if full.len() <= max_len {
        return full;
    }

    let hash = short_hash(input);
    // prefix + '-' + head + '-' + hash
    let head_budget = max_len.saturating_sub(prefix.len() + hash.len() + 2);
    let head = sanitized[..head_budget.min(sanitized.len())].trim_end_matches('-');
    format!("{}-{}-{}", prefix, head, hash)
}
