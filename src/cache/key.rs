//! Cache key derivation.
//!
//! Keys must be stable across processes because the persistent tier outlives
//! the process, so they are a SHA-256 digest rather than `DefaultHasher`.

use sha2::{Digest, Sha256};

use crate::types::Category;

/// Normalize a query so trivially different phrasings share a key.
///
/// Lower-cases, collapses runs of whitespace and strips trailing `?`, `!`
/// and `.` characters.
pub fn normalize_query(query: &str) -> String {
    let collapsed = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(['?', '!', '.'])
        .trim_end()
        .to_string()
}

/// Stable key for a query within a category.
pub fn cache_key(query: &str, category: Category) -> String {
    let mut hasher = Sha256::new();
    hasher.update(category.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(normalize_query(query).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
