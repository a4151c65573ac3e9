//! Content-derived identifiers

use sha2::{Digest, Sha256};

/// Prefix for document identifiers
pub const DOC_PREFIX: &str = "doc-";
/// Prefix for chunk identifiers
pub const CHUNK_PREFIX: &str = "chunk-";
/// Prefix for entity vector records
pub const ENTITY_PREFIX: &str = "ent-";

/// Hex SHA-256 of `content` with a namespace prefix.
pub fn compute_id(prefix: &str, content: &str) -> String {
    format!("{}{}", prefix, hash_hex(content))
}

/// Hex SHA-256 of a string.
pub fn hash_hex(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Hash a sequence of parts with an unambiguous separator.
pub fn hash_parts<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_id_is_stable() {
        let a = compute_id(DOC_PREFIX, "hello");
        let b = compute_id(DOC_PREFIX, "hello");
        assert_eq!(a, b);
        assert!(a.starts_with("doc-"));
        assert_eq!(a.len(), DOC_PREFIX.len() + 64);
    }

    #[test]
    fn test_hash_parts_is_unambiguous() {
        assert_ne!(hash_parts(["ab", "c"]), hash_parts(["a", "bc"]));
        assert_eq!(hash_parts(["a", "b"]), hash_parts(vec!["a".to_string(), "b".to_string()]));
    }
}
