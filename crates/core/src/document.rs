//! Documents and their token-bounded chunks

use crate::hashing::{compute_id, CHUNK_PREFIX, DOC_PREFIX};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw ingested document. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// `doc-` + content hash
    pub id: String,

    /// Trimmed document text
    pub content: String,

    /// When this document was first ingested
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Create a document from raw text; surrounding whitespace is not part of the identity.
    pub fn new(content: impl AsRef<str>) -> Self {
        let content = content.as_ref().trim().to_string();
        Self {
            id: compute_id(DOC_PREFIX, &content),
            content,
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// An ordered slice of a document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextChunk {
    /// `chunk-` + content hash; the dedup key
    pub id: String,

    /// Chunk text
    pub content: String,

    /// Token count of `content`
    pub tokens: usize,

    /// Originating document
    pub full_doc_id: String,

    /// Position within the originating document
    pub chunk_order_index: usize,
}

impl TextChunk {
    pub fn new(
        content: impl Into<String>,
        tokens: usize,
        full_doc_id: impl Into<String>,
        chunk_order_index: usize,
    ) -> Self {
        let content = content.into();
        Self {
            id: compute_id(CHUNK_PREFIX, &content),
            content,
            tokens,
            full_doc_id: full_doc_id.into(),
            chunk_order_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_identity_ignores_surrounding_whitespace() {
        let a = Document::new("  Alice works at Acme Corp.\n");
        let b = Document::new("Alice works at Acme Corp.");
        assert_eq!(a.id, b.id);
        assert_eq!(a.content, "Alice works at Acme Corp.");
    }

    #[test]
    fn test_chunk_id_depends_on_content_only() {
        let a = TextChunk::new("same text", 2, "doc-a", 0);
        let b = TextChunk::new("same text", 2, "doc-b", 3);
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("chunk-"));
    }
}
