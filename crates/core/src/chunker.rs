//! Deterministic token-size chunking

use crate::document::{Document, TextChunk};
use crate::tokenizer::Tokenizer;
use crate::{CoreError, Result};

/// Default maximum tokens per chunk
pub const DEFAULT_CHUNK_TOKEN_SIZE: usize = 1200;
/// Default overlap between consecutive chunks
pub const DEFAULT_CHUNK_OVERLAP_TOKEN_SIZE: usize = 100;

/// Splits documents into token-bounded chunks
#[derive(Debug, Clone)]
pub struct Chunker {
    tokenizer: Tokenizer,
    max_tokens: usize,
    overlap_tokens: usize,
}

impl Chunker {
    pub fn new(tokenizer: Tokenizer, max_tokens: usize, overlap_tokens: usize) -> Result<Self> {
        if max_tokens == 0 || overlap_tokens >= max_tokens {
            return Err(CoreError::InvalidChunking {
                max_tokens,
                overlap: overlap_tokens,
            });
        }
        Ok(Self {
            tokenizer,
            max_tokens,
            overlap_tokens,
        })
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Chunk a single document in order.
    pub fn chunk(&self, document: &Document) -> Vec<TextChunk> {
        self.tokenizer
            .windows(&document.content, self.max_tokens, self.overlap_tokens)
            .into_iter()
            .enumerate()
            .map(|(index, window)| {
                TextChunk::new(window.content, window.tokens, document.id.clone(), index)
            })
            .collect()
    }
}
