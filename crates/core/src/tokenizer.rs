//! Token counting and token-bounded splitting
//!
//! Uses the `o200k_base` BPE (GPT-4o family). Text is split on whitespace
//! into segments first so that window boundaries never fall inside a word or
//! a multi-byte character; windows are then grown segment by segment.

use crate::{CoreError, Result};
use std::sync::{Arc, OnceLock};
use tiktoken_rs::CoreBPE;

static SHARED_BPE: OnceLock<Option<Arc<CoreBPE>>> = OnceLock::new();

/// Cheaply clonable handle to a BPE tokenizer
#[derive(Clone)]
pub struct Tokenizer {
    bpe: Arc<CoreBPE>,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer").finish_non_exhaustive()
    }
}

/// A contiguous window of text and its token count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenWindow {
    pub content: String,
    pub tokens: usize,
}

impl Tokenizer {
    /// Process-wide shared tokenizer; the BPE tables are built once.
    pub fn shared() -> Result<Self> {
        let bpe = SHARED_BPE
            .get_or_init(|| tiktoken_rs::o200k_base().ok().map(Arc::new))
            .clone()
            .ok_or_else(|| CoreError::Tokenizer("failed to load o200k_base".into()))?;
        Ok(Self { bpe })
    }

    /// Number of tokens in `text`
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Split `text` into windows of at most `max_tokens` tokens, consecutive
    /// windows sharing roughly `overlap` tokens. Deterministic for identical input.
    pub fn windows(&self, text: &str, max_tokens: usize, overlap: usize) -> Vec<TokenWindow> {
        let max_tokens = max_tokens.max(1);
        let segments = self.segments(text, max_tokens);
        let mut windows = Vec::new();
        let mut start = 0;

        while start < segments.len() {
            let mut end = start;
            let mut total = 0;
            while end < segments.len() && total + segments[end].1 <= max_tokens {
                total += segments[end].1;
                end += 1;
            }
            if end == start {
                end = start + 1;
            }

            // Segment counts are an estimate of the joined count; verify.
            let mut content = join_segments(&segments[start..end]);
            let mut tokens = self.count(&content);
            while tokens > max_tokens && end > start + 1 {
                end -= 1;
                content = join_segments(&segments[start..end]);
                tokens = self.count(&content);
            }

            if !content.is_empty() {
                windows.push(TokenWindow { content, tokens });
            }

            if end >= segments.len() {
                break;
            }

            let mut next = end;
            let mut shared = 0;
            while next > start + 1 && shared + segments[next - 1].1 <= overlap {
                shared += segments[next - 1].1;
                next -= 1;
            }
            start = next;
        }

        windows
    }

    /// Longest whitespace-aligned prefix of `text` within `max_tokens`.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if self.count(text) <= max_tokens {
            return text.to_string();
        }
        self.windows(text, max_tokens, 0)
            .into_iter()
            .next()
            .map(|w| w.content)
            .unwrap_or_default()
    }

    /// Whitespace-inclusive segments, each no larger than `max_tokens`.
    fn segments<'a>(&self, text: &'a str, max_tokens: usize) -> Vec<(&'a str, usize)> {
        let mut out = Vec::new();
        for piece in text.split_inclusive(char::is_whitespace) {
            let count = self.count(piece);
            if count <= max_tokens {
                out.push((piece, count));
                continue;
            }
            // A single char is at most four byte-level tokens.
            let step = (max_tokens / 4).max(1);
            let mut begin = 0;
            let mut taken = 0;
            for (idx, _) in piece.char_indices() {
                if taken == step {
                    let part = &piece[begin..idx];
                    out.push((part, self.count(part)));
                    begin = idx;
                    taken = 0;
                }
                taken += 1;
            }
            let part = &piece[begin..];
            if !part.is_empty() {
                out.push((part, self.count(part)));
            }
        }
        out
    }
}

fn join_segments(segments: &[(&str, usize)]) -> String {
    let joined: String = segments.iter().map(|(s, _)| *s).collect();
    joined.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> Tokenizer {
        Tokenizer::shared().expect("tokenizer")
    }

    #[test]
    fn test_count_empty_and_simple() {
        let t = tokenizer();
        assert_eq!(t.count(""), 0);
        assert!(t.count("Alice works at Acme Corp.") > 3);
    }

    #[test]
    fn test_windows_respect_budget() {
        let t = tokenizer();
        let text = "word ".repeat(500);
        let windows = t.windows(&text, 50, 10);
        assert!(windows.len() > 5);
        for w in &windows {
            assert!(w.tokens <= 50, "window has {} tokens", w.tokens);
            assert_eq!(w.tokens, t.count(&w.content));
        }
    }

    #[test]
    fn test_windows_without_overlap_cover_text() {
        let t = tokenizer();
        let text = (0..200).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        let windows = t.windows(&text, 40, 0);
        let rebuilt = windows
            .iter()
            .map(|w| w.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_long_word_is_split() {
        let t = tokenizer();
        let text = "x".repeat(5000);
        let windows = t.windows(&text, 64, 0);
        assert!(windows.len() > 1);
        assert!(windows.iter().all(|w| w.tokens <= 64));
    }

    #[test]
    fn test_truncate() {
        let t = tokenizer();
        let text = "alpha beta gamma delta ".repeat(100);
        let cut = t.truncate(&text, 20);
        assert!(t.count(&cut) <= 20);
        assert!(text.starts_with(&cut));
        assert_eq!(t.truncate("short", 20), "short");
    }
}
