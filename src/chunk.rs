//! Fixed-window overlapping text chunker.
//!
//! Splits extracted text into windows of at most `size` characters, where
//! the last `overlap` characters of each window are repeated at the start
//! of the next. Boundaries are measured in Unicode scalar values so a
//! window never splits inside a code point.
//!
//! Chunking is deterministic: identical input and parameters always produce
//! byte-identical output.

use crate::error::{Error, Result};

/// Chunking policy. Construction validates the parameters; an overlap at
/// or above the window size would never advance the window.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Validation("chunk size must be > 0".into()));
        }
        if overlap >= size {
            return Err(Error::Validation(format!(
                "chunk overlap ({overlap}) must be less than chunk size ({size})"
            )));
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split `text` into ordered overlapping chunks.
    ///
    /// Inputs no longer than `size` come back as a single chunk equal to
    /// the input, with no overlap applied. Otherwise the window slides
    /// forward by `size - overlap` characters until the text is exhausted;
    /// the final chunk may be shorter than `size`.
    pub fn split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= self.size {
            return vec![text.to_string()];
        }

        let stride = self.size - self.overlap;
        let mut chunks = Vec::new();
        let mut start = 0;

        loop {
            let end = (start + self.size).min(chars.len());
            chunks.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start += stride;
        }

        chunks
    }
}
