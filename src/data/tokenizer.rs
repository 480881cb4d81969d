//! Text <-> token id codec.

use crate::error::{Error, Result};

/// Literal accepted in text input and mapped to [`Tokenizer::eot_token`].
pub const END_OF_TEXT: &str = "<|endoftext|>";

/// Opaque text codec used by the data pipeline and the sampler.
pub trait Tokenizer: Send + Sync {
    /// Encode text to token ids. Occurrences of [`END_OF_TEXT`] map to the EOT id.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids to text.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Reserved end-of-text id.
    fn eot_token(&self) -> u32;

    /// Number of distinct ids this tokenizer can produce.
    fn vocab_size(&self) -> usize;
}

/// Byte-level tokenizer: every UTF-8 byte is its own id, plus one EOT id (256).
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    const EOT: u32 = 256;
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(text.len());
        let mut pieces = text.split(END_OF_TEXT).peekable();
        while let Some(piece) = pieces.next() {
            ids.extend(piece.bytes().map(u32::from));
            if pieces.peek().is_some() {
                ids.push(Self::EOT);
            }
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut out = String::new();
        let mut bytes = Vec::new();
        for &id in ids {
            match id {
                0..=255 => bytes.push(id as u8),
                Self::EOT => {
                    out.push_str(&String::from_utf8_lossy(&bytes));
                    bytes.clear();
                    out.push_str(END_OF_TEXT);
                }
                _ => {
                    return Err(Error::TokenizerError {
                        reason: format!("token id {id} outside byte vocabulary"),
                    });
                }
            }
        }
        out.push_str(&String::from_utf8_lossy(&bytes));
        Ok(out)
    }

    fn eot_token(&self) -> u32 {
        Self::EOT
    }

    fn vocab_size(&self) -> usize {
        257
    }
}
