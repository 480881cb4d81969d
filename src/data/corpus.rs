//! Corpus loading and the train/validation split.

use std::path::Path;

use crate::data::dataset::TokenStream;
use crate::data::mmap::MappedTokens;
use crate::data::tokenizer::Tokenizer;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CorpusFormat {
    /// UTF-8 text, tokenized at startup.
    #[default]
    Text,
    /// Raw little-endian u32 token ids, memory-mapped.
    Tokens,
}

/// Split text at `floor(train_ratio * chars)` characters and tokenize both
/// halves separately.
pub fn split_text<T: Tokenizer + ?Sized>(
    text: &str,
    train_ratio: f64,
    tokenizer: &T,
) -> Result<(TokenStream, TokenStream)> {
    check_ratio(train_ratio)?;
    let chars = text.chars().count();
    let split_chars = (train_ratio * chars as f64) as usize;
    let split_byte = text
        .char_indices()
        .nth(split_chars)
        .map_or(text.len(), |(i, _)| i);
    let (train, val) = text.split_at(split_byte);
    Ok((
        TokenStream::from(tokenizer.encode(train)?),
        TokenStream::from(tokenizer.encode(val)?),
    ))
}

/// Split a token stream at `floor(train_ratio * len)` tokens.
pub fn split_tokens(tokens: &TokenStream, train_ratio: f64) -> Result<(TokenStream, TokenStream)> {
    check_ratio(train_ratio)?;
    tokens.split_at((train_ratio * tokens.len() as f64) as usize)
}

/// Read the corpus at `path` and return `(train, val)` token streams.
pub fn load_corpus<T: Tokenizer + ?Sized>(
    path: &Path,
    format: CorpusFormat,
    train_ratio: f64,
    tokenizer: &T,
) -> Result<(TokenStream, TokenStream)> {
    let (train, val) = match format {
        CorpusFormat::Text => {
            let text = std::fs::read_to_string(path).map_err(|e| Error::DataError {
                reason: format!("cannot read corpus {}: {e}", path.display()),
            })?;
            split_text(&text, train_ratio, tokenizer)?
        }
        CorpusFormat::Tokens => {
            let stream = TokenStream::from_mapped(MappedTokens::open(path)?);
            split_tokens(&stream, train_ratio)?
        }
    };
    tracing::info!(
        path = %path.display(),
        train_tokens = train.len(),
        val_tokens = val.len(),
        "corpus loaded"
    );
    Ok((train, val))
}

fn check_ratio(train_ratio: f64) -> Result<()> {
    if !(train_ratio > 0.0 && train_ratio < 1.0) {
        return Err(Error::InvalidArgument {
            arg: "train_ratio",
            reason: format!("must be in (0, 1), got {train_ratio}"),
        });
    }
    Ok(())
}
