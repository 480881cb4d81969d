//! Token streams, the dataset trait, and the sliding-window sequence dataset.

use std::ops::Range;
use std::sync::Arc;

use crate::data::mmap::MappedTokens;
use crate::error::{Error, Result};
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// A batch of training data: `[batch_size, seq_len]` token ids.
///
/// `targets` are `inputs` shifted by one position.
pub struct Batch<R: Runtime> {
    pub inputs: Tensor<R>,
    pub targets: Tensor<R>,
}

/// One `(input, target)` pair of equal-length windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Example<'a> {
    pub inputs: &'a [u32],
    pub targets: &'a [u32],
}

/// Trait for indexable example sources consumed by the loader.
pub trait Dataset: Send + Sync {
    /// Number of examples.
    fn len(&self) -> usize;

    /// Whether the dataset has no examples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Random access to one example.
    fn get(&self, idx: usize) -> Result<Example<'_>>;
}

enum TokenSource {
    Owned(Vec<u32>),
    Mapped(MappedTokens),
}

impl TokenSource {
    fn as_slice(&self) -> &[u32] {
        match self {
            TokenSource::Owned(v) => v,
            TokenSource::Mapped(m) => m.tokens(),
        }
    }
}

/// Immutable, cheaply cloneable sequence of token ids.
///
/// Sub-ranges share the underlying storage, so a train/val split costs nothing.
#[derive(Clone)]
pub struct TokenStream {
    source: Arc<TokenSource>,
    range: Range<usize>,
}

impl TokenStream {
    pub fn from_mapped(tokens: MappedTokens) -> Self {
        let len = tokens.len();
        Self {
            source: Arc::new(TokenSource::Mapped(tokens)),
            range: 0..len,
        }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.source.as_slice()[self.range.clone()]
    }

    /// Split at `mid`: `[0, mid)` and `[mid, len)`.
    pub fn split_at(&self, mid: usize) -> Result<(TokenStream, TokenStream)> {
        if mid > self.len() {
            return Err(Error::InvalidArgument {
                arg: "mid",
                reason: format!("split point {mid} beyond stream of {} tokens", self.len()),
            });
        }
        let split = self.range.start + mid;
        let head = TokenStream {
            source: Arc::clone(&self.source),
            range: self.range.start..split,
        };
        let tail = TokenStream {
            source: Arc::clone(&self.source),
            range: split..self.range.end,
        };
        Ok((head, tail))
    }
}

impl From<Vec<u32>> for TokenStream {
    fn from(tokens: Vec<u32>) -> Self {
        let len = tokens.len();
        Self {
            source: Arc::new(TokenSource::Owned(tokens)),
            range: 0..len,
        }
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("range", &self.range)
            .finish()
    }
}

/// Sliding-window dataset over a token stream.
///
/// Example `i` covers tokens `[i * stride, i * stride + max_length + 1)`:
/// the first `max_length` are the input, the last `max_length` the target.
/// The tail that cannot fill a full window is discarded.
#[derive(Clone, Debug)]
pub struct SequenceDataset {
    tokens: TokenStream,
    max_length: usize,
    stride: usize,
    len: usize,
}

impl SequenceDataset {
    pub fn new(tokens: TokenStream, max_length: usize, stride: usize) -> Result<Self> {
        if max_length == 0 {
            return Err(Error::InvalidArgument {
                arg: "max_length",
                reason: "must be > 0".into(),
            });
        }
        if stride == 0 {
            return Err(Error::InvalidArgument {
                arg: "stride",
                reason: "must be > 0".into(),
            });
        }
        let len = tokens.len().saturating_sub(max_length) / stride;
        Ok(Self {
            tokens,
            max_length,
            stride,
            len,
        })
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn tokens(&self) -> &TokenStream {
        &self.tokens
    }
}

impl Dataset for SequenceDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, idx: usize) -> Result<Example<'_>> {
        if idx >= self.len {
            return Err(Error::DataError {
                reason: format!("index {idx} out of bounds for dataset of size {}", self.len),
            });
        }
        let start = idx * self.stride;
        let window = &self.tokens.as_slice()[start..start + self.max_length + 1];
        Ok(Example {
            inputs: &window[..self.max_length],
            targets: &window[1..],
        })
    }
}
