//! Memory-mapped pre-tokenized corpora.
//!
//! Reads raw binary files of contiguous little-endian `u32` token ids.
//! Backed by `mmap` so only accessed pages are loaded into RAM; every
//! worker on a host shares the same page cache.

use std::path::Path;

use memmap2::Mmap;

use crate::error::{Error, Result};

/// Read-only view of a `u32` token file.
pub struct MappedTokens {
    mmap: Mmap,
    num_tokens: usize,
}

impl MappedTokens {
    /// Map a token file. The file has no header; its size must be a multiple of 4.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| Error::DataError {
            reason: format!("failed to open {}: {e}", path.display()),
        })?;

        let file_len = file.metadata()?.len() as usize;
        if file_len % 4 != 0 {
            return Err(Error::DataError {
                reason: format!(
                    "{}: size {file_len} is not a multiple of 4 (expected u32 tokens)",
                    path.display()
                ),
            });
        }

        // SAFETY: opened read-only; the mapping is never written through.
        let mmap = unsafe { Mmap::map(&file)? };

        // Page-aligned and a whole number of u32s, checked here once.
        bytemuck::try_cast_slice::<u8, u32>(&mmap).map_err(|e| Error::DataError {
            reason: format!("{}: cannot view as u32 tokens: {e}", path.display()),
        })?;
        if cfg!(target_endian = "big") {
            return Err(Error::DataError {
                reason: "memory-mapped token files require a little-endian host".into(),
            });
        }

        Ok(Self {
            mmap,
            num_tokens: file_len / 4,
        })
    }

    pub fn len(&self) -> usize {
        self.num_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.num_tokens == 0
    }

    pub fn tokens(&self) -> &[u32] {
        // Validated in `open`.
        bytemuck::try_cast_slice(&self.mmap).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::{Dataset, SequenceDataset, TokenStream};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_token_file(tokens: &[u32]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        for &t in tokens {
            f.write_all(&t.to_le_bytes()).unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_open_and_read() {
        let tokens: Vec<u32> = (100..120).collect();
        let f = write_token_file(&tokens);
        let mapped = MappedTokens::open(f.path()).unwrap();
        assert_eq!(mapped.len(), 20);
        assert_eq!(mapped.tokens(), tokens.as_slice());
    }

    #[test]
    fn test_bad_size_rejected() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&[1, 2, 3]).unwrap();
        f.flush().unwrap();
        assert!(MappedTokens::open(f.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(MappedTokens::open("/nonexistent/tokens.bin").is_err());
    }

    #[test]
    fn test_feeds_sequence_dataset() {
        let tokens: Vec<u32> = (0..17).collect();
        let f = write_token_file(&tokens);
        let stream = TokenStream::from_mapped(MappedTokens::open(f.path()).unwrap());
        let ds = SequenceDataset::new(stream, 4, 4).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.get(2).unwrap().targets, &[9, 10, 11, 12]);
    }
}
