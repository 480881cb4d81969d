pub mod collate;
pub mod corpus;
pub mod dataset;
pub mod loader;
pub mod mmap;
pub mod sampler;
pub mod tokenizer;

pub use collate::SplitMix64;
pub use corpus::{CorpusFormat, load_corpus, split_text, split_tokens};
pub use dataset::{Batch, Dataset, Example, SequenceDataset, TokenStream};
pub use loader::{DataLoader, DataLoaderIter, LoaderCursor};
pub use mmap::MappedTokens;
pub use sampler::DistributedSampler;
pub use tokenizer::{ByteTokenizer, END_OF_TEXT, Tokenizer};
