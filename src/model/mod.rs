pub mod config;
pub mod generate;
pub mod gpt;
pub mod traits;

pub use config::GptConfig;
pub use generate::generate_greedy;
pub use gpt::GptModel;
pub use traits::{LanguageModel, ModelClient};
