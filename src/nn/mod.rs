pub mod activation;
pub mod dropout;
pub mod embedding;
pub mod init;
pub mod layernorm;
pub mod linear;
pub mod loss;
pub mod params;

pub use activation::gelu;
pub use dropout::Dropout;
pub use embedding::Embedding;
pub use layernorm::LayerNorm;
pub use linear::Linear;
pub use loss::cross_entropy_loss;
pub use params::ParamStore;
