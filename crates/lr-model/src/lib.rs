//! `lr-model` - the llama-runtime core.
//!
//! This crate provides:
//! - The versioned model file format: reader, tensor catalog and writer
//! - A memory-mapping loader that binds every tensor to a compute backend
//! - The transformer forward pass as a split graph over an incremental
//!   KV cache
//! - A unigram-score subword tokenizer
//! - Contexts owning RNG, cache and buffers, with the sampling pipeline
//!   and timing counters attached
//! - Model requantization and session-file persistence

pub mod context;
pub mod error;
pub mod format;
pub mod hparams;
pub mod kv_cache;
pub mod loader;
pub mod model;
pub mod quantize;
pub mod session;
pub mod tokenizer;
pub mod vocab;

mod eval;
mod graph;
mod mmap;
#[cfg(test)]
mod test_support;

pub use context::{Context, ContextParams, Timings};
pub use error::{ModelError, Result};
pub use hparams::{Ftype, Hparams, ModelSize};
pub use kv_cache::KvCache;
pub use loader::{load_model, load_vocab};
pub use model::{Layer, Model};
pub use quantize::{quantize_model, QuantizeParams, QuantizeStats};
pub use session::{MAX_RNG_STATE, SESSION_MAGIC, SESSION_VERSION};
pub use tokenizer::tokenize;
pub use vocab::{token_bos, token_eos, token_nl, TokenScore, Vocab};

// the sampling pipeline types travel with the context API
pub use lr_sampler::{Prng, TokenData, TokenDataArray, TokenId, DEFAULT_SEED};
