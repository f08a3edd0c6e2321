//! `lr-sampler` - the sampling pipeline for llama-runtime.
//!
//! Filters mutate a [`TokenDataArray`] in place; terminal samplers consume
//! it and return a token id. All functions are total: empty candidate sets
//! yield no-ops or `None`, never errors.

pub mod candidates;
pub mod guidance;
pub mod mirostat;
pub mod penalties;
pub mod rng;
pub mod tail_free;
pub mod temperature;
pub mod token;
pub mod top_k;
pub mod top_p;
pub mod typical;

pub use candidates::{softmax, TokenData, TokenDataArray, TokenId};
pub use guidance::classifier_free_guidance;
pub use mirostat::{sample_token_mirostat, sample_token_mirostat_v2};
pub use penalties::{frequency_and_presence_penalties, repetition_penalty};
pub use rng::{Prng, DEFAULT_SEED};
pub use tail_free::tail_free;
pub use temperature::temperature;
pub use token::{sample_token, sample_token_greedy};
pub use top_k::top_k;
pub use top_p::top_p;
pub use typical::typical;
