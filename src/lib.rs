// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::many_single_char_names)] // q, k, v, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // AttributionMatrix in matrix.rs is fine
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive

//! attributor-rs: attention attribution for autoregressive transformers
//!
//! Decomposes a model's attention, token by token and layer by layer, into
//! one output-by-input attribution matrix, then answers queries against it:
//! which input tokens does a generated token draw on, at any granularity
//! from single tokens to whole documents.
//!
//! ## Architecture
//!
//! - `span`: windowing descriptor used by every query
//! - `matrix`: dense f64 attribution matrix
//! - `window`: slicing + windowed-sum aggregation
//! - `query`: top-k, outlier, and mass-sum queries producing AttributionSpans
//! - `locate`: tolerant subsequence search mapping documents to token spans
//! - `rank`: ranking candidate documents by attribution mass
//! - `engine`: the two attribution strategies (residual propagation,
//!   weighted total attention) and the per-instance head-weight cache
//! - `model`: collaborator contracts (attention capture, tokenizer)
//! - `llama`: candle-backed LLaMA implementation of the model contract
//! - `kv_cache` / `masks`: generation support for the LLaMA backend
//!
//! Attribution is an attention-weighted heuristic, not a causal proof of
//! model behavior.

pub mod engine;
pub mod error;
pub mod kv_cache;
pub mod llama;
pub mod locate;
pub mod masks;
pub mod matrix;
pub mod model;
pub mod query;
pub mod rank;
pub mod span;
pub mod window;

pub use engine::{derive_head_weights, residual_attribution, weighted_attribution, Attributor};
pub use error::{AttributionError, Result};
pub use kv_cache::KvCache;
pub use llama::{AttributorLlama, LlamaConfig};
pub use locate::{find_subsequence, DEFAULT_TOLERANCE};
pub use masks::{causal_mask, clear_mask_cache, generation_mask};
pub use matrix::AttributionMatrix;
pub use model::{AttentionCache, AttentionModel, TextTokenizer};
pub use query::{Attribution, AttributionSpan};
pub use rank::DocumentRanker;
pub use span::Span;
pub use window::aggregate;
