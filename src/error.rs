//! Error taxonomy for the attribution core
//!
//! Core algorithms return `AttributionError` so callers can distinguish
//! recoverable conditions (a document that cannot be located) from fatal
//! ones (an unsupported model architecture). Collaborator plumbing such as
//! model downloads keeps using `anyhow` as usual.

use thiserror::Error;

/// Errors produced by the attribution engine and query layer
#[derive(Debug, Error)]
pub enum AttributionError {
    /// Input tensor or token sequence has an unsupported rank or extent.
    /// Fails fast; not recoverable.
    #[error("unsupported shape: {0}")]
    Shape(String),

    /// Head-weight extraction was requested for a model family that does
    /// not expose per-head output projections. Fatal for the
    /// weighted-total-attention strategy; callers must fall back or abort.
    #[error("model architecture '{0}' does not expose per-head output projections")]
    UnsupportedModelArchitecture(String),

    /// A candidate token sequence could not be located within tolerance.
    /// Recoverable: the document ranker skips and warns.
    #[error(
        "subsequence of {needle_len} tokens not found in {haystack_len} tokens \
         (tolerance {tolerance})"
    )]
    SubsequenceNotFound {
        needle_len: usize,
        haystack_len: usize,
        tolerance: usize,
    },

    /// A query addressed a layer, column, or window beyond what is available.
    #[error("index {index} out of range for extent {extent}")]
    IndexOutOfRange { index: usize, extent: usize },

    /// Underlying tensor operation failed.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    /// Tokenizer encode/decode failed.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

/// Result alias used throughout the attribution core
pub type Result<T> = std::result::Result<T, AttributionError>;
