//! Collaborator contracts: model and tokenizer
//!
//! The attribution core never loads or runs a model itself. It consumes the
//! per-layer attention tensors a model produces for one forward pass, and a
//! tokenizer for mapping documents to token ids. `llama.rs` provides the
//! candle-backed implementation of both contracts.

use candle_core::{Device, Tensor};

use crate::error::{AttributionError, Result};

/// Ordered per-layer attention patterns captured during one forward pass
///
/// Each entry is the post-softmax attention for one layer, shaped
/// `[batch, heads, seq, seq]` or `[heads, seq, seq]`, row-stochastic per
/// head over the attended-to axis.
#[derive(Debug)]
pub struct AttentionCache {
    patterns: Vec<Tensor>,
}

impl AttentionCache {
    /// Create a new cache with expected capacity
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            patterns: Vec::with_capacity(n_layers),
        }
    }

    /// Append one layer's attention pattern
    pub fn push(&mut self, pattern: Tensor) {
        self.patterns.push(pattern);
    }

    /// Number of layers captured
    pub fn n_layers(&self) -> usize {
        self.patterns.len()
    }

    /// Attention pattern for a specific layer
    pub fn get_layer(&self, layer: usize) -> Result<&Tensor> {
        self.patterns
            .get(layer)
            .ok_or(AttributionError::IndexOutOfRange {
                index: layer,
                extent: self.patterns.len(),
            })
    }

    /// All captured patterns in layer order
    pub fn layers(&self) -> &[Tensor] {
        &self.patterns
    }
}

impl FromIterator<Tensor> for AttentionCache {
    fn from_iter<I: IntoIterator<Item = Tensor>>(iter: I) -> Self {
        Self {
            patterns: iter.into_iter().collect(),
        }
    }
}

/// What the attribution engine needs from a model.
///
/// `output_projections` is an optional capability: only architectures that
/// expose per-head output-projection weights can serve the
/// weighted-total-attention strategy. The default implementation reports
/// the architecture as unsupported, so the engine handles the error
/// explicitly instead of inspecting concrete model types.
pub trait AttentionModel {
    /// Number of transformer layers
    fn n_layers(&self) -> usize;

    /// Number of attention heads per layer
    fn n_heads(&self) -> usize;

    /// Device tensors for this model live on
    fn device(&self) -> &Device;

    /// Run one forward pass over `input_ids` (shape `[1, seq]`) and capture
    /// every layer's post-softmax attention
    fn attend(&self, input_ids: &Tensor) -> Result<AttentionCache>;

    /// Generate a continuation of `prompt_ids`, returning prompt + new tokens
    fn generate(&self, prompt_ids: &[u32], max_tokens: usize, temperature: f32)
        -> Result<Vec<u32>>;

    /// Per-layer output-projection weight matrices, one `[hidden, hidden]`
    /// tensor per layer, for deriving head weights
    fn output_projections(&self) -> Result<Vec<Tensor>> {
        Err(AttributionError::UnsupportedModelArchitecture(
            self.architecture_name().to_string(),
        ))
    }

    /// Human-readable architecture name used in error reports
    fn architecture_name(&self) -> &str {
        "unknown"
    }
}

/// Tokenizer surface used by the document ranker and presentation helpers
pub trait TextTokenizer {
    /// Encode text to token ids, without special tokens
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids back to text
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

impl TextTokenizer for tokenizers::Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        // deref to TokenizerImpl so the inherent encode is picked over this
        // trait method
        let encoding = std::ops::Deref::deref(self)
            .encode(text, false)
            .map_err(|e| AttributionError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        std::ops::Deref::deref(self)
            .decode(ids, true)
            .map_err(|e| AttributionError::Tokenizer(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn empty_cache_reports_zero_layers() {
        let cache = AttentionCache::with_capacity(8);
        assert_eq!(cache.n_layers(), 0);
    }

    #[test]
    fn get_layer_out_of_range_is_an_error() {
        let mut cache = AttentionCache::with_capacity(1);
        cache.push(Tensor::zeros((1, 2, 3, 3), DType::F32, &Device::Cpu).unwrap());
        assert!(cache.get_layer(0).is_ok());
        assert!(matches!(
            cache.get_layer(1),
            Err(AttributionError::IndexOutOfRange { index: 1, extent: 1 })
        ));
    }
}
