//! KV-cache for autoregressive generation
//!
//! The attribution workflow first generates a continuation token by token
//! (cheap, cached) and only then runs one full forward pass with attention
//! capture over the finished sequence. The cache keeps each layer's key
//! and value tensors (`[batch, num_kv_heads, seq_len, head_dim]`) so a
//! generation step only computes the new position.

use candle_core::Tensor;

/// Per-layer key/value tensors accumulated during generation
#[derive(Debug, Clone)]
pub struct KvCache {
    /// Cached keys per layer: `[batch, num_kv_heads, seq_len, head_dim]`
    pub keys: Vec<Option<Tensor>>,
    /// Cached values per layer, same shape as keys
    pub values: Vec<Option<Tensor>>,
}

impl KvCache {
    /// Empty cache for the given number of layers
    pub fn new(n_layers: usize) -> Self {
        Self {
            keys: vec![None; n_layers],
            values: vec![None; n_layers],
        }
    }

    /// Sequence length currently cached (0 if empty)
    pub fn seq_len(&self) -> usize {
        self.keys
            .iter()
            .find_map(|k| k.as_ref())
            .map_or(0, |k| k.dim(2).unwrap_or(0))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.iter().all(Option::is_none)
    }

    pub fn n_layers(&self) -> usize {
        self.keys.len()
    }

    /// Drop all cached entries
    pub fn clear(&mut self) {
        self.keys.iter_mut().for_each(|k| *k = None);
        self.values.iter_mut().for_each(|v| *v = None);
    }
}
