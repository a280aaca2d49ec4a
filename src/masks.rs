//! Attention mask utilities for the LLaMA collaborator
//!
//! Causal masks are cached by `(seq_len, device, dtype)`: attribution runs
//! the full sequence through the model repeatedly and the mask tensor is
//! the same every time (16MB+ at seq_len=2048). Cache hits hand out
//! shallow clones (Arc bump, no data copy).

use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use crate::error::Result;

type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, usize, DType), Tensor>>>;

static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Device identifier for the cache key; assumes one device per type
fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Create or retrieve a cached causal mask of shape `[1, 1, seq, seq]`:
/// 0 where position j may be attended from position i (j <= i), -inf
/// elsewhere
pub fn causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (seq_len, device_id(device), dtype);

    {
        let cache = CAUSAL_MASK_CACHE.lock().unwrap();
        if let Some(cached) = cache.get(&cache_key) {
            return Ok(cached.clone());
        }
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    CAUSAL_MASK_CACHE
        .lock()
        .unwrap()
        .insert(cache_key, mask.clone());

    Ok(mask)
}

/// Mask for KV-cached generation: `new_seq_len` fresh positions appended
/// after `start_pos` cached ones, shape `[1, 1, new_seq_len, total_seq_len]`.
///
/// The fresh positions occupy rows `start_pos..start_pos + new_seq_len` of
/// a full causal mask over `total_seq_len`, so the multi-token case narrows
/// those rows out of the cached mask. The common single-token step sees the
/// whole cached context and skips the cache: `total_seq_len` grows with
/// every step and caching one mask per length would defeat the cache.
pub fn generation_mask(
    new_seq_len: usize,
    total_seq_len: usize,
    start_pos: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    if new_seq_len == 1 {
        return Ok(Tensor::zeros((1, 1, 1, total_seq_len), dtype, device)?);
    }

    let full = causal_mask(total_seq_len, device, dtype)?;
    Ok(full.narrow(2, start_pos, new_seq_len)?)
}

/// Drop all cached masks
pub fn clear_mask_cache() {
    CAUSAL_MASK_CACHE.lock().unwrap().clear();
}

/// Number of masks currently cached
pub fn mask_cache_size() -> usize {
    CAUSAL_MASK_CACHE.lock().unwrap().len()
}
