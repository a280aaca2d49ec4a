//! Attribution engine: per-layer attention tensors in, one matrix out
//!
//! Two interchangeable strategies produce the same output contract (row 0
//! identically zero, every other row summing to 1 before slicing):
//!
//! - **Residual propagation** walks the layers in order, mixing each
//!   layer's head-summed attention into an accumulator seeded with the
//!   identity, with two residual passes per layer mirroring the pre- and
//!   post-MLP skip connections. Runs in F64: repeated multiplication over
//!   30+ layers drives values toward zero and F32 loses the signal.
//! - **Weighted total attention** collapses all layers and heads in one
//!   pass, scaling each head's attention by a weight derived from the norm
//!   of its output-projection slice. Runs in F32, matching the precision
//!   the projections are stored in. Requires a model capability not every
//!   architecture exposes.
//!
//! Both finish by rolling rows down one position: the attention computed
//! while generating token i+1 was produced at position i, so row i becomes
//! the attribution for token i+1 and row 0 (a given, not generated) is
//! zeroed.

use candle_core::{DType, Device, Tensor, D};
use tracing::debug;

use crate::error::{AttributionError, Result};
use crate::matrix::AttributionMatrix;
use crate::model::{AttentionCache, AttentionModel};
use crate::query::Attribution;

/// Computes attribution matrices for token sequences run through `M`.
///
/// Head weights for the weighted strategy are derived from the model's
/// output projections once, on first use, and cached for the lifetime of
/// this instance.
pub struct Attributor<M: AttentionModel> {
    model: M,
    head_weights: Option<Vec<Tensor>>,
}

impl<M: AttentionModel> Attributor<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            head_weights: None,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Attribute `tokens` with the residual-propagation strategy
    pub fn attribute(&self, tokens: &[u32]) -> Result<Attribution> {
        let attentions = self.attend(tokens)?;
        let matrix = residual_attribution(&attentions, tokens.len())?;
        Attribution::new(tokens.to_vec(), matrix)
    }

    /// Attribute `tokens` with the weighted-total-attention strategy.
    ///
    /// Fails with [`AttributionError::UnsupportedModelArchitecture`] when
    /// the model cannot provide per-head output projections.
    pub fn attribute_weighted(&mut self, tokens: &[u32]) -> Result<Attribution> {
        let attentions = self.attend(tokens)?;
        let weights = self.head_weights()?;
        let matrix = weighted_attribution(&attentions, weights, tokens.len())?;
        Attribution::new(tokens.to_vec(), matrix)
    }

    /// Per-layer `[heads, 1, 1]` head weights, derived once and cached
    pub fn head_weights(&mut self) -> Result<&[Tensor]> {
        if self.head_weights.is_none() {
            let projections = self.model.output_projections()?;
            let weights = derive_head_weights(&projections, self.model.n_heads())?;
            debug!(layers = weights.len(), "derived and cached head weights");
            self.head_weights = Some(weights);
        }
        Ok(self.head_weights.as_deref().unwrap_or_default())
    }

    fn attend(&self, tokens: &[u32]) -> Result<AttentionCache> {
        let input = Tensor::new(tokens, self.model.device())?.unsqueeze(0)?;
        self.model.attend(&input)
    }
}

/// Residual-propagation attribution over an ordered attention stack.
///
/// `seq_len` must match the attention extents; it also fixes the output
/// shape when the stack is empty (zero layers yield the rolled identity).
pub fn residual_attribution(
    attentions: &AttentionCache,
    seq_len: usize,
) -> Result<AttributionMatrix> {
    let device = attentions
        .layers()
        .first()
        .map_or(Device::Cpu, |t| t.device().clone());

    let mut propagated = Tensor::eye(seq_len, DType::F64, &device)?;
    for attention in attentions.layers() {
        let per_head = canonical_attention(attention, seq_len, DType::F64)?;
        let summed = per_head.sum(0)?;
        // one residual pass before the MLP, one after
        let mixed = (summed.matmul(&propagated)? + (&propagated * 2.0)?)?;
        propagated = row_normalize(&mixed)?;
    }

    AttributionMatrix::from_tensor(&roll_and_zero_first(&propagated)?)
}

/// Weighted-total-attention attribution: every layer and head collapsed in
/// one pass, each head scaled by its derived weight.
pub fn weighted_attribution(
    attentions: &AttentionCache,
    head_weights: &[Tensor],
    seq_len: usize,
) -> Result<AttributionMatrix> {
    if head_weights.len() != attentions.n_layers() {
        return Err(AttributionError::Shape(format!(
            "{} head-weight layers for {} attention layers",
            head_weights.len(),
            attentions.n_layers()
        )));
    }

    let device = attentions
        .layers()
        .first()
        .map_or(Device::Cpu, |t| t.device().clone());

    let mut total = Tensor::zeros((seq_len, seq_len), DType::F32, &device)?;
    for (attention, weights) in attentions.layers().iter().zip(head_weights) {
        let per_head = canonical_attention(attention, seq_len, DType::F32)?;
        let weighted = per_head.broadcast_mul(weights)?;
        total = (total + weighted.sum(0)?)?;
    }

    let normalized = row_normalize(&total)?;
    AttributionMatrix::from_tensor(&roll_and_zero_first(&normalized)?)
}

/// Derive one weight per head per layer from output-projection matrices.
///
/// Each layer's `[hidden, hidden]` projection is split into `n_heads` row
/// blocks; a head's weight is the Frobenius norm of its block, normalized
/// so the weights of that layer sum to 1. Returns `[heads, 1, 1]` tensors
/// ready to broadcast over `[heads, seq, seq]` attention.
pub fn derive_head_weights(projections: &[Tensor], n_heads: usize) -> Result<Vec<Tensor>> {
    projections
        .iter()
        .map(|projection| {
            let dims = projection.dims();
            if dims.len() != 2 || dims[0] % n_heads != 0 {
                return Err(AttributionError::Shape(format!(
                    "output projection {dims:?} cannot be split into {n_heads} heads"
                )));
            }
            let per_head =
                projection
                    .to_dtype(DType::F32)?
                    .reshape((n_heads, dims[0] / n_heads, dims[1]))?;
            let norms = per_head.sqr()?.sum((1, 2))?.sqrt()?;
            let normalized = norms.broadcast_div(&norms.sum_all()?)?;
            Ok(normalized.reshape((n_heads, 1, 1))?)
        })
        .collect()
}

/// Validate one layer's attention and return it as `[heads, seq, seq]` in
/// the requested dtype. Accepts an optional leading batch dimension of 1.
fn canonical_attention(attention: &Tensor, seq_len: usize, dtype: DType) -> Result<Tensor> {
    let attention = match attention.dims() {
        [1, _, _, _] => attention.squeeze(0)?,
        [_, _, _] => attention.clone(),
        dims => {
            return Err(AttributionError::Shape(format!(
                "attention must be [heads, seq, seq] or [1, heads, seq, seq], got {dims:?}"
            )))
        }
    };
    let dims = attention.dims();
    if dims[1] != seq_len || dims[2] != seq_len {
        return Err(AttributionError::Shape(format!(
            "attention extent {:?} does not match {seq_len} tokens",
            &dims[1..]
        )));
    }
    Ok(attention.to_dtype(dtype)?.contiguous()?)
}

/// Divide each row by its sum; rows summing to zero are left untouched so
/// a degenerate row never turns into NaN.
fn row_normalize(matrix: &Tensor) -> Result<Tensor> {
    let sums = matrix.sum_keepdim(D::Minus1)?;
    let zero_rows = sums.eq(&sums.zeros_like()?)?.to_dtype(matrix.dtype())?;
    Ok(matrix.broadcast_div(&(sums + zero_rows)?)?)
}

/// Roll rows down one position along the output axis and zero row 0
fn roll_and_zero_first(matrix: &Tensor) -> Result<Tensor> {
    let rows = matrix.dim(0)?;
    if rows == 0 {
        return Ok(matrix.clone());
    }
    let cols = matrix.dim(1)?;
    let first = Tensor::zeros((1, cols), matrix.dtype(), matrix.device())?;
    let rest = matrix.narrow(0, 0, rows - 1)?;
    Ok(Tensor::cat(&[&first, &rest], 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Uniform causal attention over `seq_len` tokens for `heads` heads
    fn causal_uniform(heads: usize, seq_len: usize, device: &Device) -> Tensor {
        let mut data = Vec::with_capacity(heads * seq_len * seq_len);
        for _ in 0..heads {
            for i in 0..seq_len {
                for j in 0..seq_len {
                    data.push(if j <= i { 1.0f64 / (i + 1) as f64 } else { 0.0 });
                }
            }
        }
        Tensor::from_vec(data, (heads, seq_len, seq_len), device).unwrap()
    }

    fn assert_matrix_contract(matrix: &AttributionMatrix, seq_len: usize) {
        assert_eq!(matrix.rows(), seq_len);
        assert_eq!(matrix.cols(), seq_len);
        assert!(matrix.row(0).iter().all(|&v| v == 0.0));
        for row in 1..seq_len {
            let total: f64 = matrix.row(row).iter().sum();
            assert!(
                (total - 1.0).abs() < 1e-6,
                "row {row} sums to {total}, expected 1"
            );
        }
    }

    #[test]
    fn zero_layers_yield_the_rolled_identity() {
        let cache = AttentionCache::with_capacity(0);
        let matrix = residual_attribution(&cache, 4).unwrap();
        assert_matrix_contract(&matrix, 4);
        for row in 1..4 {
            assert_eq!(matrix.get(row, row - 1), 1.0);
        }
    }

    #[test]
    fn residual_rows_normalize_across_layer_counts() {
        let device = Device::Cpu;
        for n_layers in [1, 3, 8] {
            let cache: AttentionCache = (0..n_layers)
                .map(|_| causal_uniform(2, 5, &device))
                .collect();
            let matrix = residual_attribution(&cache, 5).unwrap();
            assert_matrix_contract(&matrix, 5);
        }
    }

    #[test]
    fn residual_accepts_a_batch_dimension_of_one() {
        let device = Device::Cpu;
        let batched = causal_uniform(2, 3, &device).unsqueeze(0).unwrap();
        let cache: AttentionCache = std::iter::once(batched).collect();
        let matrix = residual_attribution(&cache, 3).unwrap();
        assert_matrix_contract(&matrix, 3);
    }

    #[test]
    fn unsupported_rank_is_a_shape_error() {
        let device = Device::Cpu;
        let rank2 = Tensor::zeros((3, 3), DType::F64, &device).unwrap();
        let cache: AttentionCache = std::iter::once(rank2).collect();
        assert!(matches!(
            residual_attribution(&cache, 3),
            Err(AttributionError::Shape(_))
        ));

        let batch2 = Tensor::zeros((2, 2, 3, 3), DType::F64, &device).unwrap();
        let cache: AttentionCache = std::iter::once(batch2).collect();
        assert!(matches!(
            residual_attribution(&cache, 3),
            Err(AttributionError::Shape(_))
        ));
    }

    #[test]
    fn mismatched_extent_is_a_shape_error() {
        let device = Device::Cpu;
        let cache: AttentionCache = std::iter::once(causal_uniform(2, 4, &device)).collect();
        assert!(matches!(
            residual_attribution(&cache, 5),
            Err(AttributionError::Shape(_))
        ));
    }

    #[test]
    fn attention_concentrated_on_one_token_survives_the_roll() {
        // 5 tokens; every row of the single layer attends entirely to
        // position 2 (rows 0 and 1 attend to themselves to stay causal)
        let device = Device::Cpu;
        let seq_len = 5;
        let mut data = vec![0.0f64; seq_len * seq_len];
        for i in 0..seq_len {
            let target = if i >= 2 { 2 } else { i };
            data[i * seq_len + target] = 1.0;
        }
        let attention = Tensor::from_vec(data, (1, seq_len, seq_len), &device).unwrap();
        let cache: AttentionCache = std::iter::once(attention).collect();

        let matrix = residual_attribution(&cache, seq_len).unwrap();
        assert_matrix_contract(&matrix, seq_len);
        // row 4 explains token 4 via the attention computed at position 3:
        // one part attention on token 2, two parts residual on token 3
        assert!((matrix.get(4, 2) - 1.0 / 3.0).abs() < 1e-9);
        assert!((matrix.get(4, 3) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(matrix.get(4, 0), 0.0);
    }

    #[test]
    fn weighted_all_zero_attention_stays_zero_without_nan() {
        let device = Device::Cpu;
        let attention = Tensor::zeros((2, 3, 3), DType::F32, &device).unwrap();
        let cache: AttentionCache = std::iter::once(attention).collect();
        let weights = vec![Tensor::from_vec(vec![0.5f32, 0.5], (2, 1, 1), &device).unwrap()];

        let matrix = weighted_attribution(&cache, &weights, 3).unwrap();
        assert!(matrix.row(1).iter().all(|&v| v == 0.0));
        assert!(!matrix.sum().is_nan());
    }

    #[test]
    fn weighted_combines_heads_by_weight() {
        let device = Device::Cpu;
        let seq_len = 3;
        // head 0 attends to token 0, head 1 attends to token 1 (from row 2)
        let mut data = vec![0.0f32; 2 * seq_len * seq_len];
        data[0] = 1.0; // head 0, row 0 -> col 0
        data[3] = 1.0; // head 0, row 1 -> col 0
        data[6] = 1.0; // head 0, row 2 -> col 0
        data[9] = 1.0; // head 1, row 0 -> col 0
        data[13] = 1.0; // head 1, row 1 -> col 1
        data[16] = 1.0; // head 1, row 2 -> col 1
        let attention = Tensor::from_vec(data, (2, seq_len, seq_len), &device).unwrap();
        let cache: AttentionCache = std::iter::once(attention).collect();
        let weights = vec![Tensor::from_vec(vec![0.75f32, 0.25], (2, 1, 1), &device).unwrap()];

        let matrix = weighted_attribution(&cache, &weights, seq_len).unwrap();
        // row 2 of the output is pre-roll row 1: 0.75 on col 0, 0.25 on col 1
        assert!((matrix.get(2, 0) - 0.75).abs() < 1e-6);
        assert!((matrix.get(2, 1) - 0.25).abs() < 1e-6);
        assert!(matrix.row(0).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn weighted_requires_one_weight_layer_per_attention_layer() {
        let device = Device::Cpu;
        let cache: AttentionCache =
            std::iter::once(Tensor::zeros((2, 3, 3), DType::F32, &device).unwrap()).collect();
        assert!(matches!(
            weighted_attribution(&cache, &[], 3),
            Err(AttributionError::Shape(_))
        ));
    }

    #[test]
    fn head_weights_normalize_each_layer_to_one() {
        let device = Device::Cpu;
        // 4x4 projection, 2 heads: head 0 rows are all 1s (norm sqrt(8)),
        // head 1 rows are all 3s (norm sqrt(72) = 3*sqrt(8))
        let mut data = vec![1.0f32; 8];
        data.extend(std::iter::repeat(3.0f32).take(8));
        let projection = Tensor::from_vec(data, (4, 4), &device).unwrap();

        let weights = derive_head_weights(&[projection.clone(), projection], 2).unwrap();
        assert_eq!(weights.len(), 2);
        for layer in &weights {
            assert_eq!(layer.dims(), &[2, 1, 1]);
            let values: Vec<f32> = layer.flatten_all().unwrap().to_vec1().unwrap();
            assert!((values.iter().sum::<f32>() - 1.0).abs() < 1e-6);
            assert!((values[0] - 0.25).abs() < 1e-6);
            assert!((values[1] - 0.75).abs() < 1e-6);
        }
    }

    #[test]
    fn head_weights_reject_indivisible_projections() {
        let device = Device::Cpu;
        let projection = Tensor::zeros((5, 5), DType::F32, &device).unwrap();
        assert!(matches!(
            derive_head_weights(&[projection], 2),
            Err(AttributionError::Shape(_))
        ));
    }

    /// Fixed-attention model stub for exercising the engine surface
    struct StubModel {
        device: Device,
        attention: Tensor,
        projections: Option<Vec<Tensor>>,
        projection_requests: Cell<usize>,
    }

    impl AttentionModel for StubModel {
        fn n_layers(&self) -> usize {
            1
        }

        fn n_heads(&self) -> usize {
            2
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn attend(&self, _input_ids: &Tensor) -> crate::error::Result<AttentionCache> {
            Ok(std::iter::once(self.attention.clone()).collect())
        }

        fn generate(
            &self,
            prompt_ids: &[u32],
            _max_tokens: usize,
            _temperature: f32,
        ) -> crate::error::Result<Vec<u32>> {
            Ok(prompt_ids.to_vec())
        }

        fn output_projections(&self) -> crate::error::Result<Vec<Tensor>> {
            self.projection_requests.set(self.projection_requests.get() + 1);
            match &self.projections {
                Some(p) => Ok(p.clone()),
                None => Err(AttributionError::UnsupportedModelArchitecture(
                    self.architecture_name().to_string(),
                )),
            }
        }

        fn architecture_name(&self) -> &str {
            "stub"
        }
    }

    fn stub(projections: Option<Vec<Tensor>>) -> StubModel {
        let device = Device::Cpu;
        let attention = causal_uniform(2, 4, &device).to_dtype(DType::F32).unwrap();
        StubModel {
            device,
            attention,
            projections,
            projection_requests: Cell::new(0),
        }
    }

    #[test]
    fn weighted_strategy_surfaces_unsupported_architecture() {
        let mut attributor = Attributor::new(stub(None));
        let err = attributor.attribute_weighted(&[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(
            err,
            AttributionError::UnsupportedModelArchitecture(name) if name == "stub"
        ));
    }

    #[test]
    fn head_weights_are_derived_once_per_instance() {
        let device = Device::Cpu;
        let projection = Tensor::ones((4, 4), DType::F32, &device).unwrap();
        let mut attributor = Attributor::new(stub(Some(vec![projection])));

        attributor.attribute_weighted(&[1, 2, 3, 4]).unwrap();
        attributor.attribute_weighted(&[1, 2, 3, 4]).unwrap();
        assert_eq!(attributor.model().projection_requests.get(), 1);
    }

    #[test]
    fn engine_end_to_end_produces_a_query_ready_attribution() {
        let attributor = Attributor::new(stub(None));
        let attribution = attributor.attribute(&[9, 8, 7, 6]).unwrap();
        assert_eq!(attribution.tokens(), &[9, 8, 7, 6]);
        assert_matrix_contract(attribution.matrix(), 4);
    }
}
