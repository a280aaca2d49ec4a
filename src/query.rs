//! Span queries over a computed attribution matrix
//!
//! [`Attribution`] bundles the token sequence with its attribution matrix
//! and answers the three query shapes: ranked top-k per output window,
//! statistical outliers per output window, and whole-region mass sums.
//! Every query runs through [`crate::window::aggregate`] and then maps
//! window rows and columns back to absolute token positions.

use tracing::debug;

use crate::error::{AttributionError, Result};
use crate::matrix::AttributionMatrix;
use crate::model::TextTokenizer;
use crate::span::Span;
use crate::window::aggregate;

/// One query result: a block of output tokens, the block of input tokens it
/// is attributed to, and the attribution mass between them
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionSpan {
    /// Absolute positions of the output (generated) tokens
    pub output_indices: Vec<usize>,
    /// Absolute positions of the input (source) tokens
    pub input_indices: Vec<usize>,
    /// Attribution mass from the input block to the output block
    pub attribution: f64,
}

impl AttributionSpan {
    /// Decode the output tokens back to text
    pub fn output_text<T: TextTokenizer>(&self, tokenizer: &T, tokens: &[u32]) -> Result<String> {
        tokenizer.decode(&select(tokens, &self.output_indices)?)
    }

    /// Decode the input tokens back to text, annotated with their position range
    pub fn input_text<T: TextTokenizer>(&self, tokenizer: &T, tokens: &[u32]) -> Result<String> {
        let text = tokenizer.decode(&select(tokens, &self.input_indices)?)?;
        match (self.input_indices.first(), self.input_indices.last()) {
            (Some(first), Some(last)) => Ok(format!("{text}({first}-{last})")),
            _ => Ok(text),
        }
    }

    /// One-line human-readable rendering of this result
    pub fn pretty_print<T: TextTokenizer>(&self, tokenizer: &T, tokens: &[u32]) -> Result<String> {
        Ok(format!(
            "'{}' attributed to '{}' with strength {}",
            self.output_text(tokenizer, tokens)?,
            self.input_text(tokenizer, tokens)?,
            self.attribution
        ))
    }
}

fn select(tokens: &[u32], indices: &[usize]) -> Result<Vec<u32>> {
    indices
        .iter()
        .map(|&i| {
            tokens
                .get(i)
                .copied()
                .ok_or(AttributionError::IndexOutOfRange {
                    index: i,
                    extent: tokens.len(),
                })
        })
        .collect()
}

/// A token sequence together with its output-by-input attribution matrix
#[derive(Debug, Clone)]
pub struct Attribution {
    tokens: Vec<u32>,
    matrix: AttributionMatrix,
}

impl Attribution {
    /// Bundle a token sequence with the matrix computed for it; the matrix
    /// must be square over the sequence length
    pub fn new(tokens: Vec<u32>, matrix: AttributionMatrix) -> Result<Self> {
        if matrix.rows() != tokens.len() || matrix.cols() != tokens.len() {
            return Err(AttributionError::Shape(format!(
                "{}x{} matrix does not cover {} tokens",
                matrix.rows(),
                matrix.cols(),
                tokens.len()
            )));
        }
        Ok(Self { tokens, matrix })
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn matrix(&self) -> &AttributionMatrix {
        &self.matrix
    }

    /// For every output window, the `k` strongest input windows starting at
    /// rank `offset`, best first.
    ///
    /// Returns one inner vector per output window. Each row yields exactly
    /// `min(k, windows - offset)` entries; ties keep original column order.
    pub fn top_k(
        &self,
        k: usize,
        offset: usize,
        output_span: &Span,
        input_span: &Span,
        ignore_inputs: Option<&[usize]>,
    ) -> Result<Vec<Vec<AttributionSpan>>> {
        let windowed = aggregate(&self.matrix, output_span, input_span, ignore_inputs)?;

        let mut results = Vec::with_capacity(windowed.rows());
        for row in 0..windowed.rows() {
            let mut ranked: Vec<(usize, f64)> =
                windowed.row(row).iter().copied().enumerate().collect();
            // stable sort: equal scores keep original column order
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            let taken = ranked
                .into_iter()
                .skip(offset)
                .take(k)
                .map(|(col, value)| self.window_span(row, col, value, output_span, input_span))
                .collect();
            results.push(taken);
        }
        Ok(results)
    }

    /// For every output window, the input windows whose attribution exceeds
    /// `mean + std_threshold * std` of that row, in ascending column order.
    ///
    /// Mean and standard deviation are taken across the row's input windows
    /// (population std). A row with zero variance yields no outliers for
    /// any threshold.
    pub fn outliers(
        &self,
        std_threshold: f64,
        output_span: &Span,
        input_span: &Span,
        ignore_inputs: Option<&[usize]>,
    ) -> Result<Vec<Vec<AttributionSpan>>> {
        let windowed = aggregate(&self.matrix, output_span, input_span, ignore_inputs)?;

        let mut results = Vec::with_capacity(windowed.rows());
        for row in 0..windowed.rows() {
            let values = windowed.row(row);
            let count = values.len() as f64;
            let mean = values.iter().sum::<f64>() / count;
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
            let std = variance.sqrt();

            if std == 0.0 {
                results.push(Vec::new());
                continue;
            }

            let cutoff = mean + std_threshold * std;
            let flagged = values
                .iter()
                .enumerate()
                .filter(|(_, &value)| value > cutoff)
                .map(|(col, &value)| self.window_span(row, col, value, output_span, input_span))
                .collect();
            results.push(flagged);
        }
        Ok(results)
    }

    /// Total attribution mass inside one output-by-input rectangle
    pub fn get_one(
        &self,
        output_span: &Span,
        input_span: &Span,
        ignore_inputs: Option<&[usize]>,
    ) -> Result<AttributionSpan> {
        let windowed = aggregate(&self.matrix, output_span, input_span, ignore_inputs)?;
        let attribution = windowed.sum();
        debug!(
            rows = windowed.rows(),
            cols = windowed.cols(),
            attribution,
            "summed attribution rectangle"
        );
        Ok(AttributionSpan {
            output_indices: (output_span.resolved_start()
                ..output_span.resolved_end(self.matrix.rows()))
                .collect(),
            input_indices: (input_span.resolved_start()
                ..input_span.resolved_end(self.matrix.cols()))
                .collect(),
            attribution,
        })
    }

    /// [`Self::get_one`] for several input spans, preserving input order
    pub fn get_many(
        &self,
        output_span: &Span,
        input_spans: &[Span],
        ignore_inputs: Option<&[usize]>,
    ) -> Result<Vec<AttributionSpan>> {
        input_spans
            .iter()
            .map(|input_span| self.get_one(output_span, input_span, ignore_inputs))
            .collect()
    }

    /// Map a window row/column back to absolute token positions
    fn window_span(
        &self,
        row: usize,
        col: usize,
        attribution: f64,
        output_span: &Span,
        input_span: &Span,
    ) -> AttributionSpan {
        let output_base = output_span.resolved_start() + row * output_span.step;
        let input_base = input_span.resolved_start() + col * input_span.step;
        AttributionSpan {
            output_indices: (output_base..output_base + output_span.window_size).collect(),
            input_indices: (input_base..input_base + input_span.window_size).collect(),
            attribution,
        }
    }
}
