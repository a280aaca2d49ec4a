//! Window aggregation over the attribution matrix
//!
//! Every query goes through [`aggregate`]: copy the engine's matrix, zero
//! ignored input columns, restrict to the requested rectangle, and (only
//! when a span asks for it) collapse the rectangle into windowed sums.

use crate::error::Result;
use crate::matrix::AttributionMatrix;
use crate::span::Span;

/// Produce the working matrix for one query.
///
/// The input matrix is never mutated; ignored columns are zeroed on a
/// private copy before slicing, so an ignored position contributes nothing
/// even when it falls inside the queried rectangle.
///
/// When both spans are trivial (`step == window_size == 1`) the result is
/// the sliced rectangle unchanged. Otherwise each output cell is the sum of
/// one `window_size x window_size` block; windows that would run past the
/// sliced range are dropped, not padded.
pub fn aggregate(
    matrix: &AttributionMatrix,
    output_span: &Span,
    input_span: &Span,
    ignore_inputs: Option<&[usize]>,
) -> Result<AttributionMatrix> {
    let sliced = if let Some(ignore) = ignore_inputs {
        let mut copy = matrix.clone();
        copy.zero_columns(ignore)?;
        slice_spans(&copy, output_span, input_span)
    } else {
        slice_spans(matrix, output_span, input_span)
    };

    if output_span.is_trivial() && input_span.is_trivial() {
        return Ok(sliced);
    }

    let row_starts = output_span.window_starts(sliced.rows());
    let col_starts = input_span.window_starts(sliced.cols());

    let mut data = Vec::with_capacity(row_starts.len() * col_starts.len());
    for &row in &row_starts {
        for &col in &col_starts {
            data.push(sliced.block_sum(
                row,
                col,
                output_span.window_size,
                input_span.window_size,
            ));
        }
    }
    AttributionMatrix::from_vec(row_starts.len(), col_starts.len(), data)
}

fn slice_spans(
    matrix: &AttributionMatrix,
    output_span: &Span,
    input_span: &Span,
) -> AttributionMatrix {
    matrix.slice(
        output_span.resolved_start().min(matrix.rows()),
        output_span.resolved_end(matrix.rows()),
        input_span.resolved_start().min(matrix.cols()),
        input_span.resolved_end(matrix.cols()),
    )
}
