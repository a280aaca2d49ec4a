//! Dense attribution matrix
//!
//! Row i holds the attribution that generated token i received from every
//! token before it. The engine produces a square matrix; windowed queries
//! produce smaller rectangles of the same type. Stored row-major in f64:
//! attribution values shrink toward zero over many layers and analysis code
//! reads individual cells, so an extracted dense buffer beats keeping the
//! data on a device tensor.

use candle_core::{DType, Tensor};

use crate::error::{AttributionError, Result};

/// Row-major matrix of non-negative attribution values
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl AttributionMatrix {
    /// All-zero matrix of the given shape
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Build from a row-major buffer; the buffer length must match
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(AttributionError::Shape(format!(
                "buffer of {} values cannot fill a {rows}x{cols} matrix",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Extract a rank-2 tensor into an owned f64 matrix
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let dims = tensor.dims();
        if dims.len() != 2 {
            return Err(AttributionError::Shape(format!(
                "expected a rank-2 tensor, got rank {}",
                dims.len()
            )));
        }
        let (rows, cols) = (dims[0], dims[1]);
        let data = tensor
            .to_dtype(DType::F64)?
            .flatten_all()?
            .to_vec1::<f64>()?;
        Self::from_vec(rows, cols, data)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Cell value; panics on out-of-bounds like slice indexing
    pub fn get(&self, row: usize, col: usize) -> f64 {
        assert!(row < self.rows && col < self.cols, "matrix index out of bounds");
        self.data[row * self.cols + col]
    }

    /// One row as a slice
    pub fn row(&self, row: usize) -> &[f64] {
        let base = row * self.cols;
        &self.data[base..base + self.cols]
    }

    /// Sum of every cell
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Zero full columns in place; used for ignored input positions
    pub fn zero_columns(&mut self, columns: &[usize]) -> Result<()> {
        for &col in columns {
            if col >= self.cols {
                return Err(AttributionError::IndexOutOfRange {
                    index: col,
                    extent: self.cols,
                });
            }
            for row in 0..self.rows {
                self.data[row * self.cols + col] = 0.0;
            }
        }
        Ok(())
    }

    /// Copy of the rectangle `[row_start, row_end) x [col_start, col_end)`
    ///
    /// Bounds are assumed pre-clamped to the matrix extent; an inverted
    /// range yields an empty matrix.
    pub fn slice(&self, row_start: usize, row_end: usize, col_start: usize, col_end: usize) -> Self {
        let rows = row_end.saturating_sub(row_start);
        let cols = col_end.saturating_sub(col_start);
        let mut data = Vec::with_capacity(rows * cols);
        for row in row_start..row_start + rows {
            let base = row * self.cols;
            data.extend_from_slice(&self.data[base + col_start..base + col_start + cols]);
        }
        Self { rows, cols, data }
    }

    /// Sum of the `height x width` block anchored at `(row, col)`
    pub fn block_sum(&self, row: usize, col: usize, height: usize, width: usize) -> f64 {
        let mut total = 0.0;
        for r in row..row + height {
            let base = r * self.cols;
            total += self.data[base + col..base + col + width].iter().sum::<f64>();
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn sample() -> AttributionMatrix {
        // 3x4:
        // 0  1  2  3
        // 4  5  6  7
        // 8  9 10 11
        AttributionMatrix::from_vec(3, 4, (0..12).map(f64::from).collect()).unwrap()
    }

    #[test]
    fn from_vec_rejects_mismatched_buffer() {
        assert!(AttributionMatrix::from_vec(2, 2, vec![1.0; 5]).is_err());
    }

    #[test]
    fn from_tensor_round_trips_values() {
        let tensor =
            Tensor::from_vec(vec![1.0f64, 2.0, 3.0, 4.0], (2, 2), &Device::Cpu).unwrap();
        let matrix = AttributionMatrix::from_tensor(&tensor).unwrap();
        assert_eq!(matrix.rows(), 2);
        assert_eq!(matrix.get(1, 0), 3.0);
    }

    #[test]
    fn from_tensor_rejects_wrong_rank() {
        let tensor = Tensor::zeros((2, 2, 2), DType::F64, &Device::Cpu).unwrap();
        assert!(matches!(
            AttributionMatrix::from_tensor(&tensor),
            Err(AttributionError::Shape(_))
        ));
    }

    #[test]
    fn slice_copies_the_rectangle() {
        let sliced = sample().slice(1, 3, 1, 3);
        assert_eq!(sliced.rows(), 2);
        assert_eq!(sliced.cols(), 2);
        assert_eq!(sliced.row(0), &[5.0, 6.0]);
        assert_eq!(sliced.row(1), &[9.0, 10.0]);
    }

    #[test]
    fn zero_columns_clears_full_columns() {
        let mut matrix = sample();
        matrix.zero_columns(&[0, 2]).unwrap();
        assert_eq!(matrix.row(1), &[0.0, 5.0, 0.0, 7.0]);
    }

    #[test]
    fn zero_columns_out_of_range_is_an_error() {
        let mut matrix = sample();
        assert!(matches!(
            matrix.zero_columns(&[4]),
            Err(AttributionError::IndexOutOfRange { index: 4, extent: 4 })
        ));
    }

    #[test]
    fn block_sum_adds_the_window() {
        // block at (1,1) of size 2x2: 5 + 6 + 9 + 10
        assert_eq!(sample().block_sum(1, 1, 2, 2), 30.0);
    }
}
