//! Span: the windowing descriptor used by every query operation
//!
//! A span addresses a region of the attribution matrix along one axis and
//! optionally requests aggregation of that region into fixed-size windows.
//! The defaults (`start = end = None`, `step = window_size = 1`) mean "the
//! full extent, no aggregation" and most call sites rely on them.

use crate::error::{AttributionError, Result};

/// Region + windowing descriptor for one axis of the attribution matrix
///
/// `start = None` means 0; `end = None` means the matrix extent on that
/// axis. `window_size` is the number of consecutive positions summed into
/// one aggregate cell and `step` is the stride between window starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// First position covered (inclusive); `None` = 0
    pub start: Option<usize>,
    /// One past the last position covered; `None` = full extent
    pub end: Option<usize>,
    /// Stride between window starts
    pub step: usize,
    /// Positions summed into one window
    pub window_size: usize,
}

impl Default for Span {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            step: 1,
            window_size: 1,
        }
    }
}

impl Span {
    /// Span over `[start, end)` with no aggregation
    pub fn range(start: usize, end: usize) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Self::default()
        }
    }

    /// Span covering a single position
    pub fn single(position: usize) -> Self {
        Self::range(position, position + 1)
    }

    /// Fully specified span; rejects zero `step`/`window_size` and an
    /// explicit `end` of zero
    pub fn new(
        start: Option<usize>,
        end: Option<usize>,
        step: usize,
        window_size: usize,
    ) -> Result<Self> {
        if step == 0 {
            return Err(AttributionError::Shape("span step must be positive".into()));
        }
        if window_size == 0 {
            return Err(AttributionError::Shape(
                "span window_size must be positive".into(),
            ));
        }
        if end == Some(0) {
            return Err(AttributionError::Shape("span end must be positive".into()));
        }
        Ok(Self {
            start,
            end,
            step,
            window_size,
        })
    }

    /// Start resolved against defaults
    pub fn resolved_start(&self) -> usize {
        self.start.unwrap_or(0)
    }

    /// End resolved against the axis extent, clamped to it
    pub fn resolved_end(&self, extent: usize) -> usize {
        self.end.unwrap_or(extent).min(extent)
    }

    /// Whether this span requests no aggregation (`step == window_size == 1`)
    pub fn is_trivial(&self) -> bool {
        self.step == 1 && self.window_size == 1
    }

    /// Window start offsets within a sliced axis of the given length.
    ///
    /// A window must fit entirely within the range: a trailing partial
    /// window is dropped, and a range shorter than one window yields no
    /// starts at all.
    pub fn window_starts(&self, len: usize) -> Vec<usize> {
        if len < self.window_size {
            return Vec::new();
        }
        (0..=len - self.window_size).step_by(self.step).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_span_is_trivial_and_unbounded() {
        let span = Span::default();
        assert!(span.is_trivial());
        assert_eq!(span.resolved_start(), 0);
        assert_eq!(span.resolved_end(17), 17);
    }

    #[test]
    fn end_clamps_to_extent() {
        let span = Span::range(2, 100);
        assert_eq!(span.resolved_end(10), 10);
    }

    #[test]
    fn zero_step_and_window_rejected() {
        assert!(Span::new(None, None, 0, 1).is_err());
        assert!(Span::new(None, None, 1, 0).is_err());
        assert!(Span::new(None, Some(0), 1, 1).is_err());
    }

    #[test]
    fn window_starts_drop_partial_trailing_window() {
        let span = Span {
            step: 2,
            window_size: 3,
            ..Span::default()
        };
        // len 8, window 3, step 2 -> starts 0, 2, 4 (start 6 would run past)
        assert_eq!(span.window_starts(8), vec![0, 2, 4]);
    }

    #[test]
    fn window_starts_empty_when_range_too_short() {
        let span = Span {
            window_size: 5,
            ..Span::default()
        };
        assert!(span.window_starts(4).is_empty());
        assert_eq!(span.window_starts(5), vec![0]);
    }
}
