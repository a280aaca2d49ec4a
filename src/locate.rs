//! Tolerant subsequence search over token sequences
//!
//! A document re-tokenized on its own rarely matches its embedded
//! tokenization exactly: boundary tokens merge with surrounding whitespace
//! or punctuation. The locator therefore accepts a bounded number of
//! mismatching positions instead of requiring an exact run.

use crate::error::{AttributionError, Result};

/// Default mismatch tolerance used by the document ranker
pub const DEFAULT_TOLERANCE: usize = 5;

/// Find the offset where `candidate` best matches a contiguous run of
/// `tokens`, allowing at most `tolerance` mismatching positions.
///
/// Among qualifying start positions the one with the fewest mismatches
/// wins; ties resolve to the earliest. An exact match short-circuits the
/// scan. Each window is abandoned as soon as its mismatch count can no
/// longer beat the best seen so far.
///
/// The effective tolerance is capped at `candidate.len() - 1`: at least
/// one token must actually match, so a generous tolerance never lets an
/// unrelated window qualify.
///
/// Returns `SubsequenceNotFound` when the candidate is longer than the
/// sequence or no start position qualifies.
pub fn find_subsequence(tokens: &[u32], candidate: &[u32], tolerance: usize) -> Result<usize> {
    let not_found = || AttributionError::SubsequenceNotFound {
        needle_len: candidate.len(),
        haystack_len: tokens.len(),
        tolerance,
    };

    if candidate.len() > tokens.len() {
        return Err(not_found());
    }
    let tolerance = tolerance.min(candidate.len().saturating_sub(1));

    let mut best: Option<(usize, usize)> = None;
    for start in 0..=tokens.len() - candidate.len() {
        // a later window only counts if it strictly beats the best so far
        let budget = best.map_or(tolerance, |(fewest, _)| fewest - 1);

        let mut mismatches = 0;
        let mut qualified = true;
        for (offset, &expected) in candidate.iter().enumerate() {
            if tokens[start + offset] != expected {
                mismatches += 1;
                if mismatches > budget {
                    qualified = false;
                    break;
                }
            }
        }
        if qualified {
            if mismatches == 0 {
                return Ok(start);
            }
            best = Some((mismatches, start));
        }
    }
    best.map(|(_, start)| start).ok_or_else(not_found)
}
