//! Ranking free-text documents by attribution mass
//!
//! Bridges text back onto token positions: each candidate document is
//! tokenized on its own, located inside the attributed sequence with the
//! tolerant locator, and scored by the total attribution mass flowing from
//! its token span to the queried output span.

use tracing::warn;

use crate::error::{AttributionError, Result};
use crate::locate::{find_subsequence, DEFAULT_TOLERANCE};
use crate::model::TextTokenizer;
use crate::query::Attribution;
use crate::span::Span;

/// Scores candidate documents against an attribution's output region
pub struct DocumentRanker<'a, T: TextTokenizer> {
    tokenizer: &'a T,
    tolerance: usize,
}

impl<'a, T: TextTokenizer> DocumentRanker<'a, T> {
    pub fn new(tokenizer: &'a T) -> Self {
        Self {
            tokenizer,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Override the locator's mismatch tolerance
    pub fn with_tolerance(mut self, tolerance: usize) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Rank `documents` by the attribution mass their token spans
    /// contribute to `output_span`, strongest first.
    ///
    /// Documents whose tokens cannot be located in the attributed sequence
    /// are dropped with a warning; the surviving entries keep their
    /// original indices. Returns `(original_index, score)` pairs sorted by
    /// score descending.
    pub fn rank(
        &self,
        attribution: &Attribution,
        output_span: &Span,
        documents: &[String],
    ) -> Result<Vec<(usize, f64)>> {
        let mut located_indices = Vec::with_capacity(documents.len());
        let mut document_spans = Vec::with_capacity(documents.len());

        for (index, document) in documents.iter().enumerate() {
            let document_tokens = self.tokenizer.encode(document)?;
            if document_tokens.is_empty() {
                warn!(index, "document tokenized to nothing, skipping");
                continue;
            }
            match find_subsequence(attribution.tokens(), &document_tokens, self.tolerance) {
                Ok(start) => {
                    located_indices.push(index);
                    document_spans.push(Span {
                        start: Some(start),
                        end: Some(start + document_tokens.len()),
                        step: 1,
                        window_size: document_tokens.len(),
                    });
                }
                Err(AttributionError::SubsequenceNotFound { .. }) => {
                    warn!(index, document = %document, "could not locate document in tokens, skipping");
                }
                Err(other) => return Err(other),
            }
        }

        let scored = attribution.get_many(output_span, &document_spans, None)?;
        let mut ranked: Vec<(usize, f64)> = located_indices
            .into_iter()
            .zip(scored.iter().map(|span| span.attribution))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::AttributionMatrix;

    /// Whitespace tokenizer: each word's id is its byte length
    struct WordLengthTokenizer;

    impl TextTokenizer for WordLengthTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text
                .split_whitespace()
                .map(|word| word.len() as u32)
                .collect())
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            Ok(ids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(" "))
        }
    }

    /// 6 tokens ("a bb ccc dddd bb a"); row 5 attributes to tokens 1..3
    fn fixture() -> Attribution {
        let tokens = WordLengthTokenizer.encode("a bb ccc dddd bb a").unwrap();
        let mut data = vec![0.0; 36];
        data[5 * 6 + 1] = 0.6;
        data[5 * 6 + 2] = 0.3;
        data[5 * 6 + 3] = 0.1;
        let matrix = AttributionMatrix::from_vec(6, 6, data).unwrap();
        Attribution::new(tokens, matrix).unwrap()
    }

    #[test]
    fn present_documents_ranked_by_mass_absent_ones_dropped() {
        let tokenizer = WordLengthTokenizer;
        let attribution = fixture();
        let documents = vec![
            "dddd".to_string(),           // token 3, mass 0.1
            "zz yyy xxxx www".to_string(), // not present
            "bb ccc".to_string(),          // tokens 1..3, mass 0.9
        ];

        let ranked = DocumentRanker::new(&tokenizer)
            .with_tolerance(0)
            .rank(&attribution, &Span::single(5), &documents)
            .unwrap();

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].0, 2);
        assert!((ranked[0].1 - 0.9).abs() < 1e-12);
        assert_eq!(ranked[1].0, 0);
        assert!((ranked[1].1 - 0.1).abs() < 1e-12);
        assert!(ranked.iter().all(|(index, _)| *index != 1));
    }

    #[test]
    fn short_absent_document_is_dropped_at_the_default_tolerance() {
        let tokenizer = WordLengthTokenizer;
        let attribution = fixture();
        // 2 tokens sharing nothing with the sequence; the default tolerance
        // must not let it pass as a match at offset 0
        let documents = vec!["zzzzzz yyyyyyy".to_string()];
        let ranked = DocumentRanker::new(&tokenizer)
            .rank(&attribution, &Span::single(5), &documents)
            .unwrap();
        assert!(ranked.is_empty());
    }

    #[test]
    fn document_absent_from_short_sequence_is_dropped_not_fatal() {
        let tokenizer = WordLengthTokenizer;
        let attribution = fixture();
        // longer than the whole sequence
        let documents = vec!["a a a a a a a a a".to_string()];
        let ranked = DocumentRanker::new(&tokenizer)
            .rank(&attribution, &Span::single(5), &documents)
            .unwrap();
        assert!(ranked.is_empty());
    }

    #[test]
    fn empty_document_is_skipped() {
        let tokenizer = WordLengthTokenizer;
        let attribution = fixture();
        let documents = vec![String::new(), "bb ccc".to_string()];
        let ranked = DocumentRanker::new(&tokenizer)
            .with_tolerance(0)
            .rank(&attribution, &Span::single(5), &documents)
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].0, 1);
    }

    #[test]
    fn tolerance_admits_slightly_different_tokenizations() {
        let tokenizer = WordLengthTokenizer;
        let attribution = fixture();
        // "bb cc" tokenizes to [2, 2]; tokens hold [2, 3] at offset 1
        let documents = vec!["bb cc".to_string()];

        let strict = DocumentRanker::new(&tokenizer)
            .with_tolerance(0)
            .rank(&attribution, &Span::single(5), &documents)
            .unwrap();
        assert!(strict.is_empty());

        let lenient = DocumentRanker::new(&tokenizer)
            .with_tolerance(1)
            .rank(&attribution, &Span::single(5), &documents)
            .unwrap();
        assert_eq!(lenient.len(), 1);
    }
}
