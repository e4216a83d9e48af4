// ---------------------------------------------------------------------------
// Similarity scorer
// ---------------------------------------------------------------------------
//
// Combines kernel outputs into one weighted score per (user, place) pair,
// and derives the content-based place×place record stored in the pairwise
// table.
// ---------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::AffinityError;
use crate::kernel;
use crate::mbti::{MbtiRuleTable, PersonalityType};
use crate::types::{
	EmbeddingVector, PairKey, PlaceId, PlaceSimilarity, SignalSource, SimilarityResult,
	HIGH_CONFIDENCE_THRESHOLD, MAX_KEYWORDS,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScorerWeights {
	pub cosine: f64,
	pub jaccard: f64,
	/// Multiplier applied when a personality rule matches.
	pub mbti_boost: f64,
	/// Keyword confidence cut-off for Jaccard and common-keyword counts.
	pub confidence_threshold: f64,
}

impl Default for ScorerWeights {
	fn default() -> Self {
		Self {
			cosine: 0.7,
			jaccard: 0.3,
			mbti_boost: 1.2,
			confidence_threshold: 0.3,
		}
	}
}

/// Combine cosine and jaccard with a personality multiplier, clamped to
/// `[0, 1]`.
pub fn weighted_score(cosine: f64, jaccard: f64, multiplier: f64, weights: &ScorerWeights) -> f64 {
	let raw = (cosine * weights.cosine + jaccard * weights.jaccard) * multiplier;
	if !raw.is_finite() {
		return 0.0;
	}
	raw.clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// SimilarityScorer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SimilarityScorer {
	weights: ScorerWeights,
	rules: Arc<MbtiRuleTable>,
}

impl SimilarityScorer {
	pub fn new(weights: ScorerWeights, rules: Arc<MbtiRuleTable>) -> Self {
		Self { weights, rules }
	}

	pub fn weights(&self) -> &ScorerWeights {
		&self.weights
	}

	pub fn rules(&self) -> &MbtiRuleTable {
		&self.rules
	}

	/// Score one user against one place.
	///
	/// Dimension mismatches propagate: they mean an upstream schema or
	/// versioning bug, not a weak match.
	pub fn score_user_place(
		&self,
		user: &EmbeddingVector,
		personality: Option<&PersonalityType>,
		place: &EmbeddingVector,
	) -> Result<SimilarityResult, AffinityError> {
		let threshold = self.weights.confidence_threshold;
		let cosine = kernel::cosine(&user.values, &place.values)?;
		let euclidean_distance = kernel::euclidean_distance(&user.values, &place.values)?;
		let jaccard = kernel::jaccard(&user.keywords, &place.keywords, threshold);

		let place_ids = place.keywords.ids_at_least(HIGH_CONFIDENCE_THRESHOLD);
		let mbti_boost = self
			.rules
			.boost(personality, &place_ids, self.weights.mbti_boost);

		let common = kernel::common_keyword_ids(&user.keywords, &place.keywords, threshold);
		let overlap_ratio = if place.keywords.is_empty() {
			0.0
		} else {
			common.len() as f64 / MAX_KEYWORDS as f64
		};

		Ok(SimilarityResult {
			cosine,
			jaccard,
			euclidean_distance,
			mbti_boost,
			weighted: weighted_score(cosine, jaccard, mbti_boost, &self.weights),
			common_keywords: common.len(),
			overlap_ratio,
		})
	}

	/// Compare two places by content. No personality applies, so the
	/// multiplier is always 1.0.
	pub fn compare_places(
		&self,
		a: &EmbeddingVector,
		b: &EmbeddingVector,
	) -> Result<SimilarityResult, AffinityError> {
		self.score_user_place(a, None, b)
	}

	/// Content-based place×place record for the pairwise table.
	pub fn score_places(
		&self,
		a_id: PlaceId,
		a: &EmbeddingVector,
		b_id: PlaceId,
		b: &EmbeddingVector,
		now: DateTime<Utc>,
	) -> Result<PlaceSimilarity, AffinityError> {
		let result = self.compare_places(a, b)?;
		Ok(place_record(a_id, b_id, &result, now))
	}
}

/// Pairwise row for a content comparison.
///
/// Cosine is shifted from `[-1, 1]` into `[0, 1]` before binning so the
/// stored value shares the range of the behavioral score.
pub fn place_record(
	a_id: PlaceId,
	b_id: PlaceId,
	result: &SimilarityResult,
	now: DateTime<Utc>,
) -> PlaceSimilarity {
	PlaceSimilarity {
		key: PairKey::new(a_id, b_id),
		jaccard: kernel::quantize(result.jaccard),
		cosine_bin: kernel::quantize((result.cosine + 1.0) / 2.0),
		co_users: 0.0,
		co_count: 0,
		source: SignalSource::Content,
		updated_at: now,
	}
}

/// Confidence-threshold filter used by batch jobs.
pub fn passes(result: &SimilarityResult, min_weighted: f64) -> bool {
	result.weighted >= min_weighted
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::KeywordSet;

	fn vector(values: Vec<f32>, keywords: &[(u32, f64)]) -> EmbeddingVector {
		EmbeddingVector {
			values,
			keywords: KeywordSet::from_pairs(keywords),
			version: 1,
		}
	}

	fn scorer() -> SimilarityScorer {
		SimilarityScorer::new(ScorerWeights::default(), Arc::new(MbtiRuleTable::default()))
	}

	#[test]
	fn weighted_combines_cosine_and_jaccard() {
		let user = vector(vec![1.0, 0.0], &[(1, 0.9), (2, 0.9)]);
		let place = vector(vec![1.0, 0.0], &[(1, 0.9), (3, 0.9)]);
		let r = scorer().score_user_place(&user, None, &place).unwrap();
		assert!((r.cosine - 1.0).abs() < 1e-12);
		assert!((r.jaccard - 1.0 / 3.0).abs() < 1e-12);
		assert_eq!(r.mbti_boost, 1.0);
		assert!((r.weighted - (0.7 + 0.3 / 3.0)).abs() < 1e-12);
		assert_eq!(r.common_keywords, 1);
		assert!((r.overlap_ratio - 1.0 / 15.0).abs() < 1e-12);
		assert_eq!(r.euclidean_distance, 0.0);
	}

	#[test]
	fn clamp_triggers_when_boost_overflows() {
		let user = vector(vec![1.0, 0.0], &[(16, 0.9)]);
		let place = vector(vec![1.0, 0.0], &[(16, 0.9)]);
		let p: PersonalityType = "INTJ".parse().unwrap();
		let r = scorer().score_user_place(&user, Some(&p), &place).unwrap();
		assert_eq!(r.mbti_boost, 1.2);
		// (1.0 * 0.7 + 1.0 * 0.3) * 1.2 = 1.2, clamped
		assert_eq!(r.weighted, 1.0);
	}

	#[test]
	fn weighted_stays_in_unit_interval() {
		let weights = ScorerWeights::default();
		for ci in 0..=10 {
			for ji in 0..=10 {
				for mi in 0..=10 {
					let c = ci as f64 / 10.0;
					let j = ji as f64 / 10.0;
					let m = 1.0 + mi as f64 / 5.0;
					let w = weighted_score(c, j, m, &weights);
					assert!((0.0..=1.0).contains(&w));
					if (c * 0.7 + j * 0.3) * m > 1.0 {
						assert_eq!(w, 1.0);
					}
				}
			}
		}
	}

	#[test]
	fn dimension_mismatch_propagates() {
		let user = vector(vec![1.0, 0.0, 0.0], &[]);
		let place = vector(vec![1.0, 0.0], &[]);
		let err = scorer().score_user_place(&user, None, &place).unwrap_err();
		assert!(matches!(err, AffinityError::DimensionMismatch { .. }));
	}

	#[test]
	fn overlap_ratio_uses_slot_budget() {
		let kw: Vec<(u32, f64)> = (0..3).map(|i| (i, 0.9)).collect();
		let user = vector(vec![0.5, 0.5], &kw);
		let place = vector(vec![0.5, 0.5], &kw);
		let r = scorer().score_user_place(&user, None, &place).unwrap();
		assert_eq!(r.common_keywords, 3);
		assert!((r.overlap_ratio - 0.2).abs() < 1e-12);
	}

	#[test]
	fn place_pair_record_is_canonical_and_binned() {
		let a = vector(vec![1.0, 0.0], &[(1, 0.9)]);
		let b = vector(vec![0.0, 1.0], &[(1, 0.9)]);
		let rec = scorer().score_places(9, &a, 4, &b, Utc::now()).unwrap();
		assert_eq!(rec.key.low(), 4);
		assert_eq!(rec.key.high(), 9);
		assert_eq!(rec.cosine_bin, 0.5);
		assert_eq!(rec.jaccard, 1.0);
		assert_eq!(rec.source, SignalSource::Content);
	}

	#[test]
	fn passes_filters_weak_pairs() {
		let r = SimilarityResult {
			cosine: 0.1,
			jaccard: 0.0,
			euclidean_distance: 1.0,
			mbti_boost: 1.0,
			weighted: 0.07,
			common_keywords: 0,
			overlap_ratio: 0.0,
		};
		assert!(!passes(&r, 0.1));
		assert!(passes(&r, 0.05));
	}
}
