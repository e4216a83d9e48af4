// ---------------------------------------------------------------------------
// Vector math kernel
// ---------------------------------------------------------------------------
//
// Pure functions over embeddings and keyword sets. No state, no I/O; safe to
// call from any number of workers at once.
// ---------------------------------------------------------------------------

use std::collections::BTreeSet;

use crate::error::AffinityError;
use crate::types::KeywordSet;

/// Number of discrete steps per unit used when quantizing stored scores.
pub const BIN_SCALE: f64 = 10_000.0;

fn ensure_same_len(a: &[f32], b: &[f32]) -> Result<(), AffinityError> {
	if a.len() != b.len() {
		return Err(AffinityError::DimensionMismatch {
			left: a.len(),
			right: b.len(),
		});
	}
	Ok(())
}

/// Cosine similarity in `[-1, 1]`.
///
/// Returns 0.0 when either vector has zero magnitude.
pub fn cosine(a: &[f32], b: &[f32]) -> Result<f64, AffinityError> {
	ensure_same_len(a, b)?;

	let mut dot: f64 = 0.0;
	let mut norm_a: f64 = 0.0;
	let mut norm_b: f64 = 0.0;

	for (&x, &y) in a.iter().zip(b.iter()) {
		let ai = x as f64;
		let bi = y as f64;
		dot += ai * bi;
		norm_a += ai * ai;
		norm_b += bi * bi;
	}

	if norm_a == 0.0 || norm_b == 0.0 {
		return Ok(0.0);
	}

	let result = dot / (norm_a.sqrt() * norm_b.sqrt());
	if !result.is_finite() {
		return Ok(0.0);
	}
	Ok(result.clamp(-1.0, 1.0))
}

/// Euclidean (L2) distance between two vectors.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f64, AffinityError> {
	ensure_same_len(a, b)?;
	let sum: f64 = a
		.iter()
		.zip(b.iter())
		.map(|(&x, &y)| {
			let d = x as f64 - y as f64;
			d * d
		})
		.sum();
	Ok(sum.sqrt())
}

/// Compute the magnitude (L2 norm) of a vector.
pub fn magnitude(embedding: &[f32]) -> f64 {
	embedding
		.iter()
		.map(|&v| (v as f64) * (v as f64))
		.sum::<f64>()
		.sqrt()
}

/// Jaccard overlap of two keyword sets after dropping keywords below
/// `threshold`.
///
/// Two sets that are both empty after filtering score 1.0: two entities with
/// no keyword signal count as identical, not unrelated.
pub fn jaccard(a: &KeywordSet, b: &KeywordSet, threshold: f64) -> f64 {
	jaccard_ids(&a.ids_at_least(threshold), &b.ids_at_least(threshold))
}

/// Jaccard over already-filtered id sets.
pub fn jaccard_ids(a: &BTreeSet<u32>, b: &BTreeSet<u32>) -> f64 {
	if a.is_empty() && b.is_empty() {
		return 1.0;
	}
	let intersection = a.intersection(b).count();
	let union = a.union(b).count();
	intersection as f64 / union as f64
}

/// Keyword ids present in both sets at or above `threshold`, ascending.
pub fn common_keyword_ids(a: &KeywordSet, b: &KeywordSet, threshold: f64) -> Vec<u32> {
	let left = a.ids_at_least(threshold);
	let right = b.ids_at_least(threshold);
	left.intersection(&right).copied().collect()
}

/// Keyword labels both sets carry, sorted. Unlabeled keywords and
/// confidence are ignored.
pub fn matching_keyword_labels(a: &KeywordSet, b: &KeywordSet) -> Vec<String> {
	let right = b.labels();
	a.labels()
		.intersection(&right)
		.map(|label| label.to_string())
		.collect()
}

/// Round a score in `[0, 1]` to [`BIN_SCALE`] steps.
pub fn quantize(score: f64) -> f64 {
	if !score.is_finite() {
		return 0.0;
	}
	(score.clamp(0.0, 1.0) * BIN_SCALE).round() / BIN_SCALE
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::SelectedKeyword;

	#[test]
	fn identical_vectors() {
		let v = vec![1.0f32, 2.0, 3.0];
		let sim = cosine(&v, &v).unwrap();
		assert!((sim - 1.0).abs() < 1e-10);
	}

	#[test]
	fn self_similarity_holds_for_many_vectors() {
		for seed in 1..50u32 {
			let v: Vec<f32> = (0..100)
				.map(|i| (((i as u32 * 31 + seed * 17) % 97) as f32 - 48.0) / 7.0)
				.collect();
			let sim = cosine(&v, &v).unwrap();
			assert!((sim - 1.0).abs() < 1e-9, "seed {} gave {}", seed, sim);
		}
	}

	#[test]
	fn orthogonal_vectors() {
		let a = vec![1.0f32, 0.0];
		let b = vec![0.0f32, 1.0];
		assert!(cosine(&a, &b).unwrap().abs() < 1e-10);
	}

	#[test]
	fn opposite_vectors() {
		let a = vec![1.0f32, 0.0];
		let b = vec![-1.0f32, 0.0];
		assert!((cosine(&a, &b).unwrap() + 1.0).abs() < 1e-10);
	}

	#[test]
	fn mismatched_lengths_fail() {
		let err = cosine(&[1.0], &[1.0, 2.0]).unwrap_err();
		assert!(matches!(
			err,
			AffinityError::DimensionMismatch { left: 1, right: 2 }
		));
		assert!(euclidean_distance(&[1.0], &[1.0, 2.0]).is_err());
	}

	#[test]
	fn zero_magnitude() {
		let a = vec![0.0f32, 0.0];
		let b = vec![1.0f32, 2.0];
		assert_eq!(cosine(&a, &b).unwrap(), 0.0);
		assert_eq!(cosine(&a, &a).unwrap(), 0.0);
	}

	#[test]
	fn euclidean_basic() {
		let a = vec![0.0f32, 0.0];
		let b = vec![3.0f32, 4.0];
		assert!((euclidean_distance(&a, &b).unwrap() - 5.0).abs() < 1e-10);
		assert_eq!(euclidean_distance(&b, &b).unwrap(), 0.0);
	}

	#[test]
	fn magnitude_basic() {
		assert!((magnitude(&[3.0, 4.0]) - 5.0).abs() < 1e-10);
		assert_eq!(magnitude(&[]), 0.0);
	}

	#[test]
	fn jaccard_self_is_one() {
		let s = KeywordSet::from_pairs(&[(1, 0.9), (2, 0.5), (3, 0.4)]);
		assert_eq!(jaccard(&s, &s, 0.3), 1.0);
	}

	#[test]
	fn jaccard_both_empty_is_one() {
		let empty = KeywordSet::default();
		assert_eq!(jaccard(&empty, &empty, 0.3), 1.0);
	}

	#[test]
	fn jaccard_one_empty_is_zero() {
		let s = KeywordSet::from_pairs(&[(1, 0.9)]);
		let empty = KeywordSet::default();
		assert_eq!(jaccard(&s, &empty, 0.3), 0.0);
		assert_eq!(jaccard(&empty, &s, 0.3), 0.0);
	}

	#[test]
	fn jaccard_ignores_low_confidence() {
		let a = KeywordSet::from_pairs(&[(1, 0.9), (2, 0.1)]);
		let b = KeywordSet::from_pairs(&[(1, 0.8), (3, 0.2)]);
		// After filtering both are {1}
		assert_eq!(jaccard(&a, &b, 0.3), 1.0);
		// Low-confidence-only sets filter down to empty on both sides
		let c = KeywordSet::from_pairs(&[(5, 0.1)]);
		let d = KeywordSet::from_pairs(&[(6, 0.2)]);
		assert_eq!(jaccard(&c, &d, 0.3), 1.0);
	}

	#[test]
	fn jaccard_partial_overlap() {
		let a = KeywordSet::from_pairs(&[(1, 0.9), (2, 0.9)]);
		let b = KeywordSet::from_pairs(&[(2, 0.9), (3, 0.9)]);
		assert!((jaccard(&a, &b, 0.3) - 1.0 / 3.0).abs() < 1e-12);
		assert_eq!(common_keyword_ids(&a, &b, 0.3), vec![2]);
	}

	#[test]
	fn matching_labels_ignore_unlabeled_keywords() {
		let labeled = |id: u32, label: Option<&str>| SelectedKeyword {
			keyword_id: id,
			keyword: label.map(str::to_string),
			confidence: 0.1,
		};
		let a = KeywordSet::new(vec![
			labeled(1, Some("quiet")),
			labeled(2, Some("cozy")),
			labeled(3, None),
		]);
		let b = KeywordSet::new(vec![
			labeled(9, Some("cozy")),
			labeled(1, Some("quiet")),
			labeled(3, None),
			labeled(4, Some("loud")),
		]);
		assert_eq!(matching_keyword_labels(&a, &b), vec!["cozy", "quiet"]);
		assert!(matching_keyword_labels(&a, &KeywordSet::default()).is_empty());
	}

	#[test]
	fn quantize_rounds_to_four_decimals() {
		assert_eq!(quantize(0.123456), 0.1235);
		assert_eq!(quantize(1.7), 1.0);
		assert_eq!(quantize(-0.2), 0.0);
		assert_eq!(quantize(f64::NAN), 0.0);
	}
}
