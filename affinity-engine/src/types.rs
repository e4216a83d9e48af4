use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::mbti::PersonalityType;

/// Length of every embedding produced by the extraction pipeline.
pub const EMBEDDING_DIM: usize = 100;

/// Keyword slot budget per embedding. Overlap ratios divide by this.
pub const MAX_KEYWORDS: usize = 15;

/// Keywords below this confidence are ignored for Jaccard and overlap.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.3;

/// Keywords at or above this confidence drive the MBTI boost lookup.
pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.4;

pub type PlaceId = u64;
pub type UserId = u64;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Owner of an embedding vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum Entity {
	User(UserId),
	Place(PlaceId),
}

// ---------------------------------------------------------------------------
// Keywords
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedKeyword {
	#[serde(rename = "keywordId")]
	pub keyword_id: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub keyword: Option<String>,
	pub confidence: f64,
}

/// Ordered (keyword id, confidence) list attached to an embedding.
///
/// Construction truncates to [`MAX_KEYWORDS`] entries and clamps every
/// confidence into `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<SelectedKeyword>", into = "Vec<SelectedKeyword>")]
pub struct KeywordSet(Vec<SelectedKeyword>);

impl KeywordSet {
	pub fn new(mut keywords: Vec<SelectedKeyword>) -> Self {
		keywords.truncate(MAX_KEYWORDS);
		for k in keywords.iter_mut() {
			k.confidence = if k.confidence.is_finite() {
				k.confidence.clamp(0.0, 1.0)
			} else {
				0.0
			};
		}
		Self(keywords)
	}

	/// Convenience constructor from bare `(id, confidence)` pairs.
	pub fn from_pairs(pairs: &[(u32, f64)]) -> Self {
		Self::new(
			pairs
				.iter()
				.map(|&(keyword_id, confidence)| SelectedKeyword {
					keyword_id,
					keyword: None,
					confidence,
				})
				.collect(),
		)
	}

	pub fn iter(&self) -> impl Iterator<Item = &SelectedKeyword> {
		self.0.iter()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Distinct keyword labels, where the extractor supplied one.
	pub fn labels(&self) -> BTreeSet<&str> {
		self.0.iter().filter_map(|k| k.keyword.as_deref()).collect()
	}

	/// Keyword ids whose confidence is at least `threshold`.
	pub fn ids_at_least(&self, threshold: f64) -> BTreeSet<u32> {
		self.0
			.iter()
			.filter(|k| k.confidence >= threshold)
			.map(|k| k.keyword_id)
			.collect()
	}
}

impl From<Vec<SelectedKeyword>> for KeywordSet {
	fn from(keywords: Vec<SelectedKeyword>) -> Self {
		Self::new(keywords)
	}
}

impl From<KeywordSet> for Vec<SelectedKeyword> {
	fn from(set: KeywordSet) -> Self {
		set.0
	}
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

/// One entity's embedding. Replaced wholesale on re-extraction, never
/// mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
	pub values: Vec<f32>,
	pub keywords: KeywordSet,
	pub version: u64,
}

/// Vector versions live at the time of a staleness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveVersions {
	pub user: u64,
	pub place: u64,
}

// ---------------------------------------------------------------------------
// Pairwise place×place records
// ---------------------------------------------------------------------------

/// Unordered pair of place ids stored as `(low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
	low: PlaceId,
	high: PlaceId,
}

impl PairKey {
	/// Canonicalize an unordered pair. `new(5, 3) == new(3, 5)`.
	pub fn new(a: PlaceId, b: PlaceId) -> Self {
		Self {
			low: a.min(b),
			high: a.max(b),
		}
	}

	pub fn low(&self) -> PlaceId {
		self.low
	}

	pub fn high(&self) -> PlaceId {
		self.high
	}

	pub fn contains(&self, id: PlaceId) -> bool {
		self.low == id || self.high == id
	}

	/// The member of the pair that is not `id`, if `id` is a member.
	pub fn other(&self, id: PlaceId) -> Option<PlaceId> {
		if self.low == id {
			Some(self.high)
		} else if self.high == id {
			Some(self.low)
		} else {
			None
		}
	}

	/// Re-apply the ordering rule, for keys read back from storage.
	pub fn canonical(self) -> Self {
		Self::new(self.low, self.high)
	}
}

/// Which signal produced a pairwise record. Informational only; ranking
/// treats both the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalSource {
	Content,
	Behavioral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceSimilarity {
	pub key: PairKey,
	pub jaccard: f64,
	pub cosine_bin: f64,
	pub co_users: f64,
	pub co_count: u32,
	pub source: SignalSource,
	pub updated_at: DateTime<Utc>,
}

/// Result of a last-writer-wins upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
	Inserted,
	Updated,
	/// The stored row is newer; the write was dropped.
	Stale,
}

// ---------------------------------------------------------------------------
// User×place records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPlaceKey {
	pub user_id: UserId,
	pub place_id: PlaceId,
}

impl UserPlaceKey {
	/// Order an (entity, entity) pair by role. Returns `None` unless exactly
	/// one side is a user and the other a place.
	pub fn from_entities(a: Entity, b: Entity) -> Option<Self> {
		match (a, b) {
			(Entity::User(user_id), Entity::Place(place_id))
			| (Entity::Place(place_id), Entity::User(user_id)) => Some(Self { user_id, place_id }),
			_ => None,
		}
	}
}

/// Output of the similarity scorer for one (user, place) or (place, place)
/// comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityResult {
	pub cosine: f64,
	pub jaccard: f64,
	pub euclidean_distance: f64,
	pub mbti_boost: f64,
	pub weighted: f64,
	pub common_keywords: usize,
	pub overlap_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPlaceSimilarity {
	pub key: UserPlaceKey,
	pub result: SimilarityResult,
	pub calculated_at: DateTime<Utc>,
	pub user_vector_version: u64,
	pub place_vector_version: u64,
}

/// A cached user×place row together with the keyword labels the user and
/// the place share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceMatch {
	#[serde(flatten)]
	pub similarity: UserPlaceSimilarity,
	pub matching_keywords: Vec<String>,
}

// ---------------------------------------------------------------------------
// Top-K
// ---------------------------------------------------------------------------

/// A ranked-list owner: a place, optionally narrowed to one personality
/// bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopKSubject {
	pub place_id: PlaceId,
	pub personality: Option<PersonalityType>,
}

impl TopKSubject {
	pub fn place(place_id: PlaceId) -> Self {
		Self {
			place_id,
			personality: None,
		}
	}

	pub fn bucket(place_id: PlaceId, personality: PersonalityType) -> Self {
		Self {
			place_id,
			personality: Some(personality),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopKEntry {
	pub subject_id: PlaceId,
	pub personality: Option<PersonalityType>,
	pub neighbor_id: PlaceId,
	pub rank: u32,
	pub jaccard: f64,
	pub cosine_bin: f64,
	pub co_users: f64,
	pub score: f64,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedNeighbor {
	pub neighbor_id: PlaceId,
	pub score: f64,
}

// ---------------------------------------------------------------------------
// Bookmarks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkEvent {
	pub user_id: UserId,
	pub place_id: PlaceId,
	#[serde(default)]
	pub personality: Option<PersonalityType>,
	pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Recompute targets / reporting
// ---------------------------------------------------------------------------

/// What a recomputation job covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "camelCase")]
pub enum RecomputeTarget {
	All,
	Place {
		#[serde(rename = "placeId")]
		place_id: PlaceId,
	},
	Pair {
		a: PlaceId,
		b: PlaceId,
	},
}

impl RecomputeTarget {
	/// Pair ids in ascending order, so `(a, b)` and `(b, a)` coalesce as one
	/// job.
	pub fn canonical(self) -> Self {
		match self {
			Self::Pair { a, b } => {
				let key = PairKey::new(a, b);
				Self::Pair {
					a: key.low(),
					b: key.high(),
				}
			}
			other => other,
		}
	}
}

impl std::fmt::Display for RecomputeTarget {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::All => write!(f, "all"),
			Self::Place { place_id } => write!(f, "place:{}", place_id),
			Self::Pair { a, b } => {
				let key = PairKey::new(*a, *b);
				write!(f, "pair:{}-{}", key.low(), key.high())
			}
		}
	}
}

/// Outcome of one background job run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
	pub processed: usize,
	pub skipped: usize,
	pub failed: usize,
	/// Set when an upstream stayed unavailable after retries.
	pub partial: bool,
	pub elapsed_ms: u64,
}

impl JobReport {
	pub fn merge(&mut self, other: &JobReport) {
		self.processed += other.processed;
		self.skipped += other.skipped;
		self.failed += other.failed;
		self.partial |= other.partial;
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityStatistics {
	pub total_pairs: usize,
	pub total_top_k_entries: usize,
	pub cached_user_place: usize,
	pub average_jaccard: f64,
	pub average_cosine: f64,
	pub sample_size: usize,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pair_key_canonicalizes() {
		assert_eq!(PairKey::new(5, 3), PairKey::new(3, 5));
		let key = PairKey::new(9, 2);
		assert_eq!(key.low(), 2);
		assert_eq!(key.high(), 9);
		assert_eq!(key.other(2), Some(9));
		assert_eq!(key.other(9), Some(2));
		assert_eq!(key.other(4), None);
	}

	#[test]
	fn keyword_set_truncates_and_clamps() {
		let pairs: Vec<(u32, f64)> = (0..20).map(|i| (i, 1.5)).collect();
		let set = KeywordSet::from_pairs(&pairs);
		assert_eq!(set.len(), MAX_KEYWORDS);
		assert!(set.iter().all(|k| k.confidence == 1.0));
	}

	#[test]
	fn keyword_set_filters_by_confidence() {
		let set = KeywordSet::from_pairs(&[(1, 0.9), (2, 0.3), (3, 0.1)]);
		let ids = set.ids_at_least(0.3);
		assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1, 2]);
	}

	#[test]
	fn user_place_key_orders_by_role() {
		let a = UserPlaceKey::from_entities(Entity::User(7), Entity::Place(3));
		let b = UserPlaceKey::from_entities(Entity::Place(3), Entity::User(7));
		assert_eq!(a, b);
		assert!(UserPlaceKey::from_entities(Entity::Place(1), Entity::Place(2)).is_none());
	}

	#[test]
	fn recompute_target_parses_from_json() {
		let t: RecomputeTarget = serde_json::from_str(r#"{"target":"all"}"#).unwrap();
		assert_eq!(t, RecomputeTarget::All);
		let t: RecomputeTarget =
			serde_json::from_str(r#"{"target":"place","placeId":4}"#).unwrap();
		assert_eq!(t, RecomputeTarget::Place { place_id: 4 });
		assert_eq!(RecomputeTarget::Pair { a: 9, b: 2 }.to_string(), "pair:2-9");
	}

	#[test]
	fn pair_targets_canonicalize() {
		let target = RecomputeTarget::Pair { a: 9, b: 2 }.canonical();
		assert_eq!(target, RecomputeTarget::Pair { a: 2, b: 9 });
		assert_eq!(target.to_string(), "pair:2-9");
		assert_eq!(RecomputeTarget::All.canonical(), RecomputeTarget::All);
	}
}
