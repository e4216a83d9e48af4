// ---------------------------------------------------------------------------
// Top-K neighbor maintenance
// ---------------------------------------------------------------------------
//
// Ranked neighbor lists per place, and per place + personality bucket.
// Lists are always rebuilt whole from the pairwise table and swapped in
// atomically; readers see either the previous list or the new one, never a
// mix of ranks from two cycles.
// ---------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use crate::error::AffinityError;
use crate::locks::KeyedMutex;
use crate::mbti::{MbtiRuleTable, PersonalityType};
use crate::pairwise::PairwiseStore;
use crate::providers::EmbeddingProvider;
use crate::retry::{self, RetryPolicy};
use crate::types::{
	Entity, JobReport, PlaceId, PlaceSimilarity, RankedNeighbor, TopKEntry, TopKSubject,
	HIGH_CONFIDENCE_THRESHOLD,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopKConfig {
	pub k: usize,
	pub jaccard_weight: f64,
	pub cosine_weight: f64,
	/// Multiplier applied in a personality bucket when a boost rule matches
	/// the neighbor.
	pub base_boost: f64,
	/// Personality buckets maintained next to the plain list.
	pub buckets: Vec<PersonalityType>,
	/// Subjects rebuilt concurrently by `rebuild_many`.
	pub parallelism: usize,
}

impl Default for TopKConfig {
	fn default() -> Self {
		Self {
			k: 100,
			jaccard_weight: 0.7,
			cosine_weight: 0.3,
			base_boost: 1.2,
			buckets: PersonalityType::all(),
			parallelism: 4,
		}
	}
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

pub fn blended_score(record: &PlaceSimilarity, config: &TopKConfig) -> f64 {
	config.jaccard_weight * record.jaccard + config.cosine_weight * record.cosine_bin
}

/// Rank every record touching `subject.place_id`.
///
/// Rows with neither signal are dropped. `multiplier` scales each
/// neighbor's score before sorting. Ties go to the lower neighbor id; ranks
/// are dense from 1.
pub fn rank_neighbors<F>(
	subject: TopKSubject,
	records: &[PlaceSimilarity],
	multiplier: F,
	config: &TopKConfig,
	now: DateTime<Utc>,
) -> Vec<TopKEntry>
where
	F: Fn(PlaceId) -> f64,
{
	let mut scored: Vec<(PlaceId, f64, &PlaceSimilarity)> = records
		.iter()
		.filter(|r| r.jaccard > 0.0 || r.cosine_bin > 0.0)
		.filter_map(|r| {
			let neighbor = r.key.other(subject.place_id)?;
			if neighbor == subject.place_id {
				return None;
			}
			Some((neighbor, blended_score(r, config) * multiplier(neighbor), r))
		})
		.collect();

	scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
	scored.truncate(config.k);

	scored
		.into_iter()
		.enumerate()
		.map(|(i, (neighbor_id, score, r))| TopKEntry {
			subject_id: subject.place_id,
			personality: subject.personality,
			neighbor_id,
			rank: i as u32 + 1,
			jaccard: r.jaccard,
			cosine_bin: r.cosine_bin,
			co_users: r.co_users,
			score,
			updated_at: now,
		})
		.collect()
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct Committed {
	built_at: DateTime<Utc>,
	entries: Arc<Vec<TopKEntry>>,
}

/// Committed lists, one per subject. Each list is replaced in one swap.
#[derive(Default)]
pub struct TopKStore {
	lists: RwLock<HashMap<TopKSubject, Committed>>,
}

impl TopKStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Swap in a freshly built list. A build older than the committed one
	/// is refused with `StaleWrite`.
	pub fn replace(
		&self,
		subject: TopKSubject,
		entries: Vec<TopKEntry>,
		built_at: DateTime<Utc>,
	) -> Result<(), AffinityError> {
		let mut lists = self.lists.write().unwrap_or_else(PoisonError::into_inner);
		if let Some(current) = lists.get(&subject) {
			if current.built_at > built_at {
				return Err(AffinityError::StaleWrite(format!(
					"top-k for place {} ({:?}) built at {} is older than {}",
					subject.place_id, subject.personality, built_at, current.built_at
				)));
			}
		}
		lists.insert(
			subject,
			Committed {
				built_at,
				entries: Arc::new(entries),
			},
		);
		Ok(())
	}

	/// The committed list, or an empty one.
	pub fn get(&self, subject: &TopKSubject) -> Arc<Vec<TopKEntry>> {
		self.lists
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(subject)
			.map(|c| c.entries.clone())
			.unwrap_or_default()
	}

	pub fn ranked(&self, subject: &TopKSubject, limit: usize) -> Vec<RankedNeighbor> {
		self.get(subject)
			.iter()
			.take(limit)
			.map(|e| RankedNeighbor {
				neighbor_id: e.neighbor_id,
				score: e.score,
			})
			.collect()
	}

	pub fn subjects(&self) -> usize {
		self.lists.read().unwrap_or_else(PoisonError::into_inner).len()
	}

	pub fn total_entries(&self) -> usize {
		self.lists
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.values()
			.map(|c| c.entries.len())
			.sum()
	}

	/// Every entry, ordered by subject then rank.
	pub fn snapshot(&self) -> Vec<TopKEntry> {
		let lists = self.lists.read().unwrap_or_else(PoisonError::into_inner);
		let mut subjects: Vec<&TopKSubject> = lists.keys().collect();
		subjects.sort();
		subjects
			.into_iter()
			.flat_map(|s| lists[s].entries.iter().cloned())
			.collect()
	}

	/// Rebuild the store from persisted entries.
	pub fn restore(&self, entries: Vec<TopKEntry>) {
		let mut grouped: HashMap<TopKSubject, Vec<TopKEntry>> = HashMap::new();
		for e in entries {
			let subject = TopKSubject {
				place_id: e.subject_id,
				personality: e.personality,
			};
			grouped.entry(subject).or_default().push(e);
		}
		let mut lists = self.lists.write().unwrap_or_else(PoisonError::into_inner);
		lists.clear();
		for (subject, mut entries) in grouped {
			entries.sort_by_key(|e| e.rank);
			let built_at = entries
				.iter()
				.map(|e| e.updated_at)
				.max()
				.unwrap_or(DateTime::<Utc>::MIN_UTC);
			lists.insert(
				subject,
				Committed {
					built_at,
					entries: Arc::new(entries),
				},
			);
		}
	}
}

// ---------------------------------------------------------------------------
// Maintainer
// ---------------------------------------------------------------------------

pub struct TopKMaintainer {
	config: TopKConfig,
	pairwise: Arc<PairwiseStore>,
	store: Arc<TopKStore>,
	embeddings: Arc<dyn EmbeddingProvider>,
	rules: Arc<MbtiRuleTable>,
	retry: RetryPolicy,
	locks: KeyedMutex<PlaceId>,
}

impl TopKMaintainer {
	pub fn new(
		config: TopKConfig,
		pairwise: Arc<PairwiseStore>,
		store: Arc<TopKStore>,
		embeddings: Arc<dyn EmbeddingProvider>,
		rules: Arc<MbtiRuleTable>,
		retry: RetryPolicy,
	) -> Self {
		Self {
			config,
			pairwise,
			store,
			embeddings,
			rules,
			retry,
			locks: KeyedMutex::new(),
		}
	}

	pub fn store(&self) -> &Arc<TopKStore> {
		&self.store
	}

	pub fn ranked_neighbors(
		&self,
		place_id: PlaceId,
		personality: Option<PersonalityType>,
		limit: usize,
	) -> Vec<RankedNeighbor> {
		self.store.ranked(
			&TopKSubject {
				place_id,
				personality,
			},
			limit,
		)
	}

	fn commit(&self, subject: TopKSubject, entries: Vec<TopKEntry>, built_at: DateTime<Utc>, report: &mut JobReport) {
		match self.store.replace(subject, entries, built_at) {
			Ok(()) => report.processed += 1,
			Err(e) => {
				tracing::debug!(place_id = subject.place_id, error = %e, "Top-K replace refused");
				report.skipped += 1;
			}
		}
	}

	/// High-confidence keyword ids for each neighbor that has a vector.
	async fn neighbor_keywords(
		&self,
		neighbors: &BTreeSet<PlaceId>,
	) -> Result<HashMap<PlaceId, BTreeSet<u32>>, AffinityError> {
		let mut out = HashMap::with_capacity(neighbors.len());
		for &id in neighbors {
			let vector = retry::with_backoff(&self.retry, "get_vector", || {
				self.embeddings.get_vector(Entity::Place(id))
			})
			.await?;
			if let Some(v) = vector {
				out.insert(id, v.keywords.ids_at_least(HIGH_CONFIDENCE_THRESHOLD));
			}
		}
		Ok(out)
	}

	/// Rebuild the plain list and every personality bucket for one place.
	///
	/// If neighbor keywords cannot be read the plain list is still written,
	/// the buckets keep their previous lists and the report is partial.
	pub async fn rebuild_subject(&self, place_id: PlaceId) -> JobReport {
		let _guard = self.locks.lock(&place_id).await;
		let mut report = JobReport::default();
		let now = Utc::now();
		let records = self.pairwise.records_touching(place_id);

		let plain = TopKSubject::place(place_id);
		let entries = rank_neighbors(plain, &records, |_| 1.0, &self.config, now);
		self.commit(plain, entries, now, &mut report);

		if self.config.buckets.is_empty() {
			return report;
		}

		let neighbors: BTreeSet<PlaceId> = records
			.iter()
			.filter_map(|r| r.key.other(place_id))
			.collect();
		let keywords = match self.neighbor_keywords(&neighbors).await {
			Ok(k) => k,
			Err(e) => {
				tracing::warn!(place_id, error = %e, "Skipping personality buckets");
				report.partial = true;
				report.failed += self.config.buckets.len();
				return report;
			}
		};

		let empty = BTreeSet::new();
		for &personality in &self.config.buckets {
			let subject = TopKSubject::bucket(place_id, personality);
			let entries = rank_neighbors(
				subject,
				&records,
				|neighbor| {
					let ids = keywords.get(&neighbor).unwrap_or(&empty);
					self.rules.boost(Some(&personality), ids, self.config.base_boost)
				},
				&self.config,
				now,
			);
			self.commit(subject, entries, now, &mut report);
		}
		report
	}

	/// Rebuild many subjects, a few at a time.
	pub async fn rebuild_many(&self, places: Vec<PlaceId>) -> JobReport {
		let started = Instant::now();
		let count = places.len();
		let parallelism = self.config.parallelism.max(1);
		let reports: Vec<JobReport> = stream::iter(places)
			.map(|place_id| self.rebuild_subject(place_id))
			.buffer_unordered(parallelism)
			.collect()
			.await;

		let mut total = JobReport::default();
		for r in &reports {
			total.merge(r);
		}
		total.elapsed_ms = started.elapsed().as_millis() as u64;
		tracing::info!(
			subjects = count,
			lists = total.processed,
			failed = total.failed,
			elapsed_ms = total.elapsed_ms,
			"Top-K rebuild finished"
		);
		total
	}
}
