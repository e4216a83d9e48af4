// ---------------------------------------------------------------------------
// Similarity cache store
// ---------------------------------------------------------------------------
//
// Last computed user×place similarity, stamped with the vector versions it
// was computed against. Rows are keyed by role-ordered (user, place) keys.
// Writes are last-writer-wins on `calculated_at`; reads return clones of the
// committed row and never wait on a computation.
// ---------------------------------------------------------------------------

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{
	Entity, LiveVersions, PlaceId, UpsertOutcome, UserId, UserPlaceKey, UserPlaceSimilarity,
};

/// Whether a cached record must be recomputed.
///
/// Stale when older than `max_age_hours`, or when either side's live vector
/// version differs from the version the record was computed against.
pub fn is_stale(
	record: &UserPlaceSimilarity,
	live: &LiveVersions,
	max_age_hours: i64,
	now: DateTime<Utc>,
) -> bool {
	if record.user_vector_version != live.user || record.place_vector_version != live.place {
		return true;
	}
	now - record.calculated_at > Duration::hours(max_age_hours)
}

#[derive(Default)]
pub struct SimilarityCache {
	rows: RwLock<HashMap<UserPlaceKey, UserPlaceSimilarity>>,
}

impl SimilarityCache {
	pub fn new() -> Self {
		Self::default()
	}

	fn read(&self) -> RwLockReadGuard<'_, HashMap<UserPlaceKey, UserPlaceSimilarity>> {
		self.rows.read().unwrap_or_else(PoisonError::into_inner)
	}

	fn write(&self) -> RwLockWriteGuard<'_, HashMap<UserPlaceKey, UserPlaceSimilarity>> {
		self.rows.write().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn get(&self, key: &UserPlaceKey) -> Option<UserPlaceSimilarity> {
		self.read().get(key).cloned()
	}

	/// Insert or replace a row. A write older than the stored row is dropped.
	pub fn upsert(&self, record: UserPlaceSimilarity) -> UpsertOutcome {
		let mut rows = self.write();
		match rows.get(&record.key) {
			Some(existing) if existing.calculated_at > record.calculated_at => {
				tracing::debug!(
					user_id = record.key.user_id,
					place_id = record.key.place_id,
					"Dropping stale similarity write"
				);
				UpsertOutcome::Stale
			}
			Some(_) => {
				rows.insert(record.key, record);
				UpsertOutcome::Updated
			}
			None => {
				rows.insert(record.key, record);
				UpsertOutcome::Inserted
			}
		}
	}

	/// Best cached places for a user, weighted score descending, ties by key.
	/// Places in `exclude` never count toward `limit`.
	pub fn top_scores_for(
		&self,
		user_id: UserId,
		min_threshold: f64,
		limit: usize,
		exclude: &BTreeSet<PlaceId>,
	) -> Vec<UserPlaceSimilarity> {
		let mut matches: Vec<UserPlaceSimilarity> = self
			.read()
			.values()
			.filter(|r| r.key.user_id == user_id && r.result.weighted >= min_threshold)
			.filter(|r| !exclude.contains(&r.key.place_id))
			.cloned()
			.collect();
		matches.sort_by(|a, b| {
			b.result
				.weighted
				.total_cmp(&a.result.weighted)
				.then_with(|| a.key.cmp(&b.key))
		});
		matches.truncate(limit);
		matches
	}

	/// Drop every row that involves `entity`. Returns how many were removed.
	pub fn invalidate_entity(&self, entity: Entity) -> usize {
		let mut rows = self.write();
		let before = rows.len();
		rows.retain(|key, _| match entity {
			Entity::User(id) => key.user_id != id,
			Entity::Place(id) => key.place_id != id,
		});
		before - rows.len()
	}

	/// Drop rows computed before `cutoff`. Returns how many were removed.
	pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
		let mut rows = self.write();
		let before = rows.len();
		rows.retain(|_, r| r.calculated_at >= cutoff);
		before - rows.len()
	}

	pub fn len(&self) -> usize {
		self.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.read().is_empty()
	}

	/// All rows in key order.
	pub fn snapshot(&self) -> Vec<UserPlaceSimilarity> {
		let mut rows: Vec<UserPlaceSimilarity> = self.read().values().cloned().collect();
		rows.sort_by(|a, b| a.key.cmp(&b.key));
		rows
	}

	/// Replace the whole table, e.g. after loading a snapshot.
	pub fn restore(&self, rows: Vec<UserPlaceSimilarity>) {
		let mut map = self.write();
		map.clear();
		for row in rows {
			map.insert(row.key, row);
		}
	}
}
