// ---------------------------------------------------------------------------
// Pairwise place×place similarity table
// ---------------------------------------------------------------------------
//
// One row per unordered place pair, keyed by the canonical (low, high)
// `PairKey`. Content and behavioral writers share the table; the later
// `updated_at` wins. Every write marks both places dirty so the Top-K
// refresh knows which subjects to rebuild.
// ---------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{PairKey, PlaceId, PlaceSimilarity, UpsertOutcome};

/// Number of rows averaged by [`PairwiseStore::sample_averages`].
pub const STATISTICS_SAMPLE: usize = 100;

#[derive(Default)]
pub struct PairwiseStore {
	rows: RwLock<HashMap<PairKey, PlaceSimilarity>>,
	dirty: Mutex<BTreeSet<PlaceId>>,
}

impl PairwiseStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn read(&self) -> RwLockReadGuard<'_, HashMap<PairKey, PlaceSimilarity>> {
		self.rows.read().unwrap_or_else(PoisonError::into_inner)
	}

	fn write(&self) -> RwLockWriteGuard<'_, HashMap<PairKey, PlaceSimilarity>> {
		self.rows.write().unwrap_or_else(PoisonError::into_inner)
	}

	fn mark_dirty(&self, key: &PairKey) {
		let mut dirty = self.dirty.lock().unwrap_or_else(PoisonError::into_inner);
		dirty.insert(key.low());
		dirty.insert(key.high());
	}

	pub fn get(&self, a: PlaceId, b: PlaceId) -> Option<PlaceSimilarity> {
		self.read().get(&PairKey::new(a, b)).cloned()
	}

	/// Insert or replace the row for the record's pair.
	///
	/// The key is re-canonicalized before the write. A record older than the
	/// stored row is dropped; equal timestamps overwrite.
	pub fn upsert(&self, mut record: PlaceSimilarity) -> UpsertOutcome {
		record.key = record.key.canonical();
		let key = record.key;
		let outcome = {
			let mut rows = self.write();
			match rows.get(&key) {
				Some(existing) if existing.updated_at > record.updated_at => UpsertOutcome::Stale,
				Some(_) => {
					rows.insert(key, record);
					UpsertOutcome::Updated
				}
				None => {
					rows.insert(key, record);
					UpsertOutcome::Inserted
				}
			}
		};
		match outcome {
			UpsertOutcome::Stale => {
				tracing::debug!(low = key.low(), high = key.high(), "Dropping stale pairwise write");
			}
			_ => self.mark_dirty(&key),
		}
		outcome
	}

	/// Every row with `place_id` on either side.
	pub fn records_touching(&self, place_id: PlaceId) -> Vec<PlaceSimilarity> {
		let mut out: Vec<PlaceSimilarity> = self
			.read()
			.values()
			.filter(|r| r.key.contains(place_id))
			.cloned()
			.collect();
		out.sort_by(|a, b| a.key.cmp(&b.key));
		out
	}

	/// Remove rows last written before `cutoff` and mark their places dirty.
	/// Returns how many rows were removed.
	pub fn retain_updated_since(&self, cutoff: DateTime<Utc>) -> usize {
		let removed: Vec<PairKey> = {
			let mut rows = self.write();
			let stale: Vec<PairKey> = rows
				.iter()
				.filter(|(_, r)| r.updated_at < cutoff)
				.map(|(k, _)| *k)
				.collect();
			for key in &stale {
				rows.remove(key);
			}
			stale
		};
		for key in &removed {
			self.mark_dirty(key);
		}
		removed.len()
	}

	/// Drain the set of places whose rows changed since the last call.
	pub fn take_dirty(&self) -> BTreeSet<PlaceId> {
		let mut dirty = self.dirty.lock().unwrap_or_else(PoisonError::into_inner);
		std::mem::take(&mut *dirty)
	}

	/// Put places back into the dirty set after a rebuild that did not finish.
	pub fn requeue_dirty<I: IntoIterator<Item = PlaceId>>(&self, places: I) {
		self.dirty
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.extend(places);
	}

	pub fn dirty_count(&self) -> usize {
		self.dirty.lock().unwrap_or_else(PoisonError::into_inner).len()
	}

	/// Distinct place ids that appear in at least one row.
	pub fn places(&self) -> BTreeSet<PlaceId> {
		let rows = self.read();
		let mut out = BTreeSet::new();
		for key in rows.keys() {
			out.insert(key.low());
			out.insert(key.high());
		}
		out
	}

	pub fn len(&self) -> usize {
		self.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.read().is_empty()
	}

	/// Average jaccard and cosine_bin over the first [`STATISTICS_SAMPLE`]
	/// rows in key order. Returns `(avg_jaccard, avg_cosine, sample_size)`.
	pub fn sample_averages(&self) -> (f64, f64, usize) {
		let rows = self.snapshot();
		let sample: Vec<&PlaceSimilarity> = rows.iter().take(STATISTICS_SAMPLE).collect();
		if sample.is_empty() {
			return (0.0, 0.0, 0);
		}
		let n = sample.len() as f64;
		let jaccard = sample.iter().map(|r| r.jaccard).sum::<f64>() / n;
		let cosine = sample.iter().map(|r| r.cosine_bin).sum::<f64>() / n;
		(jaccard, cosine, sample.len())
	}

	/// All rows in key order.
	pub fn snapshot(&self) -> Vec<PlaceSimilarity> {
		let mut rows: Vec<PlaceSimilarity> = self.read().values().cloned().collect();
		rows.sort_by(|a, b| a.key.cmp(&b.key));
		rows
	}

	/// Replace the table. Rows are re-canonicalized; duplicates keep the
	/// newest. Restored places are not marked dirty.
	pub fn restore(&self, records: Vec<PlaceSimilarity>) {
		let mut rows = self.write();
		rows.clear();
		for mut record in records {
			record.key = record.key.canonical();
			match rows.get(&record.key) {
				Some(existing) if existing.updated_at > record.updated_at => {}
				_ => {
					rows.insert(record.key, record);
				}
			}
		}
	}
}
