// ---------------------------------------------------------------------------
// Co-occurrence aggregator
// ---------------------------------------------------------------------------
//
// Derives behavioral place×place scores from bookmark history. Two places
// co-occur for a user when that user bookmarked both and the later of the
// two bookmarks falls inside the lookback window. Only a user's latest
// bookmark per place counts.
// ---------------------------------------------------------------------------

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::kernel;
use crate::types::{BookmarkEvent, PairKey, PlaceId, PlaceSimilarity, SignalSource, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CooccurrenceConfig {
	pub lookback_days: i64,
	pub same_mbti_weight: f64,
	pub diff_mbti_weight: f64,
	/// Pairs with fewer qualifying users than this are discarded.
	pub min_co_count: u32,
}

impl Default for CooccurrenceConfig {
	fn default() -> Self {
		Self {
			lookback_days: 90,
			same_mbti_weight: 2.0,
			diff_mbti_weight: 1.0,
			min_co_count: 2,
		}
	}
}

impl CooccurrenceConfig {
	pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
		now - Duration::days(self.lookback_days)
	}
}

#[derive(Default)]
struct PairAccumulator {
	co_users: f64,
	users: BTreeSet<UserId>,
}

/// Latest bookmark per (user, place).
fn latest_per_user(events: &[BookmarkEvent]) -> BTreeMap<UserId, BTreeMap<PlaceId, &BookmarkEvent>> {
	let mut by_user: BTreeMap<UserId, BTreeMap<PlaceId, &BookmarkEvent>> = BTreeMap::new();
	for event in events {
		let places = by_user.entry(event.user_id).or_default();
		match places.get(&event.place_id) {
			Some(existing) if existing.created_at >= event.created_at => {}
			_ => {
				places.insert(event.place_id, event);
			}
		}
	}
	by_user
}

fn aggregate_inner(
	events: &[BookmarkEvent],
	only: Option<PairKey>,
	now: DateTime<Utc>,
	config: &CooccurrenceConfig,
) -> Vec<PlaceSimilarity> {
	let cutoff = config.cutoff(now);
	let by_user = latest_per_user(events);

	let mut in_window: HashMap<PlaceId, BTreeSet<UserId>> = HashMap::new();
	let mut pairs: BTreeMap<PairKey, PairAccumulator> = BTreeMap::new();

	for (&user_id, places) in &by_user {
		for (&place_id, event) in places {
			if event.created_at >= cutoff {
				in_window.entry(place_id).or_default().insert(user_id);
			}
		}

		let list: Vec<&BookmarkEvent> = places.values().copied().collect();
		for (i, ex) in list.iter().enumerate() {
			for ey in &list[i + 1..] {
				let key = PairKey::new(ex.place_id, ey.place_id);
				if only.is_some_and(|k| k != key) {
					continue;
				}
				if ex.created_at.max(ey.created_at) < cutoff {
					continue;
				}
				let weight = match (ex.personality, ey.personality) {
					(Some(p), Some(q)) if p == q => config.same_mbti_weight,
					_ => config.diff_mbti_weight,
				};
				let acc = pairs.entry(key).or_default();
				acc.co_users += weight;
				acc.users.insert(user_id);
			}
		}
	}

	let empty = BTreeSet::new();
	let mut out = Vec::new();
	for (key, acc) in pairs {
		let co_count = acc.users.len() as u32;
		if co_count < config.min_co_count {
			continue;
		}
		// Users behind a qualifying co-occurrence count toward both sides even
		// when their older bookmark predates the window.
		let ux: BTreeSet<UserId> = in_window
			.get(&key.low())
			.unwrap_or(&empty)
			.union(&acc.users)
			.copied()
			.collect();
		let uy: BTreeSet<UserId> = in_window
			.get(&key.high())
			.unwrap_or(&empty)
			.union(&acc.users)
			.copied()
			.collect();
		let union = ux.union(&uy).count();
		let jaccard = if union == 0 {
			0.0
		} else {
			co_count as f64 / union as f64
		};
		let denom = config.same_mbti_weight * ((ux.len() * uy.len()) as f64).sqrt();
		let cosine_bin = if denom > 0.0 {
			kernel::quantize(acc.co_users / denom)
		} else {
			0.0
		};
		out.push(PlaceSimilarity {
			key,
			jaccard: kernel::quantize(jaccard),
			cosine_bin,
			co_users: acc.co_users,
			co_count,
			source: SignalSource::Behavioral,
			updated_at: now,
		});
	}
	out
}

/// Behavioral records for every qualifying place pair, in key order.
///
/// `events` must include history older than the window: an old bookmark
/// still pairs with a recent one.
pub fn aggregate(
	events: &[BookmarkEvent],
	now: DateTime<Utc>,
	config: &CooccurrenceConfig,
) -> Vec<PlaceSimilarity> {
	let records = aggregate_inner(events, None, now, config);
	tracing::debug!(events = events.len(), pairs = records.len(), "Aggregated co-occurrence");
	records
}

/// Behavioral record for a single pair, if it qualifies.
pub fn aggregate_pair(
	events: &[BookmarkEvent],
	a: PlaceId,
	b: PlaceId,
	now: DateTime<Utc>,
	config: &CooccurrenceConfig,
) -> Option<PlaceSimilarity> {
	if a == b {
		return None;
	}
	aggregate_inner(events, Some(PairKey::new(a, b)), now, config)
		.into_iter()
		.next()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mbti::PersonalityType;

	fn bm(user: UserId, place: PlaceId, mbti: Option<&str>, days_ago: i64, now: DateTime<Utc>) -> BookmarkEvent {
		BookmarkEvent {
			user_id: user,
			place_id: place,
			personality: mbti.map(|m| m.parse::<PersonalityType>().unwrap()),
			created_at: now - Duration::days(days_ago),
		}
	}

	#[test]
	fn same_personality_users_double_weight() {
		let now = Utc::now();
		let events = vec![
			bm(1, 10, Some("INFP"), 1, now),
			bm(1, 20, Some("INFP"), 2, now),
			bm(2, 10, Some("INFP"), 3, now),
			bm(2, 20, Some("INFP"), 4, now),
		];
		let out = aggregate(&events, now, &CooccurrenceConfig::default());
		assert_eq!(out.len(), 1);
		let rec = &out[0];
		assert_eq!(rec.key, PairKey::new(10, 20));
		assert_eq!(rec.co_users, 4.0);
		assert_eq!(rec.co_count, 2);
		assert_eq!(rec.jaccard, 1.0);
		assert_eq!(rec.cosine_bin, 1.0);
		assert_eq!(rec.source, SignalSource::Behavioral);
	}

	#[test]
	fn mixed_personalities_use_diff_weight() {
		let now = Utc::now();
		let events = vec![
			bm(1, 10, Some("INFP"), 1, now),
			bm(1, 20, Some("ENTJ"), 1, now),
			bm(2, 10, None, 1, now),
			bm(2, 20, None, 1, now),
		];
		let rec = aggregate_pair(&events, 20, 10, now, &CooccurrenceConfig::default()).unwrap();
		assert_eq!(rec.co_users, 2.0);
		assert_eq!(rec.cosine_bin, 0.5);
	}

	#[test]
	fn single_user_pair_is_discarded() {
		let now = Utc::now();
		let events = vec![bm(1, 10, None, 1, now), bm(1, 20, None, 1, now)];
		assert!(aggregate(&events, now, &CooccurrenceConfig::default()).is_empty());
	}

	#[test]
	fn window_uses_later_bookmark() {
		let now = Utc::now();
		let events = vec![
			// old + recent: qualifies
			bm(1, 10, None, 200, now),
			bm(1, 20, None, 5, now),
			bm(2, 10, None, 1, now),
			bm(2, 20, None, 1, now),
			// both old: ignored
			bm(3, 10, None, 120, now),
			bm(3, 20, None, 100, now),
		];
		let rec = aggregate_pair(&events, 10, 20, now, &CooccurrenceConfig::default()).unwrap();
		assert_eq!(rec.co_count, 2);
		assert_eq!(rec.jaccard, 1.0);

		let events: Vec<BookmarkEvent> = events.into_iter().skip(2).collect();
		assert!(aggregate_pair(&events, 10, 20, now, &CooccurrenceConfig::default()).is_none());
	}

	#[test]
	fn jaccard_counts_non_overlapping_users() {
		let now = Utc::now();
		let events = vec![
			bm(1, 10, None, 1, now),
			bm(1, 20, None, 1, now),
			bm(2, 10, None, 1, now),
			bm(2, 20, None, 1, now),
			bm(3, 10, None, 1, now),
			bm(4, 20, None, 1, now),
		];
		let rec = aggregate_pair(&events, 10, 20, now, &CooccurrenceConfig::default()).unwrap();
		// common 2, union 4
		assert_eq!(rec.jaccard, 0.5);
		// 2.0 / (2.0 * sqrt(3 * 3))
		assert_eq!(rec.cosine_bin, kernel::quantize(1.0 / 3.0));
	}

	#[test]
	fn duplicate_bookmarks_count_once() {
		let now = Utc::now();
		let events = vec![
			bm(1, 10, None, 1, now),
			bm(1, 10, None, 2, now),
			bm(1, 20, None, 1, now),
			bm(2, 10, None, 1, now),
			bm(2, 20, None, 1, now),
		];
		let rec = aggregate_pair(&events, 10, 20, now, &CooccurrenceConfig::default()).unwrap();
		assert_eq!(rec.co_count, 2);
		assert_eq!(rec.co_users, 2.0);
	}

	#[test]
	fn self_pair_is_none() {
		let now = Utc::now();
		assert!(aggregate_pair(&[], 3, 3, now, &CooccurrenceConfig::default()).is_none());
	}
}
