// ---------------------------------------------------------------------------
// Affinity engine
// ---------------------------------------------------------------------------
//
// Wires the stores, the scorer, the Top-K maintainer and the scheduler
// together. `EngineCore` owns the state and implements the background jobs;
// `AffinityEngine` is the handle request paths use. Request paths only read
// committed state or score a single pair; everything batch-shaped goes
// through the scheduler.
// ---------------------------------------------------------------------------

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use crate::cache::{self, SimilarityCache};
use crate::config::EngineConfig;
use crate::cooccurrence;
use crate::error::AffinityError;
use crate::kernel;
use crate::mbti::PersonalityType;
use crate::pairwise::PairwiseStore;
use crate::providers::{BookmarkProvider, EmbeddingProvider};
use crate::retry;
use crate::scheduler::{Job, JobRunner, Scheduler, SchedulerStatus, TriggerOutcome};
use crate::scorer::{self, SimilarityScorer};
use crate::topk::{TopKMaintainer, TopKStore};
use crate::types::{
	BookmarkEvent, EmbeddingVector, Entity, JobReport, LiveVersions, PlaceId, PlaceMatch,
	PlaceSimilarity, RankedNeighbor, RecomputeTarget, SimilarityResult, SimilarityStatistics,
	TopKEntry, UpsertOutcome, UserId, UserPlaceKey, UserPlaceSimilarity,
};

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

pub struct EngineCore {
	config: EngineConfig,
	scorer: SimilarityScorer,
	cache: SimilarityCache,
	pairwise: Arc<PairwiseStore>,
	topk: TopKMaintainer,
	embeddings: Arc<dyn EmbeddingProvider>,
	bookmarks: Arc<dyn BookmarkProvider>,
}

impl EngineCore {
	fn new(
		config: EngineConfig,
		embeddings: Arc<dyn EmbeddingProvider>,
		bookmarks: Arc<dyn BookmarkProvider>,
	) -> Result<Self, AffinityError> {
		let rules = config.load_rules()?;
		let pairwise = Arc::new(PairwiseStore::new());
		let topk = TopKMaintainer::new(
			config.topk.clone(),
			pairwise.clone(),
			Arc::new(TopKStore::new()),
			embeddings.clone(),
			rules.clone(),
			config.retry.clone(),
		);
		Ok(Self {
			scorer: SimilarityScorer::new(config.scorer_weights(), rules),
			cache: SimilarityCache::new(),
			pairwise,
			topk,
			embeddings,
			bookmarks,
			config,
		})
	}

	async fn vector(&self, entity: Entity) -> Result<Option<EmbeddingVector>, AffinityError> {
		retry::with_backoff(&self.config.retry, "get_vector", || {
			self.embeddings.get_vector(entity)
		})
		.await
	}

	/// Vectors of every known place. Places without a vector are left out.
	async fn all_place_vectors(&self) -> Result<HashMap<PlaceId, EmbeddingVector>, AffinityError> {
		let ids = retry::with_backoff(&self.config.retry, "place_ids", || {
			self.embeddings.place_ids()
		})
		.await?;
		let mut out = HashMap::with_capacity(ids.len());
		for id in ids {
			if let Some(v) = self.vector(Entity::Place(id)).await? {
				out.insert(id, v);
			}
		}
		Ok(out)
	}

	/// Bookmark history. The window applies to the later bookmark of a pair,
	/// so older events are needed too.
	async fn history(&self) -> Result<Vec<BookmarkEvent>, AffinityError> {
		retry::with_backoff(&self.config.retry, "bookmarks_since", || {
			self.bookmarks.bookmarks_since(DateTime::<Utc>::MIN_UTC)
		})
		.await
	}

	fn write_records(&self, records: Vec<PlaceSimilarity>, report: &mut JobReport) {
		for record in records {
			match self.pairwise.upsert(record) {
				UpsertOutcome::Stale => report.skipped += 1,
				_ => report.processed += 1,
			}
		}
	}

	/// Score place pairs on the blocking pool and write the rows that pass.
	async fn content_pass(
		&self,
		vectors: Arc<HashMap<PlaceId, EmbeddingVector>>,
		pairs: ContentPairs,
		report: &mut JobReport,
	) {
		let scoring = self.scorer.clone();
		let min_weighted = self.config.min_weighted;
		let now = Utc::now();
		let scored = tokio::task::spawn_blocking(move || {
			score_content(&scoring, &vectors, pairs, min_weighted, now)
		})
		.await;
		match scored {
			Ok(batch) => {
				report.skipped += batch.skipped;
				report.failed += batch.failed;
				self.write_records(batch.records, report);
			}
			Err(e) => {
				tracing::error!(error = %e, "Content pass aborted");
				report.partial = true;
				report.failed += 1;
			}
		}
	}

	/// Rebuild Top-K lists. Subjects of a partial rebuild go back into the
	/// dirty set so the next refresh picks them up.
	async fn rebuild(&self, subjects: BTreeSet<PlaceId>) -> JobReport {
		let report = self.topk.rebuild_many(subjects.iter().copied().collect()).await;
		if report.partial {
			self.pairwise.requeue_dirty(subjects);
		}
		report
	}

	/// Recompute user×place rows that are missing or stale.
	///
	/// Weak results refresh an existing row but never create one. Scoring
	/// runs on the blocking pool, one user at a time.
	async fn refresh_user_place(
		&self,
		places: &Arc<HashMap<PlaceId, EmbeddingVector>>,
		only_place: Option<PlaceId>,
	) -> Result<JobReport, AffinityError> {
		let users = retry::with_backoff(&self.config.retry, "user_ids", || {
			self.embeddings.user_ids()
		})
		.await?;
		let mut report = JobReport::default();
		for user_id in users {
			let Some(user) = self.vector(Entity::User(user_id)).await? else {
				report.skipped += 1;
				continue;
			};
			let personality = retry::with_backoff(&self.config.retry, "personality_of", || {
				self.embeddings.personality_of(user_id)
			})
			.await?;

			let now = Utc::now();
			let mut due: Vec<(PlaceId, bool)> = Vec::new();
			for (&place_id, place) in places.iter() {
				if only_place.is_some_and(|p| p != place_id) {
					continue;
				}
				let key = UserPlaceKey { user_id, place_id };
				let live = LiveVersions {
					user: user.version,
					place: place.version,
				};
				match self.cache.get(&key) {
					Some(row) if !cache::is_stale(&row, &live, self.config.cache_max_age_hours, now) => {
						report.skipped += 1;
					}
					existing => due.push((place_id, existing.is_some())),
				}
			}
			if due.is_empty() {
				continue;
			}

			let user_version = user.version;
			let scoring = self.scorer.clone();
			let shared = places.clone();
			let scored = tokio::task::spawn_blocking(move || {
				due.into_iter()
					.map(|(place_id, existed)| {
						let place = &shared[&place_id];
						let result = scoring.score_user_place(&user, personality.as_ref(), place);
						(place_id, place.version, existed, result)
					})
					.collect::<Vec<_>>()
			})
			.await;
			let scored = match scored {
				Ok(scored) => scored,
				Err(e) => {
					tracing::error!(user_id, error = %e, "User×place scoring aborted");
					report.partial = true;
					report.failed += 1;
					continue;
				}
			};

			for (place_id, place_version, existed, result) in scored {
				match result {
					Ok(result) if existed || scorer::passes(&result, self.config.min_weighted) => {
						self.cache.upsert(UserPlaceSimilarity {
							key: UserPlaceKey { user_id, place_id },
							result,
							calculated_at: now,
							user_vector_version: user_version,
							place_vector_version: place_version,
						});
						report.processed += 1;
					}
					Ok(_) => report.skipped += 1,
					Err(e) => {
						tracing::warn!(user_id, place_id, error = %e, "Skipping user×place pair");
						report.failed += 1;
					}
				}
			}
		}
		Ok(report)
	}

	/// Content pairs, co-occurrence, pruning, Top-K and the user×place
	/// cache, in that order. Behavioral rows are written after content rows
	/// so they win the last-writer-wins race on shared pairs.
	async fn full_cycle(&self) -> JobReport {
		let started = Instant::now();
		let cycle_start = Utc::now();
		let mut report = JobReport::default();

		let vectors = Arc::new(match self.all_place_vectors().await {
			Ok(v) => v,
			Err(e) => {
				tracing::warn!(error = %e, "Could not read place vectors");
				report.partial = true;
				report.failed += 1;
				HashMap::new()
			}
		});
		let ids: BTreeSet<PlaceId> = vectors.keys().copied().collect();
		self.content_pass(vectors.clone(), ContentPairs::All, &mut report).await;

		match self.history().await {
			Ok(events) => {
				let records = cooccurrence::aggregate(&events, Utc::now(), &self.config.cooccurrence);
				self.write_records(records, &mut report);
			}
			Err(e) => {
				tracing::warn!(error = %e, "Could not read bookmark history");
				report.partial = true;
				report.failed += 1;
			}
		}

		// Only a complete cycle knows which rows really disappeared.
		if !report.partial {
			let pruned = self.pairwise.retain_updated_since(cycle_start);
			if pruned > 0 {
				tracing::info!(pruned, "Pruned pairwise rows not rewritten this cycle");
			}
		}

		let mut subjects = ids;
		subjects.extend(self.pairwise.take_dirty());
		report.merge(&self.rebuild(subjects).await);

		match self.refresh_user_place(&vectors, None).await {
			Ok(r) => report.merge(&r),
			Err(e) => {
				tracing::warn!(error = %e, "User×place refresh incomplete");
				report.partial = true;
				report.failed += 1;
			}
		}

		report.elapsed_ms = started.elapsed().as_millis() as u64;
		report
	}

	async fn recompute_place(&self, place_id: PlaceId) -> JobReport {
		let started = Instant::now();
		let mut report = JobReport::default();

		let vectors = Arc::new(match self.all_place_vectors().await {
			Ok(v) => v,
			Err(e) => {
				tracing::warn!(place_id, error = %e, "Could not read place vectors");
				report.partial = true;
				report.failed += 1;
				HashMap::new()
			}
		});
		let has_vector = vectors.contains_key(&place_id);
		if has_vector {
			self.content_pass(vectors.clone(), ContentPairs::Touching(place_id), &mut report)
				.await;
		} else if !report.partial {
			tracing::debug!(place_id, "No vector for place, content pass skipped");
			report.skipped += 1;
		}

		match self.history().await {
			Ok(events) => {
				let records: Vec<PlaceSimilarity> =
					cooccurrence::aggregate(&events, Utc::now(), &self.config.cooccurrence)
						.into_iter()
						.filter(|r| r.key.contains(place_id))
						.collect();
				self.write_records(records, &mut report);
			}
			Err(e) => {
				tracing::warn!(place_id, error = %e, "Could not read bookmark history");
				report.partial = true;
				report.failed += 1;
			}
		}

		let mut subjects = self.pairwise.take_dirty();
		subjects.insert(place_id);
		report.merge(&self.rebuild(subjects).await);

		if has_vector {
			match self.refresh_user_place(&vectors, Some(place_id)).await {
				Ok(r) => report.merge(&r),
				Err(e) => {
					tracing::warn!(place_id, error = %e, "User×place refresh incomplete");
					report.partial = true;
					report.failed += 1;
				}
			}
		}

		report.elapsed_ms = started.elapsed().as_millis() as u64;
		report
	}

	async fn recompute_pair(&self, a: PlaceId, b: PlaceId) -> JobReport {
		let started = Instant::now();
		let mut report = JobReport::default();
		if a == b {
			report.skipped += 1;
			return report;
		}

		let left = self.vector(Entity::Place(a)).await;
		let right = self.vector(Entity::Place(b)).await;
		match (left, right) {
			(Ok(Some(va)), Ok(Some(vb))) => {
				let pair = Arc::new(HashMap::from([(a, va), (b, vb)]));
				self.content_pass(pair, ContentPairs::Touching(a), &mut report).await;
			}
			(Err(e), _) | (_, Err(e)) => {
				tracing::warn!(a, b, error = %e, "Could not read place vectors");
				report.partial = true;
				report.failed += 1;
			}
			_ => report.skipped += 1,
		}

		match self.history().await {
			Ok(events) => {
				let record =
					cooccurrence::aggregate_pair(&events, a, b, Utc::now(), &self.config.cooccurrence);
				self.write_records(record.into_iter().collect(), &mut report);
			}
			Err(e) => {
				tracing::warn!(a, b, error = %e, "Could not read bookmark history");
				report.partial = true;
				report.failed += 1;
			}
		}

		let mut subjects = self.pairwise.take_dirty();
		subjects.insert(a);
		subjects.insert(b);
		report.merge(&self.rebuild(subjects).await);

		report.elapsed_ms = started.elapsed().as_millis() as u64;
		report
	}
}

// ---------------------------------------------------------------------------
// Content scoring
// ---------------------------------------------------------------------------

/// Place pairs a content pass scores.
#[derive(Debug, Clone, Copy)]
enum ContentPairs {
	/// Every unordered pair.
	All,
	/// Every pair involving one place.
	Touching(PlaceId),
}

#[derive(Debug, Default)]
struct ContentBatch {
	records: Vec<PlaceSimilarity>,
	skipped: usize,
	failed: usize,
}

/// CPU-bound half of a content pass. Keeps only rows whose weighted score
/// reaches `min_weighted`.
fn score_content(
	scoring: &SimilarityScorer,
	vectors: &HashMap<PlaceId, EmbeddingVector>,
	pairs: ContentPairs,
	min_weighted: f64,
	now: DateTime<Utc>,
) -> ContentBatch {
	let mut ids: Vec<PlaceId> = vectors.keys().copied().collect();
	ids.sort_unstable();
	let mut batch = ContentBatch::default();
	let mut score = |a: PlaceId, b: PlaceId| match scoring.compare_places(&vectors[&a], &vectors[&b]) {
		Ok(result) if scorer::passes(&result, min_weighted) => {
			batch.records.push(scorer::place_record(a, b, &result, now));
		}
		Ok(_) => batch.skipped += 1,
		Err(e) => {
			tracing::warn!(a, b, error = %e, "Skipping place pair");
			batch.failed += 1;
		}
	};
	match pairs {
		ContentPairs::All => {
			for (i, &a) in ids.iter().enumerate() {
				for &b in &ids[i + 1..] {
					score(a, b);
				}
			}
		}
		ContentPairs::Touching(subject) if vectors.contains_key(&subject) => {
			for &other in ids.iter().filter(|&&id| id != subject) {
				score(subject, other);
			}
		}
		ContentPairs::Touching(_) => {}
	}
	batch
}

#[async_trait]
impl JobRunner for EngineCore {
	async fn recompute(&self, target: RecomputeTarget) -> JobReport {
		match target {
			RecomputeTarget::All => self.full_cycle().await,
			RecomputeTarget::Place { place_id } => self.recompute_place(place_id).await,
			RecomputeTarget::Pair { a, b } => self.recompute_pair(a, b).await,
		}
	}

	async fn refresh_topk(&self) -> JobReport {
		let dirty = self.pairwise.take_dirty();
		if dirty.is_empty() {
			tracing::debug!("No dirty places");
			return JobReport::default();
		}
		self.rebuild(dirty).await
	}

	async fn cleanup(&self) -> JobReport {
		let started = Instant::now();
		let cutoff = Utc::now() - Duration::days(self.config.cache_retention_days);
		let evicted = self.cache.evict_older_than(cutoff);
		JobReport {
			processed: evicted,
			elapsed_ms: started.elapsed().as_millis() as u64,
			..JobReport::default()
		}
	}
}

// ---------------------------------------------------------------------------
// AffinityEngine
// ---------------------------------------------------------------------------

pub struct AffinityEngine {
	core: Arc<EngineCore>,
	scheduler: Scheduler,
}

impl AffinityEngine {
	/// Build the stores and start the worker pools and tickers. Must be
	/// called from inside a Tokio runtime.
	pub fn start(
		config: EngineConfig,
		embeddings: Arc<dyn EmbeddingProvider>,
		bookmarks: Arc<dyn BookmarkProvider>,
	) -> Result<Self, AffinityError> {
		config.validate()?;
		let core = Arc::new(EngineCore::new(config, embeddings, bookmarks)?);
		let runner: Arc<dyn JobRunner> = core.clone();
		let scheduler = Scheduler::start(
			core.config.scheduler.clone(),
			core.config.general_pool.clone(),
			core.config.similarity_pool.clone(),
			runner,
		)?;
		tracing::info!(
			k = core.config.topk.k,
			buckets = core.config.topk.buckets.len(),
			scheduler = core.config.scheduler.enabled,
			"Affinity engine started"
		);
		Ok(Self { core, scheduler })
	}

	pub fn config(&self) -> &EngineConfig {
		&self.core.config
	}

	// -- Read paths ------------------------------------------------------

	/// Committed Top-K neighbors of a place, optionally for one personality
	/// bucket. Unknown places yield an empty list.
	pub fn ranked_neighbors(
		&self,
		place_id: PlaceId,
		personality: Option<PersonalityType>,
		limit: usize,
	) -> Vec<RankedNeighbor> {
		self.core.topk.ranked_neighbors(place_id, personality, limit)
	}

	/// Similarity of one user to one place.
	///
	/// Served from the cache while the row is fresh, otherwise scored and
	/// cached. A missing vector or an unavailable provider yields `None`;
	/// only a dimension mismatch is reported as an error.
	pub async fn similarity_between(
		&self,
		key: UserPlaceKey,
	) -> Result<Option<SimilarityResult>, AffinityError> {
		let core = &self.core;
		let user = match degrade(core.embeddings.get_vector(Entity::User(key.user_id)).await)? {
			Some(Some(v)) => v,
			_ => return Ok(None),
		};
		let place = match degrade(core.embeddings.get_vector(Entity::Place(key.place_id)).await)? {
			Some(Some(v)) => v,
			_ => return Ok(None),
		};

		let live = LiveVersions {
			user: user.version,
			place: place.version,
		};
		let now = Utc::now();
		if let Some(row) = core.cache.get(&key) {
			if !cache::is_stale(&row, &live, core.config.cache_max_age_hours, now) {
				tracing::debug!(user_id = key.user_id, place_id = key.place_id, "Cache hit");
				return Ok(Some(row.result));
			}
		}

		let personality = degrade(core.embeddings.personality_of(key.user_id).await)?.flatten();
		let result = core.scorer.score_user_place(&user, personality.as_ref(), &place)?;
		core.cache.upsert(UserPlaceSimilarity {
			key,
			result: result.clone(),
			calculated_at: now,
			user_vector_version: user.version,
			place_vector_version: place.version,
		});
		Ok(Some(result))
	}

	/// Best cached places for a user, leaving out `exclude` (typically the
	/// places the user already bookmarked). Each match carries the keyword
	/// labels user and place share; the list is empty when either vector is
	/// missing or the provider is unavailable.
	pub async fn top_places_for_user(
		&self,
		user_id: UserId,
		min_threshold: f64,
		limit: usize,
		exclude: &BTreeSet<PlaceId>,
	) -> Result<Vec<PlaceMatch>, AffinityError> {
		let core = &self.core;
		let rows = core.cache.top_scores_for(user_id, min_threshold, limit, exclude);
		if rows.is_empty() {
			return Ok(Vec::new());
		}
		let user = degrade(core.embeddings.get_vector(Entity::User(user_id)).await)?.flatten();

		let mut matches = Vec::with_capacity(rows.len());
		for row in rows {
			let mut matching_keywords = Vec::new();
			if let Some(user) = &user {
				let place = degrade(core.embeddings.get_vector(Entity::Place(row.key.place_id)).await)?;
				if let Some(Some(place)) = place {
					matching_keywords = kernel::matching_keyword_labels(&user.keywords, &place.keywords);
				}
			}
			matches.push(PlaceMatch {
				similarity: row,
				matching_keywords,
			});
		}
		Ok(matches)
	}

	pub fn statistics(&self) -> SimilarityStatistics {
		let (average_jaccard, average_cosine, sample_size) = self.core.pairwise.sample_averages();
		SimilarityStatistics {
			total_pairs: self.core.pairwise.len(),
			total_top_k_entries: self.core.topk.store().total_entries(),
			cached_user_place: self.core.cache.len(),
			average_jaccard,
			average_cosine,
			sample_size,
		}
	}

	pub fn status(&self) -> SchedulerStatus {
		self.scheduler.status()
	}

	// -- Triggers --------------------------------------------------------

	/// Queue a recomputation. Returns as soon as it is queued or coalesced.
	pub async fn trigger_recompute(
		&self,
		target: RecomputeTarget,
	) -> Result<TriggerOutcome, AffinityError> {
		self.scheduler.trigger(Job::Recompute(target.canonical())).await
	}

	/// Run a recomputation on the calling task and wait for its report.
	pub async fn recompute_now(&self, target: RecomputeTarget) -> Result<JobReport, AffinityError> {
		self.scheduler.run_now(Job::Recompute(target.canonical())).await
	}

	pub async fn refresh_topk_now(&self) -> Result<JobReport, AffinityError> {
		self.scheduler.run_now(Job::RefreshTopK).await
	}

	pub async fn cleanup_now(&self) -> Result<JobReport, AffinityError> {
		self.scheduler.run_now(Job::Cleanup).await
	}

	/// An entity's vector was replaced. Drops its cached rows and, for a
	/// place, queues a recompute of its pairs. Returns the rows dropped.
	pub async fn notify_vector_replaced(&self, entity: Entity) -> Result<usize, AffinityError> {
		let dropped = self.core.cache.invalidate_entity(entity);
		tracing::debug!(?entity, dropped, "Vector replaced");
		if let Entity::Place(place_id) = entity {
			self.trigger_recompute(RecomputeTarget::Place { place_id }).await?;
		}
		Ok(dropped)
	}

	/// A user bookmarked a place. Every pair it forms with the user's other
	/// bookmarks changes, so one recompute of the place is queued; bursts on
	/// the same place coalesce. Returns how many partner places are affected.
	pub async fn notify_bookmark(&self, event: &BookmarkEvent) -> Result<usize, AffinityError> {
		let cutoff = self.core.config.cooccurrence.cutoff(Utc::now());
		if event.created_at < cutoff {
			return Ok(0);
		}
		let history = self
			.core
			.bookmarks
			.bookmarks_since(DateTime::<Utc>::MIN_UTC)
			.await?;
		let partners: BTreeSet<PlaceId> = history
			.iter()
			.filter(|e| e.user_id == event.user_id && e.place_id != event.place_id)
			.map(|e| e.place_id)
			.collect();
		if !partners.is_empty() {
			self.trigger_recompute(RecomputeTarget::Place {
				place_id: event.place_id,
			})
			.await?;
		}
		Ok(partners.len())
	}

	// -- Persistence -----------------------------------------------------

	pub fn export_tables(
		&self,
	) -> (Vec<PlaceSimilarity>, Vec<UserPlaceSimilarity>, Vec<TopKEntry>) {
		(
			self.core.pairwise.snapshot(),
			self.core.cache.snapshot(),
			self.core.topk.store().snapshot(),
		)
	}

	pub fn restore_tables(
		&self,
		pairwise: Vec<PlaceSimilarity>,
		user_place: Vec<UserPlaceSimilarity>,
		topk: Vec<TopKEntry>,
	) {
		self.core.pairwise.restore(pairwise);
		self.core.cache.restore(user_place);
		self.core.topk.store().restore(topk);
	}

	pub async fn shutdown(&self) {
		self.scheduler.shutdown().await;
	}
}

/// Read-path degradation: an unavailable upstream reads as "nothing".
fn degrade<T>(result: Result<T, AffinityError>) -> Result<Option<T>, AffinityError> {
	match result {
		Ok(value) => Ok(Some(value)),
		Err(e) if e.is_retryable() => {
			tracing::debug!(error = %e, "Upstream unavailable on read path");
			Ok(None)
		}
		Err(e) => Err(e),
	}
}
