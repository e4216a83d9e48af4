// ---------------------------------------------------------------------------
// Collaborator interfaces
// ---------------------------------------------------------------------------
//
// The engine never produces embeddings or bookmarks itself. It reads them
// through these traits. The in-memory implementations back the standalone
// binary and the tests; a deployment wires its own database-backed ones.
// ---------------------------------------------------------------------------

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::error::AffinityError;
use crate::mbti::PersonalityType;
use crate::types::{BookmarkEvent, EmbeddingVector, Entity, KeywordSet, PlaceId, UserId};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
	/// Latest vector for a user or place; `None` when none was extracted yet.
	async fn get_vector(&self, entity: Entity) -> Result<Option<EmbeddingVector>, AffinityError>;

	/// Every place that currently has a vector.
	async fn place_ids(&self) -> Result<Vec<PlaceId>, AffinityError>;

	/// Every user that currently has a vector.
	async fn user_ids(&self) -> Result<Vec<UserId>, AffinityError>;

	async fn personality_of(&self, user_id: UserId) -> Result<Option<PersonalityType>, AffinityError>;
}

#[async_trait]
pub trait BookmarkProvider: Send + Sync {
	async fn bookmarks_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<BookmarkEvent>, AffinityError>;
}

// ---------------------------------------------------------------------------
// In-memory embeddings
// ---------------------------------------------------------------------------

/// Persisted form of one stored vector.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
	pub entity: Entity,
	pub vector: EmbeddingVector,
}

/// Embedding store held in process memory.
///
/// Optionally enforces a fixed dimension on writes. `set_available(false)`
/// makes every read fail with `UpstreamUnavailable`, which the tests use to
/// exercise retry and degradation paths.
pub struct MemoryEmbeddings {
	vectors: RwLock<HashMap<Entity, EmbeddingVector>>,
	personalities: RwLock<HashMap<UserId, PersonalityType>>,
	dimension: Option<usize>,
	available: AtomicBool,
}

impl Default for MemoryEmbeddings {
	fn default() -> Self {
		Self::new(None)
	}
}

impl MemoryEmbeddings {
	pub fn new(dimension: Option<usize>) -> Self {
		Self {
			vectors: RwLock::new(HashMap::new()),
			personalities: RwLock::new(HashMap::new()),
			dimension,
			available: AtomicBool::new(true),
		}
	}

	pub fn set_available(&self, available: bool) {
		self.available.store(available, Ordering::SeqCst);
	}

	fn check_available(&self) -> Result<(), AffinityError> {
		if self.available.load(Ordering::SeqCst) {
			Ok(())
		} else {
			Err(AffinityError::UpstreamUnavailable("embedding store offline".into()))
		}
	}

	/// Store or replace an entity's vector and return the version written.
	///
	/// Without an explicit version the previous version plus one is used.
	/// An explicit version must be greater than the stored one.
	pub fn put(
		&self,
		entity: Entity,
		values: Vec<f32>,
		keywords: KeywordSet,
		version: Option<u64>,
	) -> Result<u64, AffinityError> {
		if let Some(dim) = self.dimension {
			if values.len() != dim {
				return Err(AffinityError::DimensionMismatch {
					left: values.len(),
					right: dim,
				});
			}
		}
		let mut vectors = self.vectors.write().unwrap_or_else(PoisonError::into_inner);
		let previous = vectors.get(&entity).map(|v| v.version);
		let version = match (version, previous) {
			(Some(v), Some(prev)) if v <= prev => {
				return Err(AffinityError::InvalidVersion(format!(
					"{:?}: version {} is not greater than {}",
					entity, v, prev
				)));
			}
			(Some(v), _) => v,
			(None, Some(prev)) => prev + 1,
			(None, None) => 1,
		};
		vectors.insert(
			entity,
			EmbeddingVector {
				values,
				keywords,
				version,
			},
		);
		Ok(version)
	}

	pub fn set_personality(&self, user_id: UserId, personality: PersonalityType) {
		self.personalities
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(user_id, personality);
	}

	pub fn personalities(&self) -> Vec<(UserId, PersonalityType)> {
		let mut out: Vec<(UserId, PersonalityType)> = self
			.personalities
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.map(|(k, v)| (*k, *v))
			.collect();
		out.sort_by_key(|(k, _)| *k);
		out
	}

	pub fn len(&self) -> usize {
		self.vectors.read().unwrap_or_else(PoisonError::into_inner).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Every stored vector in entity order.
	pub fn snapshot(&self) -> Vec<StoredVector> {
		let mut out: Vec<StoredVector> = self
			.vectors
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.map(|(entity, vector)| StoredVector {
				entity: *entity,
				vector: vector.clone(),
			})
			.collect();
		out.sort_by_key(|s| s.entity);
		out
	}

	pub fn restore(&self, stored: Vec<StoredVector>, personalities: Vec<(UserId, PersonalityType)>) {
		{
			let mut vectors = self.vectors.write().unwrap_or_else(PoisonError::into_inner);
			vectors.clear();
			for s in stored {
				vectors.insert(s.entity, s.vector);
			}
		}
		let mut map = self.personalities.write().unwrap_or_else(PoisonError::into_inner);
		map.clear();
		map.extend(personalities);
	}

	fn ids_of(&self, want_place: bool) -> Vec<u64> {
		let mut ids: Vec<u64> = self
			.vectors
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.keys()
			.filter_map(|e| match (e, want_place) {
				(Entity::Place(id), true) | (Entity::User(id), false) => Some(*id),
				_ => None,
			})
			.collect();
		ids.sort_unstable();
		ids
	}
}

#[async_trait]
impl EmbeddingProvider for MemoryEmbeddings {
	async fn get_vector(&self, entity: Entity) -> Result<Option<EmbeddingVector>, AffinityError> {
		self.check_available()?;
		Ok(self
			.vectors
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&entity)
			.cloned())
	}

	async fn place_ids(&self) -> Result<Vec<PlaceId>, AffinityError> {
		self.check_available()?;
		Ok(self.ids_of(true))
	}

	async fn user_ids(&self) -> Result<Vec<UserId>, AffinityError> {
		self.check_available()?;
		Ok(self.ids_of(false))
	}

	async fn personality_of(&self, user_id: UserId) -> Result<Option<PersonalityType>, AffinityError> {
		self.check_available()?;
		Ok(self
			.personalities
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&user_id)
			.copied())
	}
}

// ---------------------------------------------------------------------------
// In-memory bookmarks
// ---------------------------------------------------------------------------

pub struct MemoryBookmarks {
	events: RwLock<Vec<BookmarkEvent>>,
	available: AtomicBool,
}

impl Default for MemoryBookmarks {
	fn default() -> Self {
		Self {
			events: RwLock::new(Vec::new()),
			available: AtomicBool::new(true),
		}
	}
}

impl MemoryBookmarks {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_available(&self, available: bool) {
		self.available.store(available, Ordering::SeqCst);
	}

	pub fn record(&self, event: BookmarkEvent) {
		self.events
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.push(event);
	}

	pub fn len(&self) -> usize {
		self.events.read().unwrap_or_else(PoisonError::into_inner).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn snapshot(&self) -> Vec<BookmarkEvent> {
		self.events.read().unwrap_or_else(PoisonError::into_inner).clone()
	}

	pub fn restore(&self, events: Vec<BookmarkEvent>) {
		*self.events.write().unwrap_or_else(PoisonError::into_inner) = events;
	}
}

#[async_trait]
impl BookmarkProvider for MemoryBookmarks {
	async fn bookmarks_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<BookmarkEvent>, AffinityError> {
		if !self.available.load(Ordering::SeqCst) {
			return Err(AffinityError::UpstreamUnavailable("bookmark store offline".into()));
		}
		Ok(self
			.events
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.filter(|e| e.created_at >= cutoff)
			.cloned()
			.collect())
	}
}
