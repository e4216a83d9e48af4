// ---------------------------------------------------------------------------
// Snapshot persistence + Gzip compression
// ---------------------------------------------------------------------------
//
// File format (v1): `snapshot.gz` holding gzipped JSON
//
//   { "version": 1,
//     "vectors": [{ "entity": {"kind":"place","id":3}, "embedding": "<b64>",
//                   "keywords": [...], "version": 2 }, ...],
//     "personalities": [...], "bookmarks": [...], "pairwise": [...],
//     "userPlace": [...], "topk": [...] }
//
// Embeddings are base64 of little-endian f32 bytes. A plain (non-gzipped)
// JSON file with the same shape is also accepted on load.
// ---------------------------------------------------------------------------

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

use crate::error::AffinityError;
use crate::mbti::PersonalityType;
use crate::providers::StoredVector;
use crate::types::{
	BookmarkEvent, EmbeddingVector, Entity, KeywordSet, PlaceSimilarity, TopKEntry, UserId,
	UserPlaceSimilarity,
};

pub const SNAPSHOT_FILE: &str = "snapshot.gz";
pub const SNAPSHOT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Embedding encode / decode
// ---------------------------------------------------------------------------

/// Encode a f32 slice as base64 of little-endian bytes.
pub fn encode_embedding(embedding: &[f32]) -> String {
	let bytes: Vec<u8> = embedding.iter().flat_map(|f| f.to_le_bytes()).collect();
	STANDARD.encode(&bytes)
}

/// Decode a base64 little-endian f32 string back to `Vec<f32>`.
pub fn decode_embedding(encoded: &str) -> Result<Vec<f32>, AffinityError> {
	let bytes = STANDARD
		.decode(encoded)
		.map_err(|e| AffinityError::Corruption(format!("Invalid base64: {}", e)))?;
	if bytes.len() % 4 != 0 {
		return Err(AffinityError::Corruption("Invalid embedding length".into()));
	}
	Ok(bytes
		.chunks_exact(4)
		.map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
		.collect())
}

// ---------------------------------------------------------------------------
// Gzip compress / decompress
// ---------------------------------------------------------------------------

pub fn compress(data: &[u8]) -> Result<Vec<u8>, AffinityError> {
	let mut encoder = GzEncoder::new(data, Compression::new(6));
	let mut compressed = Vec::new();
	encoder.read_to_end(&mut compressed)?;
	Ok(compressed)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, AffinityError> {
	let mut decoder = GzDecoder::new(data);
	let mut decompressed = Vec::new();
	decoder.read_to_end(&mut decompressed)?;
	Ok(decompressed)
}

/// Check if data starts with gzip magic bytes (0x1f, 0x8b).
pub fn is_gzipped(data: &[u8]) -> bool {
	data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

// ---------------------------------------------------------------------------
// Snapshot model
// ---------------------------------------------------------------------------

/// Everything needed to bring a process back to its last saved state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
	pub vectors: Vec<StoredVector>,
	pub personalities: Vec<(UserId, PersonalityType)>,
	pub bookmarks: Vec<BookmarkEvent>,
	pub pairwise: Vec<PlaceSimilarity>,
	pub user_place: Vec<UserPlaceSimilarity>,
	pub topk: Vec<TopKEntry>,
}

#[derive(Debug)]
pub struct LoadedSnapshot {
	pub snapshot: Snapshot,
	/// Vector rows dropped because their embedding could not be decoded.
	pub skipped: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VectorRow {
	entity: Entity,
	embedding: String,
	#[serde(default)]
	keywords: KeywordSet,
	version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersonalityRow {
	user_id: UserId,
	personality: PersonalityType,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotFile {
	version: u32,
	#[serde(default)]
	vectors: Vec<VectorRow>,
	#[serde(default)]
	personalities: Vec<PersonalityRow>,
	#[serde(default)]
	bookmarks: Vec<BookmarkEvent>,
	#[serde(default)]
	pairwise: Vec<PlaceSimilarity>,
	#[serde(default)]
	user_place: Vec<UserPlaceSimilarity>,
	#[serde(default)]
	topk: Vec<TopKEntry>,
}

impl SnapshotFile {
	fn from_snapshot(snapshot: &Snapshot) -> Self {
		Self {
			version: SNAPSHOT_VERSION,
			vectors: snapshot
				.vectors
				.iter()
				.map(|s| VectorRow {
					entity: s.entity,
					embedding: encode_embedding(&s.vector.values),
					keywords: s.vector.keywords.clone(),
					version: s.vector.version,
				})
				.collect(),
			personalities: snapshot
				.personalities
				.iter()
				.map(|(user_id, personality)| PersonalityRow {
					user_id: *user_id,
					personality: *personality,
				})
				.collect(),
			bookmarks: snapshot.bookmarks.clone(),
			pairwise: snapshot.pairwise.clone(),
			user_place: snapshot.user_place.clone(),
			topk: snapshot.topk.clone(),
		}
	}

	fn into_snapshot(self) -> LoadedSnapshot {
		let mut skipped = 0;
		let mut vectors = Vec::with_capacity(self.vectors.len());
		for row in self.vectors {
			match decode_embedding(&row.embedding) {
				Ok(values) => vectors.push(StoredVector {
					entity: row.entity,
					vector: EmbeddingVector {
						values,
						keywords: row.keywords,
						version: row.version,
					},
				}),
				Err(e) => {
					tracing::warn!(entity = ?row.entity, error = %e, "Skipping corrupt vector row");
					skipped += 1;
				}
			}
		}
		LoadedSnapshot {
			snapshot: Snapshot {
				vectors,
				personalities: self
					.personalities
					.into_iter()
					.map(|p| (p.user_id, p.personality))
					.collect(),
				bookmarks: self.bookmarks,
				pairwise: self.pairwise,
				user_place: self.user_place,
				topk: self.topk,
			},
			skipped,
		}
	}
}

// ---------------------------------------------------------------------------
// File I/O
// ---------------------------------------------------------------------------

/// Write `snapshot.gz` into `dir`, creating the directory if needed.
///
/// The file is written under a temporary name and renamed into place, so a
/// crash mid-write leaves the previous snapshot intact.
pub fn save_to_directory(dir: &Path, snapshot: &Snapshot) -> Result<(), AffinityError> {
	std::fs::create_dir_all(dir)?;

	let file = SnapshotFile::from_snapshot(snapshot);
	let json = serde_json::to_vec(&file)?;
	let compressed = compress(&json)?;

	let tmp = dir.join(format!("{}.tmp", SNAPSHOT_FILE));
	std::fs::write(&tmp, &compressed)?;
	std::fs::rename(&tmp, dir.join(SNAPSHOT_FILE))?;

	tracing::info!(
		dir = %dir.display(),
		vectors = file.vectors.len(),
		pairs = file.pairwise.len(),
		bytes = compressed.len(),
		"Snapshot saved"
	);
	Ok(())
}

/// Read `snapshot.gz` from `dir`. Returns `None` when no snapshot exists.
pub fn load_from_directory(dir: &Path) -> Result<Option<LoadedSnapshot>, AffinityError> {
	let path = dir.join(SNAPSHOT_FILE);
	if !path.exists() {
		return Ok(None);
	}
	let raw = std::fs::read(&path)?;
	let json = if is_gzipped(&raw) { decompress(&raw)? } else { raw };

	let file: SnapshotFile = serde_json::from_slice(&json)
		.map_err(|e| AffinityError::Corruption(format!("Invalid snapshot JSON: {}", e)))?;
	if file.version != SNAPSHOT_VERSION {
		return Err(AffinityError::Corruption(format!(
			"Unsupported snapshot version: {}",
			file.version
		)));
	}

	let loaded = file.into_snapshot();
	tracing::info!(
		dir = %dir.display(),
		vectors = loaded.snapshot.vectors.len(),
		pairs = loaded.snapshot.pairwise.len(),
		skipped = loaded.skipped,
		"Snapshot loaded"
	);
	Ok(Some(loaded))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{PairKey, SignalSource, SimilarityResult, UserPlaceKey};
	use chrono::Utc;

	fn sample() -> Snapshot {
		let now = Utc::now();
		let infp: PersonalityType = "INFP".parse().unwrap();
		Snapshot {
			vectors: vec![
				StoredVector {
					entity: Entity::Place(3),
					vector: EmbeddingVector {
						values: vec![0.5, -1.25, 3.0],
						keywords: KeywordSet::from_pairs(&[(16, 0.9)]),
						version: 2,
					},
				},
				StoredVector {
					entity: Entity::User(7),
					vector: EmbeddingVector {
						values: vec![1.0, 0.0, 0.0],
						keywords: KeywordSet::default(),
						version: 1,
					},
				},
			],
			personalities: vec![(7, infp)],
			bookmarks: vec![BookmarkEvent {
				user_id: 7,
				place_id: 3,
				personality: Some(infp),
				created_at: now,
			}],
			pairwise: vec![PlaceSimilarity {
				key: PairKey::new(3, 4),
				jaccard: 0.5,
				cosine_bin: 0.75,
				co_users: 4.0,
				co_count: 2,
				source: SignalSource::Behavioral,
				updated_at: now,
			}],
			user_place: vec![UserPlaceSimilarity {
				key: UserPlaceKey {
					user_id: 7,
					place_id: 3,
				},
				result: SimilarityResult {
					cosine: 0.1,
					jaccard: 0.0,
					euclidean_distance: 3.5,
					mbti_boost: 1.2,
					weighted: 0.084,
					common_keywords: 0,
					overlap_ratio: 0.0,
				},
				calculated_at: now,
				user_vector_version: 1,
				place_vector_version: 2,
			}],
			topk: vec![],
		}
	}

	#[test]
	fn embedding_encoding_is_little_endian() {
		assert_eq!(encode_embedding(&[1.0]), "AACAPw==");
		assert_eq!(decode_embedding("AACAPw==").unwrap(), vec![1.0]);
		assert!(decode_embedding("AACA").is_err());
		assert!(decode_embedding("***").is_err());
	}

	#[test]
	fn is_gzipped_detection() {
		let compressed = compress(b"test").unwrap();
		assert!(is_gzipped(&compressed));
		assert!(!is_gzipped(b"{}"));
		assert!(!is_gzipped(&[0x1f]));
		assert_eq!(decompress(&compressed).unwrap(), b"test");
	}

	#[test]
	fn save_then_load_restores_everything() {
		let dir = tempfile::tempdir().unwrap();
		let snapshot = sample();
		save_to_directory(dir.path(), &snapshot).unwrap();
		assert!(dir.path().join(SNAPSHOT_FILE).exists());
		assert!(!dir.path().join("snapshot.gz.tmp").exists());

		let loaded = load_from_directory(dir.path()).unwrap().unwrap();
		assert_eq!(loaded.skipped, 0);
		assert_eq!(loaded.snapshot, snapshot);
	}

	#[test]
	fn missing_snapshot_is_none() {
		let dir = tempfile::tempdir().unwrap();
		assert!(load_from_directory(dir.path()).unwrap().is_none());
	}

	#[test]
	fn corrupt_vector_rows_are_skipped() {
		let dir = tempfile::tempdir().unwrap();
		let json = r#"{
			"version": 1,
			"vectors": [
				{ "entity": {"kind":"place","id":1}, "embedding": "AACAPw==", "version": 1 },
				{ "entity": {"kind":"place","id":2}, "embedding": "AAC", "version": 1 }
			]
		}"#;
		std::fs::write(dir.path().join(SNAPSHOT_FILE), json).unwrap();
		let loaded = load_from_directory(dir.path()).unwrap().unwrap();
		assert_eq!(loaded.skipped, 1);
		assert_eq!(loaded.snapshot.vectors.len(), 1);
		assert_eq!(loaded.snapshot.vectors[0].entity, Entity::Place(1));
	}

	#[test]
	fn unknown_version_is_corruption() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join(SNAPSHOT_FILE), r#"{"version": 9}"#).unwrap();
		let err = load_from_directory(dir.path()).unwrap_err();
		assert!(matches!(err, AffinityError::Corruption(_)));
	}

	#[test]
	fn garbage_file_is_corruption() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join(SNAPSHOT_FILE), b"not json").unwrap();
		assert!(matches!(
			load_from_directory(dir.path()).unwrap_err(),
			AffinityError::Corruption(_)
		));
	}
}
