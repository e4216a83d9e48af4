// ---------------------------------------------------------------------------
// AffinityServer: JSON-RPC dispatcher
// ---------------------------------------------------------------------------
//
// Routes JSON-RPC 2.0 requests (NDJSON over stdin) to the engine and the
// in-memory providers. A main `run()` loop, a `dispatch()` match and
// free-standing handler functions per method. Requests are handled one at a
// time; background work runs on the engine's pools.
// ---------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::engine::AffinityEngine;
use crate::error::AffinityError;
use crate::mbti::PersonalityType;
use crate::persistence::{self, Snapshot};
use crate::protocol::*;
use crate::providers::{MemoryBookmarks, MemoryEmbeddings};
use crate::transport::NdjsonTransport;
use crate::types::{BookmarkEvent, Entity, KeywordSet, PlaceId, RecomputeTarget, UserId, UserPlaceKey};

type RpcResult = Result<serde_json::Value, AffinityError>;

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct AffinityServer {
	transport: NdjsonTransport,
	engine: AffinityEngine,
	embeddings: Arc<MemoryEmbeddings>,
	bookmarks: Arc<MemoryBookmarks>,
	storage_path: Option<PathBuf>,
}

impl AffinityServer {
	pub fn new(
		transport: NdjsonTransport,
		engine: AffinityEngine,
		embeddings: Arc<MemoryEmbeddings>,
		bookmarks: Arc<MemoryBookmarks>,
	) -> Self {
		let storage_path = engine.config().storage_path.clone();
		Self {
			transport,
			engine,
			embeddings,
			bookmarks,
			storage_path,
		}
	}

	/// Restore the last snapshot, if a storage path is configured and one
	/// exists, then announce readiness.
	pub fn load(&self) -> Result<(), AffinityError> {
		if let Some(dir) = &self.storage_path {
			if let Some(loaded) = persistence::load_from_directory(dir)? {
				let snapshot = loaded.snapshot;
				self.embeddings
					.restore(snapshot.vectors, snapshot.personalities);
				self.bookmarks.restore(snapshot.bookmarks);
				self.engine
					.restore_tables(snapshot.pairwise, snapshot.user_place, snapshot.topk);
				if loaded.skipped > 0 {
					tracing::warn!(skipped = loaded.skipped, "Corrupt vector rows skipped");
				}
			}
		}
		self.transport.write_notification(
			"engine/ready",
			serde_json::to_value(self.engine.statistics())?,
		);
		Ok(())
	}

	/// Write a snapshot. Returns `false` when no storage path is configured.
	pub fn save(&self) -> Result<bool, AffinityError> {
		let Some(dir) = &self.storage_path else {
			return Ok(false);
		};
		let (pairwise, user_place, topk) = self.engine.export_tables();
		let snapshot = Snapshot {
			vectors: self.embeddings.snapshot(),
			personalities: self.embeddings.personalities(),
			bookmarks: self.bookmarks.snapshot(),
			pairwise,
			user_place,
			topk,
		};
		persistence::save_to_directory(dir, &snapshot)?;
		Ok(true)
	}

	/// Main loop: read JSON-RPC messages from stdin until EOF.
	pub async fn run(&self) -> Result<(), AffinityError> {
		let mut lines = BufReader::new(tokio::io::stdin()).lines();

		while let Some(line) = lines.next_line().await? {
			if line.trim().is_empty() {
				continue;
			}

			let request: JsonRpcRequest = match serde_json::from_str(&line) {
				Ok(r) => r,
				Err(e) => {
					tracing::error!("Failed to parse request: {}", e);
					continue;
				}
			};

			self.dispatch(request).await;
		}

		Ok(())
	}

	/// Drain the pools and write a final snapshot.
	pub async fn shutdown(&self) {
		self.engine.shutdown().await;
		if let Err(e) = self.save() {
			tracing::error!(error = %e, "Final snapshot failed");
		}
	}

	// ── Dispatch ──────────────────────────────────────────────────────────

	async fn dispatch(&self, req: JsonRpcRequest) {
		let id = req.id;
		let result = match req.method.as_str() {
			// -- Reads ---------------------------------------------------
			"neighbors/ranked" => handle_ranked(&self.engine, req.params),
			"similarity/between" => handle_between(&self.engine, req.params).await,
			"similarity/topForUser" => handle_top_for_user(&self.engine, req.params).await,
			"similarity/statistics" => to_json(self.engine.statistics()),
			"scheduler/status" => to_json(self.engine.status()),

			// -- Jobs ----------------------------------------------------
			"recompute/trigger" => handle_trigger(&self.engine, req.params).await,

			// -- Provider feeding ----------------------------------------
			"vectors/put" => self.handle_put_vector(req.params).await,
			"bookmarks/record" => self.handle_record_bookmark(req.params).await,

			// -- Persistence ---------------------------------------------
			"store/save" => self
				.save()
				.map(|saved| serde_json::json!({ "saved": saved })),

			// -- Unknown -------------------------------------------------
			_ => {
				self.transport.write_error(
					id,
					METHOD_NOT_FOUND,
					format!("Unknown method: {}", req.method),
					None,
				);
				return;
			}
		};

		match result {
			Ok(value) => self.transport.write_response(id, value),
			Err(e) => self.transport.write_error(
				id,
				error_code(&e),
				e.to_string(),
				Some(e.to_json_rpc_error()),
			),
		}
	}

	async fn handle_put_vector(&self, params: serde_json::Value) -> RpcResult {
		let p: PutVectorParams = parse_params(params)?;
		let version = self
			.embeddings
			.put(p.entity, p.embedding, p.keywords, p.version)?;
		if let (Entity::User(user_id), Some(personality)) = (p.entity, p.personality) {
			self.embeddings.set_personality(user_id, personality);
		}
		let invalidated = self.engine.notify_vector_replaced(p.entity).await?;
		Ok(serde_json::json!({ "version": version, "invalidated": invalidated }))
	}

	async fn handle_record_bookmark(&self, params: serde_json::Value) -> RpcResult {
		let p: BookmarkParams = parse_params(params)?;
		let event = BookmarkEvent {
			user_id: p.user_id,
			place_id: p.place_id,
			personality: p.personality,
			created_at: p.created_at.unwrap_or_else(Utc::now),
		};
		self.bookmarks.record(event.clone());
		let partners = self.engine.notify_bookmark(&event).await?;
		Ok(serde_json::json!({ "partners": partners }))
	}
}

fn to_json(value: impl serde::Serialize) -> RpcResult {
	Ok(serde_json::to_value(value)?)
}

// ---------------------------------------------------------------------------
// Param types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RankedParams {
	place_id: PlaceId,
	personality: Option<PersonalityType>,
	limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BetweenParams {
	a: Entity,
	b: Entity,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopForUserParams {
	user_id: UserId,
	min_score: Option<f64>,
	limit: Option<usize>,
	#[serde(default)]
	exclude_place_ids: BTreeSet<PlaceId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerParams {
	#[serde(flatten)]
	target: RecomputeTarget,
	#[serde(default)]
	wait: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutVectorParams {
	entity: Entity,
	embedding: Vec<f32>,
	#[serde(default)]
	keywords: KeywordSet,
	version: Option<u64>,
	personality: Option<PersonalityType>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookmarkParams {
	user_id: UserId,
	place_id: PlaceId,
	personality: Option<PersonalityType>,
	created_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn handle_ranked(engine: &AffinityEngine, params: serde_json::Value) -> RpcResult {
	let p: RankedParams = parse_params(params)?;
	let limit = p.limit.unwrap_or(engine.config().topk.k);
	let neighbors = engine.ranked_neighbors(p.place_id, p.personality, limit);
	Ok(serde_json::json!({ "neighbors": neighbors }))
}

async fn handle_between(engine: &AffinityEngine, params: serde_json::Value) -> RpcResult {
	let p: BetweenParams = parse_params(params)?;
	let key = UserPlaceKey::from_entities(p.a, p.b).ok_or_else(|| {
		AffinityError::Serialization("Invalid params: expected one user and one place".into())
	})?;
	let similarity = engine.similarity_between(key).await?;
	Ok(serde_json::json!({ "similarity": similarity }))
}

async fn handle_top_for_user(engine: &AffinityEngine, params: serde_json::Value) -> RpcResult {
	let p: TopForUserParams = parse_params(params)?;
	let results = engine
		.top_places_for_user(
			p.user_id,
			p.min_score.unwrap_or(0.0),
			p.limit.unwrap_or(10),
			&p.exclude_place_ids,
		)
		.await?;
	Ok(serde_json::json!({ "results": results }))
}

async fn handle_trigger(engine: &AffinityEngine, params: serde_json::Value) -> RpcResult {
	let p: TriggerParams = parse_params(params)?;
	if p.wait {
		let report = engine.recompute_now(p.target).await?;
		return Ok(serde_json::json!({ "report": report }));
	}
	let outcome = engine.trigger_recompute(p.target).await?;
	Ok(serde_json::json!({ "outcome": outcome }))
}
