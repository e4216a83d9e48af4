use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::cooccurrence::CooccurrenceConfig;
use crate::error::AffinityError;
use crate::mbti::{MbtiRuleTable, PersonalityType};
use crate::pool::PoolConfig;
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerConfig;
use crate::scorer::ScorerWeights;
use crate::topk::TopKConfig;
use crate::types::{DEFAULT_CONFIDENCE_THRESHOLD, EMBEDDING_DIM};

#[derive(Parser, Debug)]
#[command(name = "affinity-engine", about = "Place affinity engine over JSON-RPC on stdio")]
pub struct CliArgs {
	/// Directory holding snapshot.gz. Without it nothing is persisted.
	#[arg(long, env = "AFFINITY_STORAGE_PATH")]
	pub storage_path: Option<PathBuf>,

	/// JSON file with MBTI boost rules. The built-in table is used otherwise.
	#[arg(long, env = "AFFINITY_RULES_PATH")]
	pub rules_path: Option<PathBuf>,

	/// Required embedding length. 0 accepts any length.
	#[arg(long, default_value_t = EMBEDDING_DIM, env = "AFFINITY_DIMENSION")]
	pub dimension: usize,

	/// Weight of cosine similarity in the user×place score
	#[arg(long, default_value = "0.7", env = "AFFINITY_COSINE_WEIGHT")]
	pub cosine_weight: f64,

	/// Weight of keyword Jaccard in the user×place score
	#[arg(long, default_value = "0.3", env = "AFFINITY_JACCARD_WEIGHT")]
	pub jaccard_weight: f64,

	/// Multiplier when a personality rule matches
	#[arg(long, default_value = "1.2", env = "AFFINITY_MBTI_BOOST")]
	pub mbti_boost: f64,

	/// Minimum weighted score kept by batch jobs
	#[arg(long, default_value = "0.1", env = "AFFINITY_MIN_WEIGHTED")]
	pub min_weighted: f64,

	/// Neighbors kept per Top-K list
	#[arg(long, default_value = "100", env = "AFFINITY_TOPK")]
	pub top_k: usize,

	#[arg(long, default_value = "0.7", env = "AFFINITY_TOPK_JACCARD_WEIGHT")]
	pub topk_jaccard_weight: f64,

	#[arg(long, default_value = "0.3", env = "AFFINITY_TOPK_COSINE_WEIGHT")]
	pub topk_cosine_weight: f64,

	/// Personality buckets to maintain (comma separated, e.g. INFP,ESTJ).
	/// All sixteen when omitted; "none" disables buckets.
	#[arg(long, env = "AFFINITY_BUCKETS")]
	pub buckets: Option<String>,

	/// Co-occurrence lookback window in days
	#[arg(long, default_value = "90", env = "AFFINITY_LOOKBACK_DAYS")]
	pub lookback_days: i64,

	#[arg(long, default_value = "2.0", env = "AFFINITY_SAME_MBTI_WEIGHT")]
	pub same_mbti_weight: f64,

	#[arg(long, default_value = "1.0", env = "AFFINITY_DIFF_MBTI_WEIGHT")]
	pub diff_mbti_weight: f64,

	/// Cached user×place rows older than this are recomputed
	#[arg(long, default_value = "24", env = "AFFINITY_CACHE_MAX_AGE_HOURS")]
	pub cache_max_age_hours: i64,

	/// Cached rows older than this are evicted by the cleanup job
	#[arg(long, default_value = "30", env = "AFFINITY_CACHE_RETENTION_DAYS")]
	pub cache_retention_days: i64,

	/// Seconds between full recomputes (0 disables)
	#[arg(long, default_value = "14400", env = "AFFINITY_FULL_RECOMPUTE_SECS")]
	pub full_recompute_secs: u64,

	/// Seconds between Top-K refreshes of dirty places (0 disables)
	#[arg(long, default_value = "1800", env = "AFFINITY_TOPK_REFRESH_SECS")]
	pub topk_refresh_secs: u64,

	/// Seconds between cache cleanups (0 disables)
	#[arg(long, default_value = "86400", env = "AFFINITY_CLEANUP_SECS")]
	pub cleanup_secs: u64,

	/// Core workers of the general pool (cleanup, Top-K refresh)
	#[arg(long, default_value = "4", env = "AFFINITY_GENERAL_CORE")]
	pub general_core: usize,

	#[arg(long, default_value = "8", env = "AFFINITY_GENERAL_MAX")]
	pub general_max: usize,

	/// Core workers of the similarity pool (recomputes)
	#[arg(long, default_value = "2", env = "AFFINITY_SIMILARITY_CORE")]
	pub similarity_core: usize,

	#[arg(long, default_value = "4", env = "AFFINITY_SIMILARITY_MAX")]
	pub similarity_max: usize,

	/// Do not start periodic jobs; only explicit triggers run
	#[arg(long, env = "AFFINITY_NO_SCHEDULER")]
	pub no_scheduler: bool,

	/// Log level (trace, debug, info, warn, error)
	#[arg(long, default_value = "info", env = "AFFINITY_LOG_LEVEL")]
	pub log_level: String,
}

/// Every tunable of the engine. `Default` carries the production values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
	pub dimension: Option<usize>,
	pub cosine_weight: f64,
	pub jaccard_weight: f64,
	pub mbti_boost: f64,
	pub confidence_threshold: f64,
	pub min_weighted: f64,
	pub cache_max_age_hours: i64,
	pub cache_retention_days: i64,
	pub topk: TopKConfig,
	pub cooccurrence: CooccurrenceConfig,
	pub scheduler: SchedulerConfig,
	pub general_pool: PoolConfig,
	pub similarity_pool: PoolConfig,
	pub retry: RetryPolicy,
	pub storage_path: Option<PathBuf>,
	pub rules_path: Option<PathBuf>,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			dimension: Some(EMBEDDING_DIM),
			cosine_weight: 0.7,
			jaccard_weight: 0.3,
			mbti_boost: 1.2,
			confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
			min_weighted: 0.1,
			cache_max_age_hours: 24,
			cache_retention_days: 30,
			topk: TopKConfig::default(),
			cooccurrence: CooccurrenceConfig::default(),
			scheduler: SchedulerConfig::default(),
			general_pool: PoolConfig::general(),
			similarity_pool: PoolConfig::similarity(),
			retry: RetryPolicy::default(),
			storage_path: None,
			rules_path: None,
		}
	}
}

impl EngineConfig {
	pub fn scorer_weights(&self) -> ScorerWeights {
		ScorerWeights {
			cosine: self.cosine_weight,
			jaccard: self.jaccard_weight,
			mbti_boost: self.mbti_boost,
			confidence_threshold: self.confidence_threshold,
		}
	}

	/// The configured rule table, or the built-in one.
	pub fn load_rules(&self) -> Result<Arc<MbtiRuleTable>, AffinityError> {
		match &self.rules_path {
			Some(path) => Ok(Arc::new(MbtiRuleTable::load(path)?)),
			None => Ok(Arc::new(MbtiRuleTable::default())),
		}
	}

	pub fn validate(&self) -> Result<(), AffinityError> {
		let weights = [
			("cosineWeight", self.cosine_weight),
			("jaccardWeight", self.jaccard_weight),
			("topk.jaccardWeight", self.topk.jaccard_weight),
			("topk.cosineWeight", self.topk.cosine_weight),
		];
		for (name, w) in weights {
			if !w.is_finite() || w < 0.0 {
				return Err(AffinityError::Config(format!("{} must be >= 0, got {}", name, w)));
			}
		}
		let boosts = [
			("mbtiBoost", self.mbti_boost),
			("topk.baseBoost", self.topk.base_boost),
		];
		for (name, b) in boosts {
			if !b.is_finite() || b < 1.0 {
				return Err(AffinityError::Config(format!("{} must be >= 1, got {}", name, b)));
			}
		}
		if !self.min_weighted.is_finite() {
			return Err(AffinityError::Config("minWeighted must be finite".into()));
		}
		if self.topk.k == 0 {
			return Err(AffinityError::Config("topk.k must be at least 1".into()));
		}
		if self.topk.parallelism == 0 {
			return Err(AffinityError::Config("topk.parallelism must be at least 1".into()));
		}

		let co = &self.cooccurrence;
		if co.lookback_days <= 0 {
			return Err(AffinityError::Config("cooccurrence.lookbackDays must be positive".into()));
		}
		if !co.diff_mbti_weight.is_finite() || co.diff_mbti_weight < 0.0 {
			return Err(AffinityError::Config(format!(
				"cooccurrence.diffMbtiWeight must be >= 0, got {}",
				co.diff_mbti_weight
			)));
		}
		// Also rules out same <= 0, which would zero every behavioral cosine.
		if !co.same_mbti_weight.is_finite() || co.same_mbti_weight <= co.diff_mbti_weight {
			return Err(AffinityError::Config(format!(
				"cooccurrence.sameMbtiWeight ({}) must exceed diffMbtiWeight ({})",
				co.same_mbti_weight, co.diff_mbti_weight
			)));
		}
		Ok(())
	}
}

fn parse_buckets(raw: &str) -> Result<Vec<PersonalityType>, AffinityError> {
	let trimmed = raw.trim();
	if trimmed.eq_ignore_ascii_case("none") || trimmed.is_empty() {
		return Ok(Vec::new());
	}
	if trimmed.eq_ignore_ascii_case("all") {
		return Ok(PersonalityType::all());
	}
	trimmed.split(',').map(|s| s.parse()).collect()
}

impl TryFrom<CliArgs> for EngineConfig {
	type Error = AffinityError;

	fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
		let defaults = EngineConfig::default();
		let buckets = match args.buckets.as_deref() {
			Some(raw) => parse_buckets(raw)?,
			None => PersonalityType::all(),
		};
		let config = EngineConfig {
			dimension: (args.dimension > 0).then_some(args.dimension),
			cosine_weight: args.cosine_weight,
			jaccard_weight: args.jaccard_weight,
			mbti_boost: args.mbti_boost,
			min_weighted: args.min_weighted,
			cache_max_age_hours: args.cache_max_age_hours,
			cache_retention_days: args.cache_retention_days,
			topk: TopKConfig {
				k: args.top_k,
				jaccard_weight: args.topk_jaccard_weight,
				cosine_weight: args.topk_cosine_weight,
				base_boost: args.mbti_boost,
				buckets,
				..defaults.topk.clone()
			},
			cooccurrence: CooccurrenceConfig {
				lookback_days: args.lookback_days,
				same_mbti_weight: args.same_mbti_weight,
				diff_mbti_weight: args.diff_mbti_weight,
				..defaults.cooccurrence.clone()
			},
			scheduler: SchedulerConfig {
				enabled: !args.no_scheduler,
				full_recompute_secs: args.full_recompute_secs,
				topk_refresh_secs: args.topk_refresh_secs,
				cleanup_secs: args.cleanup_secs,
				..defaults.scheduler.clone()
			},
			general_pool: PoolConfig {
				core: args.general_core,
				max: args.general_max,
				..PoolConfig::general()
			},
			similarity_pool: PoolConfig {
				core: args.similarity_core,
				max: args.similarity_max,
				..PoolConfig::similarity()
			},
			storage_path: args.storage_path,
			rules_path: args.rules_path,
			..defaults
		};
		config.validate()?;
		Ok(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_production_values() {
		let config = EngineConfig::default();
		assert_eq!(config.dimension, Some(100));
		assert_eq!(config.topk.k, 100);
		assert_eq!(config.topk.buckets.len(), 16);
		assert_eq!(config.cooccurrence.lookback_days, 90);
		assert_eq!(config.scheduler.full_recompute_secs, 14_400);
		assert_eq!(config.scheduler.topk_refresh_secs, 1_800);
		assert_eq!(config.general_pool.core, 4);
		assert_eq!(config.similarity_pool.max, 4);
		assert!(config.validate().is_ok());
	}

	#[test]
	fn cli_args_map_into_config() {
		let args = CliArgs::parse_from([
			"affinity-engine",
			"--dimension",
			"0",
			"--top-k",
			"5",
			"--buckets",
			"infp,ESTJ",
			"--no-scheduler",
			"--similarity-core",
			"1",
		]);
		let config = EngineConfig::try_from(args).unwrap();
		assert_eq!(config.dimension, None);
		assert_eq!(config.topk.k, 5);
		assert_eq!(config.topk.buckets.len(), 2);
		assert!(!config.scheduler.enabled);
		assert_eq!(config.similarity_pool.core, 1);
		assert_eq!(config.similarity_pool.queue, 50);
	}

	#[test]
	fn bad_bucket_is_rejected() {
		let args = CliArgs::parse_from(["affinity-engine", "--buckets", "XXXX"]);
		assert!(matches!(
			EngineConfig::try_from(args),
			Err(AffinityError::InvalidPersonality(_))
		));
		assert!(parse_buckets("none").unwrap().is_empty());
	}

	#[test]
	fn partial_json_fills_defaults() {
		let config: EngineConfig =
			serde_json::from_str(r#"{ "minWeighted": 0.2, "topk": { "k": 10 } }"#).unwrap();
		assert_eq!(config.min_weighted, 0.2);
		assert_eq!(config.topk.k, 10);
		assert_eq!(config.topk.jaccard_weight, 0.7);
		assert_eq!(config.cosine_weight, 0.7);
	}

	#[test]
	fn weight_and_boost_invariants_are_enforced() {
		type Tweak = fn(&mut EngineConfig);
		let cases: [(&str, Tweak); 9] = [
			("same equals diff", |c: &mut EngineConfig| c.cooccurrence.same_mbti_weight = 1.0),
			("same below diff", |c: &mut EngineConfig| c.cooccurrence.same_mbti_weight = 0.5),
			("same zero", |c: &mut EngineConfig| {
				c.cooccurrence.same_mbti_weight = 0.0;
				c.cooccurrence.diff_mbti_weight = 0.0;
			}),
			("same NaN", |c: &mut EngineConfig| c.cooccurrence.same_mbti_weight = f64::NAN),
			("diff negative", |c: &mut EngineConfig| c.cooccurrence.diff_mbti_weight = -1.0),
			("boost below one", |c: &mut EngineConfig| c.mbti_boost = 0.8),
			("boost infinite", |c: &mut EngineConfig| c.mbti_boost = f64::INFINITY),
			("bucket boost NaN", |c: &mut EngineConfig| c.topk.base_boost = f64::NAN),
			("no parallelism", |c: &mut EngineConfig| c.topk.parallelism = 0),
		];
		for (name, tweak) in cases {
			let mut config = EngineConfig::default();
			tweak(&mut config);
			assert!(
				matches!(config.validate(), Err(AffinityError::Config(_))),
				"{} should be rejected",
				name
			);
		}

		let mut config = EngineConfig::default();
		config.mbti_boost = 1.0;
		config.cooccurrence.same_mbti_weight = 3.0;
		config.cooccurrence.diff_mbti_weight = 0.0;
		assert!(config.validate().is_ok());
	}

	#[test]
	fn cli_rejects_inverted_mbti_weights() {
		let args = CliArgs::parse_from([
			"affinity-engine",
			"--same-mbti-weight",
			"1.0",
			"--diff-mbti-weight",
			"2.0",
		]);
		assert!(matches!(EngineConfig::try_from(args), Err(AffinityError::Config(_))));
	}

	#[test]
	fn negative_weight_fails_validation() {
		let config = EngineConfig {
			cosine_weight: -1.0,
			..EngineConfig::default()
		};
		assert!(matches!(config.validate(), Err(AffinityError::Config(_))));
	}
}
