use thiserror::Error;

#[derive(Debug, Error)]
pub enum AffinityError {
	#[error("Dimension mismatch: {left} vs {right}")]
	DimensionMismatch { left: usize, right: usize },
	#[error("Upstream unavailable: {0}")]
	UpstreamUnavailable(String),
	#[error("Stale write: {0}")]
	StaleWrite(String),
	#[error("Invalid personality type: {0}")]
	InvalidPersonality(String),
	#[error("Invalid vector version: {0}")]
	InvalidVersion(String),
	#[error("Worker pool shut down: {0}")]
	PoolShutdown(String),
	#[error("Invalid configuration: {0}")]
	Config(String),
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("Serialization error: {0}")]
	Serialization(String),
	#[error("Storage corruption: {0}")]
	Corruption(String),
}

impl AffinityError {
	pub fn code(&self) -> &str {
		match self {
			Self::DimensionMismatch { .. } => "AFFINITY_DIMENSION_MISMATCH",
			Self::UpstreamUnavailable(_) => "AFFINITY_UPSTREAM_UNAVAILABLE",
			Self::StaleWrite(_) => "AFFINITY_STALE_WRITE",
			Self::InvalidPersonality(_) => "AFFINITY_INVALID_PERSONALITY",
			Self::InvalidVersion(_) => "AFFINITY_INVALID_VERSION",
			Self::PoolShutdown(_) => "AFFINITY_POOL_SHUTDOWN",
			Self::Config(_) => "AFFINITY_CONFIG",
			Self::Io(_) => "AFFINITY_IO",
			Self::Serialization(_) => "AFFINITY_SERIALIZATION",
			Self::Corruption(_) => "AFFINITY_CORRUPT",
		}
	}

	/// Whether a retry inside a background job could succeed.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::UpstreamUnavailable(_))
	}

	pub fn to_json_rpc_error(&self) -> serde_json::Value {
		serde_json::json!({
			"affinityCode": self.code(),
			"message": self.to_string(),
		})
	}
}

impl From<serde_json::Error> for AffinityError {
	fn from(e: serde_json::Error) -> Self {
		Self::Serialization(e.to_string())
	}
}
