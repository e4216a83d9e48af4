use serde::Deserialize;

use crate::error::AffinityError;

// JSON-RPC 2.0 error codes
pub const INTERNAL_ERROR: i32 = -32603;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const AFFINITY_ERROR: i32 = -32000;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
	pub id: u64,
	pub method: String,
	#[serde(default)]
	pub params: serde_json::Value,
}

/// JSON-RPC code for an engine error. The machine-readable `affinityCode`
/// travels in the error's `data`.
pub fn error_code(error: &AffinityError) -> i32 {
	match error {
		AffinityError::Serialization(_)
		| AffinityError::InvalidPersonality(_)
		| AffinityError::InvalidVersion(_) => INVALID_PARAMS,
		AffinityError::Io(_) | AffinityError::Corruption(_) => INTERNAL_ERROR,
		_ => AFFINITY_ERROR,
	}
}

pub fn parse_params<T: serde::de::DeserializeOwned>(
	params: serde_json::Value,
) -> Result<T, AffinityError> {
	serde_json::from_value(params)
		.map_err(|e| AffinityError::Serialization(format!("Invalid params: {}", e)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_without_params_defaults_to_null() {
		let req: JsonRpcRequest =
			serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"method":"scheduler/status"}"#).unwrap();
		assert_eq!(req.id, 3);
		assert!(req.params.is_null());
	}

	#[test]
	fn error_codes_by_kind() {
		assert_eq!(error_code(&AffinityError::Serialization("x".into())), INVALID_PARAMS);
		assert_eq!(
			error_code(&AffinityError::DimensionMismatch { left: 1, right: 2 }),
			AFFINITY_ERROR
		);
		assert_eq!(error_code(&AffinityError::Corruption("x".into())), INTERNAL_ERROR);
	}

	#[test]
	fn parse_params_reports_field() {
		#[derive(Debug, Deserialize)]
		#[serde(rename_all = "camelCase")]
		struct P {
			#[allow(dead_code)]
			place_id: u64,
		}
		let err = parse_params::<P>(serde_json::json!({})).unwrap_err();
		assert!(err.to_string().contains("placeId"));
	}
}
