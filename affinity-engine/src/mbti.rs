// ---------------------------------------------------------------------------
// Personality types and the MBTI boost rule table
// ---------------------------------------------------------------------------
//
// A boost rule pairs one personality trait letter with a cluster of keyword
// ids. When an entity's high-confidence keywords intersect the cluster and
// the user's personality carries the trait, the base boost applies.
//
// The table is data, not code: the built-in default is a small example
// mapping and deployments are expected to load their own from JSON.
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::AffinityError;

// ---------------------------------------------------------------------------
// PersonalityType
// ---------------------------------------------------------------------------

/// A validated four-letter MBTI code, stored upper-case.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PersonalityType([u8; 4]);

const AXES: [[u8; 2]; 4] = [*b"EI", *b"NS", *b"TF", *b"JP"];

impl PersonalityType {
	/// All sixteen codes in axis order (`ENTJ` .. `ISFP`).
	pub fn all() -> Vec<PersonalityType> {
		let mut out = Vec::with_capacity(16);
		for a in AXES[0] {
			for b in AXES[1] {
				for c in AXES[2] {
					for d in AXES[3] {
						out.push(PersonalityType([a, b, c, d]));
					}
				}
			}
		}
		out
	}

	pub fn has_trait(&self, letter: Trait) -> bool {
		self.0.contains(&letter.as_byte())
	}

	pub fn as_str(&self) -> &str {
		// Constructed only from validated ASCII letters.
		std::str::from_utf8(&self.0).unwrap_or("????")
	}
}

impl FromStr for PersonalityType {
	type Err = AffinityError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let upper = s.trim().to_ascii_uppercase();
		let bytes = upper.as_bytes();
		if bytes.len() != 4 {
			return Err(AffinityError::InvalidPersonality(s.to_string()));
		}
		let mut code = [0u8; 4];
		for (i, axis) in AXES.iter().enumerate() {
			if !axis.contains(&bytes[i]) {
				return Err(AffinityError::InvalidPersonality(s.to_string()));
			}
			code[i] = bytes[i];
		}
		Ok(Self(code))
	}
}

impl fmt::Display for PersonalityType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl fmt::Debug for PersonalityType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "PersonalityType({})", self.as_str())
	}
}

impl Serialize for PersonalityType {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for PersonalityType {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = String::deserialize(deserializer)?;
		raw.parse().map_err(serde::de::Error::custom)
	}
}

// ---------------------------------------------------------------------------
// Rule table
// ---------------------------------------------------------------------------

/// A single MBTI letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trait {
	E,
	I,
	N,
	S,
	T,
	F,
	J,
	P,
}

impl Trait {
	fn as_byte(self) -> u8 {
		match self {
			Self::E => b'E',
			Self::I => b'I',
			Self::N => b'N',
			Self::S => b'S',
			Self::T => b'T',
			Self::F => b'F',
			Self::J => b'J',
			Self::P => b'P',
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoostRule {
	#[serde(rename = "trait")]
	pub trait_letter: Trait,
	pub keyword_ids: BTreeSet<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub label: Option<String>,
}

/// Ordered list of boost rules. First match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MbtiRuleTable {
	pub rules: Vec<BoostRule>,
}

impl Default for MbtiRuleTable {
	fn default() -> Self {
		let rule = |trait_letter, ids: [u32; 4], label: &str| BoostRule {
			trait_letter,
			keyword_ids: ids.into_iter().collect(),
			label: Some(label.to_string()),
		};
		Self {
			rules: vec![
				rule(Trait::I, [16, 38, 24, 98], "quiet / low-stimulation"),
				rule(Trait::E, [26, 43, 96, 99], "social / lively"),
				rule(Trait::N, [23, 85, 91, 93], "creative / unusual"),
				rule(Trait::S, [87, 90, 51, 68], "traditional / reliable"),
			],
		}
	}
}

impl MbtiRuleTable {
	pub fn empty() -> Self {
		Self { rules: Vec::new() }
	}

	/// Load a rule table from a JSON file shaped like
	/// `{ "rules": [{ "trait": "I", "keywordIds": [16, 38] }] }`.
	pub fn load(path: &Path) -> Result<Self, AffinityError> {
		let raw = std::fs::read_to_string(path)?;
		let table: MbtiRuleTable = serde_json::from_str(&raw)?;
		tracing::info!(path = %path.display(), rules = table.rules.len(), "Loaded MBTI rule table");
		Ok(table)
	}

	/// Multiplier for an entity given the viewer's personality.
	///
	/// Returns `base_boost` (never below 1.0) when a rule matches, 1.0
	/// otherwise or when the personality is unknown.
	pub fn boost(
		&self,
		personality: Option<&PersonalityType>,
		high_confidence_ids: &BTreeSet<u32>,
		base_boost: f64,
	) -> f64 {
		let personality = match personality {
			Some(p) => p,
			None => return 1.0,
		};
		let matched = self.rules.iter().any(|rule| {
			personality.has_trait(rule.trait_letter)
				&& rule.keyword_ids.iter().any(|id| high_confidence_ids.contains(id))
		});
		if matched && base_boost.is_finite() {
			base_boost.max(1.0)
		} else {
			1.0
		}
	}
}

/// Free-function form of [`MbtiRuleTable::boost`].
pub fn mbti_boost(
	table: &MbtiRuleTable,
	personality: Option<&PersonalityType>,
	high_confidence_ids: &BTreeSet<u32>,
	base_boost: f64,
) -> f64 {
	table.boost(personality, high_confidence_ids, base_boost)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ids(list: &[u32]) -> BTreeSet<u32> {
		list.iter().copied().collect()
	}

	#[test]
	fn parses_and_normalizes_case() {
		let p: PersonalityType = "infp".parse().unwrap();
		assert_eq!(p.as_str(), "INFP");
		assert!(p.has_trait(Trait::I));
		assert!(p.has_trait(Trait::N));
		assert!(!p.has_trait(Trait::E));
	}

	#[test]
	fn rejects_invalid_codes() {
		assert!("INF".parse::<PersonalityType>().is_err());
		assert!("XNFP".parse::<PersonalityType>().is_err());
		assert!("INFPX".parse::<PersonalityType>().is_err());
		assert!("NIFP".parse::<PersonalityType>().is_err());
	}

	#[test]
	fn all_returns_sixteen_distinct() {
		let all = PersonalityType::all();
		assert_eq!(all.len(), 16);
		let unique: BTreeSet<_> = all.iter().collect();
		assert_eq!(unique.len(), 16);
	}

	#[test]
	fn serde_roundtrip_as_string() {
		let p: PersonalityType = "ESTJ".parse().unwrap();
		let json = serde_json::to_string(&p).unwrap();
		assert_eq!(json, "\"ESTJ\"");
		let err = serde_json::from_str::<PersonalityType>("\"ABCD\"");
		assert!(err.is_err());
	}

	#[test]
	fn introvert_matches_quiet_cluster() {
		let table = MbtiRuleTable::default();
		let p: PersonalityType = "ISTP".parse().unwrap();
		assert_eq!(table.boost(Some(&p), &ids(&[16, 2]), 1.2), 1.2);
	}

	#[test]
	fn no_personality_means_no_boost() {
		let table = MbtiRuleTable::default();
		assert_eq!(table.boost(None, &ids(&[16, 26]), 1.5), 1.0);
	}

	#[test]
	fn unmatched_keywords_mean_no_boost() {
		let table = MbtiRuleTable::default();
		let p: PersonalityType = "ENTJ".parse().unwrap();
		// 16 is in the introvert cluster only
		assert_eq!(table.boost(Some(&p), &ids(&[16]), 1.5), 1.0);
	}

	#[test]
	fn boost_never_below_one() {
		let table = MbtiRuleTable::default();
		let p: PersonalityType = "ESFP".parse().unwrap();
		assert_eq!(table.boost(Some(&p), &ids(&[26]), 0.5), 1.0);
	}

	#[test]
	fn empty_table_never_boosts() {
		let p: PersonalityType = "INFJ".parse().unwrap();
		assert_eq!(mbti_boost(&MbtiRuleTable::empty(), Some(&p), &ids(&[16]), 1.3), 1.0);
	}

	#[test]
	fn load_from_json_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("rules.json");
		std::fs::write(&path, r#"{ "rules": [{ "trait": "J", "keywordIds": [7] }] }"#).unwrap();
		let table = MbtiRuleTable::load(&path).unwrap();
		let p: PersonalityType = "ISTJ".parse().unwrap();
		assert_eq!(table.boost(Some(&p), &ids(&[7]), 1.4), 1.4);
	}
}
