//! Versioned type hints.
//!
//! Every tagged value on the wire or on disk carries a `_hint` such as
//! `init-ballot-fact-v0.0.1`. The table of known hints is fixed at build
//! time; anything else is rejected before decoding.

use super::BaseError;
use std::collections::BTreeMap;
use std::fmt;

pub const HINT_FIELD: &str = "_hint";

pub const JSON_ENCODER_HINT: &str = "json-encoder-v0.0.1";
pub const LOCALFS_WRITER_HINT: &str = "localfs-block-writer-v0.0.1";

pub const INIT_BALLOT_FACT_HINT: &str = "init-ballot-fact-v0.0.1";
pub const ACCEPT_BALLOT_FACT_HINT: &str = "accept-ballot-fact-v0.0.1";

pub const SUFFRAGE_CANDIDATE_FACT_HINT: &str = "suffrage-candidate-fact-v0.0.1";
pub const SUFFRAGE_JOIN_FACT_HINT: &str = "suffrage-join-fact-v0.0.1";
pub const SUFFRAGE_EXPEL_FACT_HINT: &str = "suffrage-expel-fact-v0.0.1";
pub const NETWORK_POLICY_FACT_HINT: &str = "network-policy-fact-v0.0.1";
pub const KEY_VALUE_FACT_HINT: &str = "key-value-fact-v0.0.1";

pub const SUFFRAGE_NODES_STATE_VALUE_HINT: &str = "suffrage-nodes-state-value-v0.0.1";
pub const SUFFRAGE_CANDIDATES_STATE_VALUE_HINT: &str = "suffrage-candidates-state-value-v0.0.1";
pub const SUFFRAGE_EXPELS_STATE_VALUE_HINT: &str = "suffrage-expels-state-value-v0.0.1";
pub const NETWORK_POLICY_STATE_VALUE_HINT: &str = "network-policy-state-value-v0.0.1";
pub const KEY_VALUE_STATE_VALUE_HINT: &str = "key-value-state-value-v0.0.1";

pub const FIXED_CANDIDATE_LIMITER_HINT: &str = "fixed-suffrage-candidate-limiter-rule-v0.0.1";

/// Category a known hint decodes into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HintedKind {
    Encoder,
    Writer,
    BallotFact,
    OperationFact,
    StateValue,
    LimiterRule,
}

/// `<type>-v<version>`, split at the last `-v`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hint {
    pub kind: String,
    pub version: String,
}

impl Hint {
    pub fn parse(s: &str) -> Result<Self, BaseError> {
        let Some((kind, version)) = s.rsplit_once("-v") else {
            return Err(BaseError::InvalidHint(s.to_string()));
        };
        if kind.is_empty()
            || version.is_empty()
            || !version.split('.').all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        {
            return Err(BaseError::InvalidHint(s.to_string()));
        }
        Ok(Hint {
            kind: kind.to_string(),
            version: version.to_string(),
        })
    }
}

impl fmt::Display for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.kind, self.version)
    }
}

#[derive(Clone, Debug)]
pub struct HintTable {
    known: BTreeMap<&'static str, HintedKind>,
}

impl HintTable {
    pub fn new() -> Self {
        let known = [
            (JSON_ENCODER_HINT, HintedKind::Encoder),
            (LOCALFS_WRITER_HINT, HintedKind::Writer),
            (INIT_BALLOT_FACT_HINT, HintedKind::BallotFact),
            (ACCEPT_BALLOT_FACT_HINT, HintedKind::BallotFact),
            (SUFFRAGE_CANDIDATE_FACT_HINT, HintedKind::OperationFact),
            (SUFFRAGE_JOIN_FACT_HINT, HintedKind::OperationFact),
            (SUFFRAGE_EXPEL_FACT_HINT, HintedKind::OperationFact),
            (NETWORK_POLICY_FACT_HINT, HintedKind::OperationFact),
            (KEY_VALUE_FACT_HINT, HintedKind::OperationFact),
            (SUFFRAGE_NODES_STATE_VALUE_HINT, HintedKind::StateValue),
            (SUFFRAGE_CANDIDATES_STATE_VALUE_HINT, HintedKind::StateValue),
            (SUFFRAGE_EXPELS_STATE_VALUE_HINT, HintedKind::StateValue),
            (NETWORK_POLICY_STATE_VALUE_HINT, HintedKind::StateValue),
            (KEY_VALUE_STATE_VALUE_HINT, HintedKind::StateValue),
            (FIXED_CANDIDATE_LIMITER_HINT, HintedKind::LimiterRule),
        ]
        .into_iter()
        .collect();

        HintTable { known }
    }

    pub fn lookup(&self, hint: &str) -> Result<HintedKind, BaseError> {
        Hint::parse(hint)?;
        self.known
            .get(hint)
            .copied()
            .ok_or_else(|| BaseError::UnknownHint(hint.to_string()))
    }

    /// Fails fast on an unknown `_hint` anywhere inside a decoded JSON tree.
    pub fn check_value(&self, value: &serde_json::Value) -> Result<(), BaseError> {
        match value {
            serde_json::Value::Object(map) => {
                if let Some(hint) = map.get(HINT_FIELD) {
                    let hint = hint
                        .as_str()
                        .ok_or_else(|| BaseError::InvalidHint(hint.to_string()))?;
                    self.lookup(hint)?;
                }
                map.values().try_for_each(|v| self.check_value(v))
            }
            serde_json::Value::Array(items) => items.iter().try_for_each(|v| self.check_value(v)),
            _ => Ok(()),
        }
    }
}

impl Default for HintTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hint() {
        let h = Hint::parse(INIT_BALLOT_FACT_HINT).unwrap();
        assert_eq!(h.kind, "init-ballot-fact");
        assert_eq!(h.version, "0.0.1");
        assert_eq!(h.to_string(), INIT_BALLOT_FACT_HINT);

        assert!(Hint::parse("no-version").is_err());
        assert!(Hint::parse("bad-vx.1").is_err());
    }

    #[test]
    fn unknown_hints_fail_fast() {
        let table = HintTable::new();
        assert_eq!(table.lookup(JSON_ENCODER_HINT).unwrap(), HintedKind::Encoder);
        assert!(matches!(
            table.lookup("made-up-v0.0.1"),
            Err(BaseError::UnknownHint(_))
        ));

        let nested = serde_json::json!({"a": [{"_hint": "made-up-v0.0.1"}]});
        assert!(table.check_value(&nested).is_err());
        let ok = serde_json::json!({"a": [{"_hint": KEY_VALUE_FACT_HINT}]});
        assert!(table.check_value(&ok).is_ok());
    }
}
