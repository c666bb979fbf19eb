//! Cast record types shared by every pipeline stage.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::Value;
use thiserror::Error;

/// レコードの出所。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    #[default]
    Primary,
    Secondary,
}

/// 1 行分のキャスト情報。
///
/// 既知の列以外は `extra` にそのまま保持し、出力時に書き戻す。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub actor_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub actor_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub episode_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub series_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub character_name: String,
    #[serde(default)]
    pub source: SourceTag,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `null` は空文字、数値は文字列として受け付ける。
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(text)) => Ok(text),
        Some(Value::Number(number)) => Ok(number.to_string()),
        Some(other) => Err(de::Error::custom(format!(
            "expected a string, found {other}"
        ))),
    }
}

/// 入力レコードの欠陥。該当レコードだけをスキップする。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordDefect {
    #[error("missing actor identifier")]
    MissingActorId,
    #[error("missing episode identifier")]
    MissingEpisodeId,
}

impl CastRecord {
    #[must_use]
    pub fn new(
        actor_id: impl Into<String>,
        actor_name: impl Into<String>,
        episode_id: impl Into<String>,
        series_id: impl Into<String>,
        character_name: impl Into<String>,
        source: SourceTag,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            actor_name: actor_name.into(),
            episode_id: episode_id.into(),
            series_id: series_id.into(),
            character_name: character_name.into(),
            source,
            extra: BTreeMap::new(),
        }
    }

    /// Primary レコードとして必須の列が揃っているかを検証する。
    ///
    /// # Errors
    /// actor id か episode id が空の場合は [`RecordDefect`] を返す。
    pub fn validate_primary(&self) -> Result<(), RecordDefect> {
        if self.actor_id.trim().is_empty() {
            return Err(RecordDefect::MissingActorId);
        }
        if self.episode_id.trim().is_empty() {
            return Err(RecordDefect::MissingEpisodeId);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

impl ConfidenceTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for ConfidenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 最終的な名前を決定したステージ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionSource {
    Unchanged,
    Backfilled,
    ManualOverride,
    FuzzyMatched,
    LlmNormalized,
}

impl DecisionSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Backfilled => "backfilled",
            Self::ManualOverride => "manual-override",
            Self::FuzzyMatched => "fuzzy-matched",
            Self::LlmNormalized => "llm-normalized",
        }
    }
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionOutcome {
    pub character_name: String,
    pub confidence: ConfidenceTier,
    pub source: DecisionSource,
    pub note: String,
}

/// 解決済みレコード。元の列と結果を 1 対 1 で保持する。
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRecord {
    record: CastRecord,
    outcome: ResolutionOutcome,
}

impl ResolvedRecord {
    /// 元レコードの列を保ったまま、名前だけを結果の値に差し替える。
    #[must_use]
    pub fn new(input: &CastRecord, outcome: ResolutionOutcome) -> Self {
        let mut record = input.clone();
        record.character_name.clone_from(&outcome.character_name);
        Self { record, outcome }
    }

    #[must_use]
    pub fn record(&self) -> &CastRecord {
        &self.record
    }

    #[must_use]
    pub fn outcome(&self) -> &ResolutionOutcome {
        &self.outcome
    }

    #[must_use]
    pub fn character_name(&self) -> &str {
        &self.outcome.character_name
    }

    #[must_use]
    pub fn confidence(&self) -> ConfidenceTier {
        self.outcome.confidence
    }

    #[must_use]
    pub fn source(&self) -> DecisionSource {
        self.outcome.source
    }
}

#[derive(Serialize)]
struct OutputRow<'a> {
    #[serde(flatten)]
    record: &'a CastRecord,
    confidence: ConfidenceTier,
    cleanup_note: &'a str,
}

impl Serialize for ResolvedRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        OutputRow {
            record: &self.record,
            confidence: self.outcome.confidence,
            cleanup_note: &self.outcome.note,
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_columns_round_trip_into_output() {
        let raw = serde_json::json!({
            "actor_id": "nm001",
            "actor_name": "Neil Dudgeon",
            "episode_id": "tt100",
            "series_id": "tt000",
            "character_name": "",
            "cast_type": "regular",
        });
        let record: CastRecord = serde_json::from_value(raw).expect("record parses");
        assert_eq!(record.source, SourceTag::Primary);
        assert_eq!(record.extra.get("cast_type"), Some(&Value::from("regular")));

        let resolved = ResolvedRecord::new(
            &record,
            ResolutionOutcome {
                character_name: "DCI John Barnaby".to_string(),
                confidence: ConfidenceTier::High,
                source: DecisionSource::Backfilled,
                note: "backfilled".to_string(),
            },
        );
        let value = serde_json::to_value(&resolved).expect("serializes");

        assert_eq!(value["character_name"], "DCI John Barnaby");
        assert_eq!(value["cast_type"], "regular");
        assert_eq!(value["confidence"], "high");
        assert_eq!(value["cleanup_note"], "backfilled");
        assert!(value.get("decision_source").is_none());
    }

    #[test]
    fn null_and_numeric_columns_are_read_as_strings() {
        let raw = serde_json::json!({
            "actor_id": "nm002",
            "episode_id": 4512,
            "series_id": null,
            "character_name": null,
        });
        let record: CastRecord = serde_json::from_value(raw).expect("record parses");
        assert_eq!(record.episode_id, "4512");
        assert_eq!(record.series_id, "");
        assert_eq!(record.character_name, "");
        assert_eq!(record.actor_name, "");

        let nested = serde_json::json!({ "actor_id": "nm002", "character_name": ["Troy"] });
        assert!(serde_json::from_value::<CastRecord>(nested).is_err());
    }

    #[test]
    fn validate_primary_flags_missing_identifiers() {
        let mut record = CastRecord::new("", "A", "tt1", "s", "X", SourceTag::Primary);
        assert_eq!(
            record.validate_primary(),
            Err(RecordDefect::MissingActorId)
        );
        record.actor_id = "nm1".to_string();
        record.episode_id = "  ".to_string();
        assert_eq!(
            record.validate_primary(),
            Err(RecordDefect::MissingEpisodeId)
        );
    }

    #[test]
    fn confidence_tiers_order_low_to_high() {
        assert!(ConfidenceTier::High > ConfidenceTier::Medium);
        assert!(ConfidenceTier::Medium > ConfidenceTier::Low);
    }
}
