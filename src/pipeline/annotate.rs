//! Maps the stage that decided a name to its confidence tier and note.

use crate::model::{ConfidenceTier, DecisionSource, ResolutionOutcome};

/// Backfill がどの範囲のバリアントを使ったか。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillScope {
    Episode,
    Actor,
}

impl BackfillScope {
    fn as_str(self) -> &'static str {
        match self {
            Self::Episode => "episode",
            Self::Actor => "actor",
        }
    }
}

/// 外部サービスを使わずにフォールバックした理由。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// LLM 正規化が設定で無効
    Disabled,
    /// 認証情報がない
    MissingCredentials,
    /// 致命的エラーで今回の実行では呼び出しを停止済み
    ServiceDisabled,
    /// 再試行を使い切った、または再試行不能なエラー
    ServiceFailed(String),
    /// 応答が名前として使えなかった
    InvalidResponse(String),
}

impl FallbackReason {
    fn describe(&self) -> String {
        match self {
            Self::Disabled => "llm normalization disabled".to_string(),
            Self::MissingCredentials => "llm credentials missing".to_string(),
            Self::ServiceDisabled => "llm disabled for this run after fatal error".to_string(),
            Self::ServiceFailed(error) => format!("llm call failed: {error}"),
            Self::InvalidResponse(error) => format!("llm response rejected: {error}"),
        }
    }
}

/// 各ステージの判定結果。名前と根拠を持つ。
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    ManualOverride {
        name: String,
        matched: String,
    },
    Backfilled {
        name: String,
        scope: BackfillScope,
        count: usize,
        total: usize,
        share: f64,
        majority: f64,
    },
    /// 名前を変えずに通す（空のままの場合を含む）。
    Unresolved {
        name: String,
        reason: String,
    },
    /// Secondary に同じ表記がある。
    ///
    /// 名前は変えないが、確認済みなので `unchanged` でも信頼度は high
    /// (他の `unchanged` は low)。
    Confirmed {
        name: String,
    },
    FuzzyDirect {
        name: String,
        score: u8,
        cutoff: u8,
    },
    /// 大文字小文字・句読点だけが違うクラスタ。
    FormattingVariant {
        name: String,
        count: usize,
    },
    /// 敬称・役職の表記だけが違うクラスタ (DCI / Detective Chief Inspector)。
    TitleVariant {
        name: String,
        core: String,
        count: usize,
    },
    LlmNormalized {
        name: String,
        cluster_size: usize,
    },
    FuzzyFallback {
        name: String,
        count: usize,
        reason: FallbackReason,
    },
}

impl Decision {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::ManualOverride { name, .. }
            | Self::Backfilled { name, .. }
            | Self::Unresolved { name, .. }
            | Self::Confirmed { name }
            | Self::FuzzyDirect { name, .. }
            | Self::FormattingVariant { name, .. }
            | Self::TitleVariant { name, .. }
            | Self::LlmNormalized { name, .. }
            | Self::FuzzyFallback { name, .. } => name,
        }
    }

    #[must_use]
    pub fn source(&self) -> DecisionSource {
        match self {
            Self::ManualOverride { .. } => DecisionSource::ManualOverride,
            Self::Backfilled { .. } => DecisionSource::Backfilled,
            Self::Unresolved { .. } | Self::Confirmed { .. } => DecisionSource::Unchanged,
            Self::FuzzyDirect { .. }
            | Self::FormattingVariant { .. }
            | Self::TitleVariant { .. }
            | Self::FuzzyFallback { .. } => DecisionSource::FuzzyMatched,
            Self::LlmNormalized { .. } => DecisionSource::LlmNormalized,
        }
    }
}

/// 判定結果から信頼度と注記を決める。副作用なし。
#[must_use]
pub fn annotate(decision: &Decision) -> ResolutionOutcome {
    let (confidence, note) = match decision {
        Decision::ManualOverride { matched, .. } => (
            ConfidenceTier::High,
            format!("manual override for '{matched}'"),
        ),
        Decision::Backfilled {
            name,
            scope,
            count,
            total,
            share,
            majority,
        } => {
            let tier = if *share > *majority {
                ConfidenceTier::High
            } else {
                ConfidenceTier::Medium
            };
            (
                tier,
                format!(
                    "backfilled '{name}' from {} variants ({count}/{total}, share {share:.2})",
                    scope.as_str()
                ),
            )
        }
        Decision::Unresolved { reason, .. } => (ConfidenceTier::Low, reason.clone()),
        Decision::Confirmed { .. } => (
            ConfidenceTier::High,
            "confirmed by secondary".to_string(),
        ),
        Decision::FuzzyDirect {
            name,
            score,
            cutoff,
        } => (
            ConfidenceTier::High,
            format!("fuzzy matched '{name}' (score {score} >= {cutoff})"),
        ),
        Decision::FormattingVariant { name, .. } => (
            ConfidenceTier::High,
            format!("formatting variant of '{name}'"),
        ),
        Decision::TitleVariant { name, core, count } => (
            ConfidenceTier::High,
            format!("title variant of '{core}'; kept abbreviated '{name}' ({count} occurrences)"),
        ),
        Decision::LlmNormalized { cluster_size, .. } => (
            ConfidenceTier::High,
            format!("llm normalized from {cluster_size} variants"),
        ),
        Decision::FuzzyFallback {
            name,
            count,
            reason,
        } => (
            ConfidenceTier::Medium,
            format!(
                "fallback to most frequent variant '{name}' ({count} occurrences): {}",
                reason.describe()
            ),
        ),
    };

    ResolutionOutcome {
        character_name: decision.name().to_string(),
        confidence,
        source: decision.source(),
        note,
    }
}
