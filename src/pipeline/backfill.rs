//! Backfill of empty or placeholder character names from secondary variants.

use crate::model::CastRecord;
use crate::util::text::{PlaceholderNames, clean_character_name};

use super::actor_index::{ActorIndex, ActorProfile};
use super::annotate::{BackfillScope, Decision};

/// Backfill の判定結果。
#[derive(Debug, Clone, PartialEq)]
pub enum BackfillOutcome {
    /// 名前があるので後段へ渡す（整形済みの名前）。
    Present(String),
    /// 名前が欠けていたので、この判定で確定。
    Resolved(Decision),
}

/// 空・プレースホルダーの役名を Secondary の最多バリアントで埋める。
#[derive(Debug, Clone)]
pub struct BackfillResolver {
    placeholders: PlaceholderNames,
    majority: f64,
}

impl BackfillResolver {
    #[must_use]
    pub fn new(placeholders: PlaceholderNames, majority: f64) -> Self {
        Self {
            placeholders,
            majority,
        }
    }

    #[must_use]
    pub fn placeholders(&self) -> &PlaceholderNames {
        &self.placeholders
    }

    /// エピソード単位のバリアントがあればそれを優先し、なければ俳優全体を使う。
    #[must_use]
    pub fn resolve(&self, record: &CastRecord, index: &ActorIndex) -> BackfillOutcome {
        let cleaned = clean_character_name(&record.character_name);
        if !self.placeholders.is_missing(&cleaned) {
            return BackfillOutcome::Present(cleaned);
        }

        let scoped = index
            .episode_profile(&record.episode_id, &record.actor_id)
            .filter(|profile| !profile.is_empty())
            .map(|profile| (BackfillScope::Episode, profile))
            .or_else(|| {
                index
                    .profile(&record.actor_id)
                    .filter(|profile| !profile.is_empty())
                    .map(|profile| (BackfillScope::Actor, profile))
            });

        let decision = match scoped {
            Some((scope, profile)) => self.backfill_from(scope, profile),
            None => None,
        };

        BackfillOutcome::Resolved(decision.unwrap_or_else(|| Decision::Unresolved {
            name: String::new(),
            reason: "name missing and no secondary variants".to_string(),
        }))
    }

    fn backfill_from(&self, scope: BackfillScope, profile: &ActorProfile) -> Option<Decision> {
        let top = profile.top()?;
        Some(Decision::Backfilled {
            name: top.name.clone(),
            scope,
            count: top.count,
            total: profile.total(),
            share: profile.top_share(),
            majority: self.majority,
        })
    }
}
