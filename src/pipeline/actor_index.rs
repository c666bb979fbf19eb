//! Per-actor character-name variants gathered from the secondary dataset.

use std::str::FromStr;

use rustc_hash::FxHashMap;

use crate::model::CastRecord;
use crate::util::text::{PlaceholderNames, clean_character_name, normalize_key};

/// 出現回数が同じバリアントの並べ方。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    #[default]
    FirstSeen,
    Lexicographic,
}

impl FromStr for TieBreak {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "first-seen" | "first_seen" | "firstseen" => Ok(Self::FirstSeen),
            "lexicographic" | "alphabetical" => Ok(Self::Lexicographic),
            other => Err(format!("unknown tie-break: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub name: String,
    pub count: usize,
}

/// 出現回数の降順に並んだバリアント一覧。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActorProfile {
    variants: Vec<Variant>,
    total: usize,
}

impl ActorProfile {
    #[must_use]
    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    #[must_use]
    pub fn top(&self) -> Option<&Variant> {
        self.variants.first()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// 最多バリアントが全出現数に占める割合。
    #[must_use]
    pub fn top_share(&self) -> f64 {
        match (self.top(), self.total) {
            #[allow(clippy::cast_precision_loss)]
            (Some(top), total) if total > 0 => top.count as f64 / total as f64,
            _ => 0.0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

/// 集計途中の状態。表記は最初に見た形を採用する。
#[derive(Default)]
struct Tally {
    entries: Vec<(String, String, usize)>,
    positions: FxHashMap<String, usize>,
}

impl Tally {
    fn add(&mut self, name: &str) {
        let key = normalize_key(name);
        match self.positions.get(&key) {
            Some(&index) => self.entries[index].2 += 1,
            None => {
                self.positions.insert(key.clone(), self.entries.len());
                self.entries.push((key, name.to_string(), 1));
            }
        }
    }

    fn into_profile(self, tie_break: TieBreak) -> ActorProfile {
        let mut entries = self.entries;
        // sort_by は安定ソートなので FirstSeen は挿入順が保たれる
        match tie_break {
            TieBreak::FirstSeen => entries.sort_by(|a, b| b.2.cmp(&a.2)),
            TieBreak::Lexicographic => {
                entries.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
            }
        }
        let total = entries.iter().map(|(_, _, count)| count).sum();
        ActorProfile {
            variants: entries
                .into_iter()
                .map(|(_, name, count)| Variant { name, count })
                .collect(),
            total,
        }
    }
}

/// Secondary データセットから作る俳優別のバリアント索引。
///
/// 実行ごとに 1 回だけ構築し、解決中は読み取り専用。
#[derive(Debug, Clone, Default)]
pub struct ActorIndex {
    by_actor: FxHashMap<String, ActorProfile>,
    by_episode: FxHashMap<(String, String), ActorProfile>,
}

impl ActorIndex {
    #[must_use]
    pub fn build(
        secondary: &[CastRecord],
        placeholders: &PlaceholderNames,
        tie_break: TieBreak,
    ) -> Self {
        let mut by_actor: FxHashMap<String, Tally> = FxHashMap::default();
        let mut by_episode: FxHashMap<(String, String), Tally> = FxHashMap::default();

        for record in secondary {
            let actor_id = record.actor_id.trim();
            if actor_id.is_empty() {
                continue;
            }
            let name = clean_character_name(&record.character_name);
            if placeholders.is_missing(&name) {
                continue;
            }

            by_actor.entry(actor_id.to_string()).or_default().add(&name);
            let episode_id = record.episode_id.trim();
            if !episode_id.is_empty() {
                by_episode
                    .entry((episode_id.to_string(), actor_id.to_string()))
                    .or_default()
                    .add(&name);
            }
        }

        Self {
            by_actor: by_actor
                .into_iter()
                .map(|(actor, tally)| (actor, tally.into_profile(tie_break)))
                .collect(),
            by_episode: by_episode
                .into_iter()
                .map(|(key, tally)| (key, tally.into_profile(tie_break)))
                .collect(),
        }
    }

    /// 俳優全体のプロファイル。未知の俳優なら `None`。
    #[must_use]
    pub fn profile(&self, actor_id: &str) -> Option<&ActorProfile> {
        self.by_actor.get(actor_id.trim())
    }

    /// 俳優全体のバリアント。未知の俳優なら空。
    #[must_use]
    pub fn variants(&self, actor_id: &str) -> &[Variant] {
        self.profile(actor_id)
            .map(ActorProfile::variants)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn episode_profile(&self, episode_id: &str, actor_id: &str) -> Option<&ActorProfile> {
        self.by_episode
            .get(&(episode_id.trim().to_string(), actor_id.trim().to_string()))
    }

    #[must_use]
    pub fn episode_variants(&self, episode_id: &str, actor_id: &str) -> &[Variant] {
        self.episode_profile(episode_id, actor_id)
            .map(ActorProfile::variants)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn actor_count(&self) -> usize {
        self.by_actor.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceTag;

    fn secondary(actor: &str, episode: &str, name: &str) -> CastRecord {
        CastRecord::new(actor, "", episode, "tt0118401", name, SourceTag::Secondary)
    }

    fn names(variants: &[Variant]) -> Vec<(&str, usize)> {
        variants.iter().map(|v| (v.name.as_str(), v.count)).collect()
    }

    #[test]
    fn ranks_by_frequency_then_first_seen() {
        let records = vec![
            secondary("nm1", "e1", "Nick Barnaby"),
            secondary("nm1", "e2", "Nicholas Barnaby"),
            secondary("nm1", "e3", "Nicholas Barnaby"),
            secondary("nm1", "e4", "DCI Barnaby"),
            secondary("nm1", "e5", "nick  barnaby"),
            secondary("nm1", "e6", "DCI Barnaby"),
        ];
        let index = ActorIndex::build(&records, &PlaceholderNames::default(), TieBreak::FirstSeen);

        assert_eq!(
            names(index.variants("nm1")),
            vec![
                ("Nick Barnaby", 2),
                ("Nicholas Barnaby", 2),
                ("DCI Barnaby", 2)
            ]
        );
    }

    #[test]
    fn lexicographic_tie_break_orders_by_name() {
        let records = vec![
            secondary("nm1", "e1", "Nick Barnaby"),
            secondary("nm1", "e2", "DCI Barnaby"),
        ];
        let index = ActorIndex::build(
            &records,
            &PlaceholderNames::default(),
            TieBreak::Lexicographic,
        );

        assert_eq!(
            names(index.variants("nm1")),
            vec![("DCI Barnaby", 1), ("Nick Barnaby", 1)]
        );
    }

    #[test]
    fn skips_placeholders_and_cleans_names() {
        let records = vec![
            secondary("nm2", "e1", "[\"DS Fidel Best\"]"),
            secondary("nm2", "e2", "Self"),
            secondary("nm2", "e3", ""),
            secondary("", "e4", "Orphan"),
        ];
        let index = ActorIndex::build(&records, &PlaceholderNames::default(), TieBreak::FirstSeen);

        assert_eq!(names(index.variants("nm2")), vec![("DS Fidel Best", 1)]);
        assert_eq!(index.actor_count(), 1);
    }

    #[test]
    fn unknown_actor_has_no_variants() {
        let index = ActorIndex::default();
        assert!(index.variants("nm404").is_empty());
        assert!(index.profile("nm404").is_none());
    }

    #[test]
    fn episode_scope_is_tracked_separately() {
        let records = vec![
            secondary("nm3", "e1", "Joyce Barnaby"),
            secondary("nm3", "e2", "Joyce Barnaby"),
            secondary("nm3", "e3", "Joyce"),
        ];
        let index = ActorIndex::build(&records, &PlaceholderNames::default(), TieBreak::FirstSeen);

        assert_eq!(names(index.episode_variants("e3", "nm3")), vec![("Joyce", 1)]);
        let profile = index.profile("nm3").expect("profile");
        assert_eq!(profile.total(), 3);
        assert!((profile.top_share() - 2.0 / 3.0).abs() < 1e-9);
    }
}
