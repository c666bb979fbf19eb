//! Fuzzy comparison of a primary name against the actor's secondary variants.

use std::collections::BTreeSet;

use crate::util::similarity::{ScoreCombination, scores};
use crate::util::text::{normalize_key, same_name, title_variations};

use super::actor_index::Variant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuzzySettings {
    /// 候補として残す最低スコア
    pub threshold: u8,
    /// 単独で直接採用できるスコア
    pub high_confidence: u8,
    /// 他のバリアントがこのスコア以上なら直接採用しない
    pub competitor_floor: u8,
    pub combination: ScoreCombination,
    pub title_variations: bool,
}

impl Default for FuzzySettings {
    fn default() -> Self {
        Self {
            threshold: 80,
            high_confidence: 95,
            competitor_floor: 80,
            combination: ScoreCombination::Max,
            title_variations: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub count: usize,
    pub score: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FuzzyVerdict {
    /// Secondary に大文字小文字・空白違いの同じ名前がある。
    Exact { name: String },
    /// しきい値を超える候補がない。
    NoCandidates { best: Option<u8> },
    /// 1 つの候補を高信頼で採用する。
    Direct(Candidate),
    /// 曖昧なので正規化に回す。候補はスコア降順。
    Ambiguous(Vec<Candidate>),
}

#[derive(Debug, Clone, Default)]
pub struct FuzzyMatcher {
    settings: FuzzySettings,
}

impl FuzzyMatcher {
    #[must_use]
    pub fn new(settings: FuzzySettings) -> Self {
        Self { settings }
    }

    #[must_use]
    pub fn settings(&self) -> &FuzzySettings {
        &self.settings
    }

    /// 2 名前間のスコア。敬称バリエーション同士の最大値を取る。
    #[must_use]
    pub fn score(&self, a: &str, b: &str) -> u8 {
        let left = self.forms(a);
        let right = self.forms(b);
        left.iter()
            .flat_map(|l| right.iter().map(move |r| (l, r)))
            .map(|(l, r)| scores(l, r).combined(self.settings.combination))
            .max()
            .unwrap_or(0)
    }

    fn forms(&self, name: &str) -> BTreeSet<String> {
        if self.settings.title_variations {
            title_variations(name)
        } else {
            let key = normalize_key(name);
            if key.is_empty() {
                BTreeSet::new()
            } else {
                BTreeSet::from([key])
            }
        }
    }

    /// 全バリアントを採点して判定する。
    #[must_use]
    pub fn evaluate(&self, name: &str, variants: &[Variant]) -> FuzzyVerdict {
        if let Some(exact) = variants.iter().find(|v| same_name(&v.name, name)) {
            return FuzzyVerdict::Exact {
                name: exact.name.clone(),
            };
        }

        let mut scored: Vec<Candidate> = variants
            .iter()
            .map(|variant| Candidate {
                name: variant.name.clone(),
                count: variant.count,
                score: self.score(name, &variant.name),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| b.count.cmp(&a.count))
                .then_with(|| a.name.cmp(&b.name))
        });

        let best = scored.first().map(|c| c.score);
        let threshold = self.settings.threshold;
        let Some(top) = scored.first().filter(|c| c.score >= threshold) else {
            return FuzzyVerdict::NoCandidates { best };
        };

        let cutoff = self.settings.high_confidence.max(threshold);
        let contested = scored
            .iter()
            .skip(1)
            .any(|other| other.score >= self.settings.competitor_floor);
        if top.score >= cutoff && !contested {
            return FuzzyVerdict::Direct(top.clone());
        }

        scored.retain(|c| c.score >= threshold);
        FuzzyVerdict::Ambiguous(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variants(items: &[(&str, usize)]) -> Vec<Variant> {
        items
            .iter()
            .map(|(name, count)| Variant {
                name: (*name).to_string(),
                count: *count,
            })
            .collect()
    }

    #[test]
    fn exact_match_is_reported_before_scoring() {
        let matcher = FuzzyMatcher::default();
        let verdict = matcher.evaluate("ds fidel  best", &variants(&[("DS Fidel Best", 5)]));
        assert_eq!(
            verdict,
            FuzzyVerdict::Exact {
                name: "DS Fidel Best".to_string()
            }
        );
    }

    #[test]
    fn title_variations_close_abbreviation_gap() {
        let matcher = FuzzyMatcher::default();
        assert_eq!(
            matcher.score("Detective Sergeant Fidel Best", "DS Fidel Best"),
            100
        );

        let plain = FuzzyMatcher::new(FuzzySettings {
            title_variations: false,
            ..FuzzySettings::default()
        });
        assert!(plain.score("Detective Sergeant Fidel Best", "DS Fidel Best") < 100);
    }

    #[test]
    fn lone_strong_candidate_is_direct() {
        let matcher = FuzzyMatcher::default();
        let verdict = matcher.evaluate(
            "Tom Barnaby",
            &variants(&[("DCI Tom Barnaby", 10), ("Joyce Barnaby", 2)]),
        );
        let FuzzyVerdict::Direct(candidate) = verdict else {
            panic!("expected direct match, got {verdict:?}");
        };
        assert_eq!(candidate.name, "DCI Tom Barnaby");
        assert_eq!(candidate.score, 100);
    }

    #[test]
    fn competing_candidates_form_a_cluster() {
        let matcher = FuzzyMatcher::default();
        let verdict = matcher.evaluate(
            "Barnaby",
            &variants(&[("DCI Tom Barnaby", 10), ("DCI John Barnaby", 6)]),
        );
        let FuzzyVerdict::Ambiguous(candidates) = verdict else {
            panic!("expected ambiguous cluster, got {verdict:?}");
        };
        let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["DCI Tom Barnaby", "DCI John Barnaby"]);
    }

    #[test]
    fn unrelated_variants_yield_no_candidates() {
        let matcher = FuzzyMatcher::default();
        let verdict = matcher.evaluate("Sergeant Troy", &variants(&[("Cully Barnaby", 3)]));
        assert!(matches!(verdict, FuzzyVerdict::NoCandidates { best: Some(_) }));
        assert_eq!(
            matcher.evaluate("Sergeant Troy", &[]),
            FuzzyVerdict::NoCandidates { best: None }
        );
    }

    #[test]
    fn mid_range_score_is_forwarded_not_direct() {
        let matcher = FuzzyMatcher::new(FuzzySettings {
            threshold: 30,
            high_confidence: 95,
            ..FuzzySettings::default()
        });
        let verdict = matcher.evaluate("Officer Fidel", &variants(&[("DS Fidel Best", 5)]));
        let FuzzyVerdict::Ambiguous(candidates) = verdict else {
            panic!("expected forwarded cluster, got {verdict:?}");
        };
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].score >= 30 && candidates[0].score < 95);
    }

    #[test]
    fn direct_matches_are_monotonic_in_threshold() {
        let pool = variants(&[
            ("DCI Tom Barnaby", 10),
            ("Tom", 1),
            ("Sergeant Troy", 4),
            ("Thomas Barnaby", 2),
        ]);
        let names = ["Tom Barnaby", "Barnaby", "Troy", "Sgt Troy", "Tom B."];

        for name in names {
            let mut direct_seen_at_higher = None;
            for threshold in (50..=100).rev() {
                let matcher = FuzzyMatcher::new(FuzzySettings {
                    threshold,
                    high_confidence: threshold.max(95),
                    ..FuzzySettings::default()
                });
                let direct = match matcher.evaluate(name, &pool) {
                    FuzzyVerdict::Direct(c) => Some(c.name),
                    _ => None,
                };
                if let Some(expected) = &direct_seen_at_higher {
                    assert_eq!(
                        direct.as_ref(),
                        Some(expected),
                        "{name}: direct match lost when lowering threshold to {threshold}"
                    );
                }
                if direct.is_some() {
                    direct_seen_at_higher = direct;
                }
            }
        }
    }
}
