//! 文字列類似度 (0-100)。
//!
//! 編集距離ベースの比率、部分一致、トークン順序無視、トークン集合の 4 指標を
//! 計算し、設定に応じて最大値または平均で 1 つのスコアにまとめる。

use std::collections::BTreeSet;

use strsim::normalized_levenshtein;

/// 複数指標の結合方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreCombination {
    #[default]
    Max,
    Mean,
}

impl std::str::FromStr for ScoreCombination {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "max" => Ok(Self::Max),
            "mean" | "avg" | "average" => Ok(Self::Mean),
            other => Err(format!("unknown score combination: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimilarityScores {
    pub ratio: u8,
    pub partial: u8,
    pub token_sort: u8,
    pub token_set: u8,
}

impl SimilarityScores {
    #[must_use]
    pub fn combined(&self, combination: ScoreCombination) -> u8 {
        let all = [self.ratio, self.partial, self.token_sort, self.token_set];
        match combination {
            ScoreCombination::Max => all.into_iter().max().unwrap_or(0),
            ScoreCombination::Mean => {
                let sum: u32 = all.iter().map(|&s| u32::from(s)).sum();
                u8::try_from((sum + 2) / 4).unwrap_or(100)
            }
        }
    }
}

/// 正規化済みの 2 文字列に対する全指標。
#[must_use]
pub fn scores(a: &str, b: &str) -> SimilarityScores {
    SimilarityScores {
        ratio: ratio(a, b),
        partial: partial_ratio(a, b),
        token_sort: token_sort_ratio(a, b),
        token_set: token_set_ratio(a, b),
    }
}

fn to_percent(similarity: f64) -> u8 {
    let scaled = (similarity.clamp(0.0, 1.0) * 100.0).round();
    // clamp 済みなので 0..=100 に収まる
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let percent = scaled as u8;
    percent
}

/// 文字列全体の編集距離比率。どちらかが空なら 0。
///
/// 置換も 1 操作と数える正規化 Levenshtein なので、挿入・削除だけを数える
/// indel 比率より低めに出る ("nick barnaby" / "nicholas barnaby" は 69)。
#[must_use]
pub fn ratio(a: &str, b: &str) -> u8 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    to_percent(normalized_levenshtein(a, b))
}

/// 短い方を長い方の同じ長さの窓に滑らせたときの最大比率。
#[must_use]
pub fn partial_ratio(a: &str, b: &str) -> u8 {
    let (shorter, longer) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    if shorter.is_empty() {
        return 0;
    }

    let longer_chars: Vec<char> = longer.chars().collect();
    let width = shorter.chars().count();
    if width == longer_chars.len() {
        return ratio(shorter, longer);
    }

    let mut best = 0;
    for window in longer_chars.windows(width) {
        let candidate: String = window.iter().collect();
        best = best.max(ratio(shorter, &candidate));
        if best == 100 {
            break;
        }
    }
    best
}

fn sorted_tokens(value: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = value.split_whitespace().collect();
    tokens.sort_unstable();
    tokens
}

/// トークンを並べ替えてから比較する。
#[must_use]
pub fn token_sort_ratio(a: &str, b: &str) -> u8 {
    ratio(&sorted_tokens(a).join(" "), &sorted_tokens(b).join(" "))
}

/// 共通トークンと差分トークンを組み合わせて比較する。
///
/// 片方のトークンがもう片方に包含される場合は 100 になる。
#[must_use]
pub fn token_set_ratio(a: &str, b: &str) -> u8 {
    let left: BTreeSet<&str> = a.split_whitespace().collect();
    let right: BTreeSet<&str> = b.split_whitespace().collect();
    if left.is_empty() || right.is_empty() {
        return 0;
    }

    let join = |tokens: Vec<&str>| tokens.join(" ");
    let intersection = join(left.intersection(&right).copied().collect());
    let only_left = join(left.difference(&right).copied().collect());
    let only_right = join(right.difference(&left).copied().collect());

    let combine = |rest: &str| {
        if intersection.is_empty() {
            rest.to_string()
        } else if rest.is_empty() {
            intersection.clone()
        } else {
            format!("{intersection} {rest}")
        }
    };
    let with_left = combine(&only_left);
    let with_right = combine(&only_right);

    [
        ratio(&intersection, &with_left),
        ratio(&intersection, &with_right),
        ratio(&with_left, &with_right),
    ]
    .into_iter()
    .max()
    .unwrap_or(0)
}
