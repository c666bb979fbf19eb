//! Character-name text helpers: cleaning, key normalization, placeholder detection
//! and title variations used by fuzzy comparison.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static NON_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s]").expect("compile punctuation pattern"));

/// 敬称・役職の正式名称と略称の対応表。先頭の略称を代表とする。
const TITLES: &[(&str, &[&str])] = &[
    ("detective chief inspector", &["dci"]),
    ("detective chief superintendent", &["dcs"]),
    ("detective superintendent", &["dsupt", "det supt"]),
    ("detective inspector", &["di"]),
    ("detective sergeant", &["ds"]),
    ("detective constable", &["dc"]),
    ("police constable", &["pc"]),
    ("woman police constable", &["wpc"]),
    ("chief inspector", &["ci", "ch insp"]),
    ("inspector", &["insp"]),
    ("sergeant", &["sgt"]),
    ("superintendent", &["supt"]),
    ("constable", &["const"]),
    ("doctor", &["dr"]),
    ("professor", &["prof"]),
    ("reverend", &["rev", "revd"]),
    ("captain", &["capt"]),
    ("lieutenant", &["lt"]),
    ("colonel", &["col"]),
    ("general", &["gen"]),
    ("major", &["maj"]),
    ("mister", &["mr"]),
    ("saint", &["st"]),
];

/// 中核の名前を取り出すときに TITLES と合わせて落とす呼称。
const HONORIFICS: &[&str] = &["mrs", "ms", "miss"];

/// 生の役名を整形する。
///
/// JSON 配列文字列 (`["A", "B"]`) は最初の要素を採用し、括弧と引用符を剥がして
/// 空白を 1 つにまとめる。`[]` や `null` は空文字になる。
#[must_use]
pub fn clean_character_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "[]" || trimmed.eq_ignore_ascii_case("null") {
        return String::new();
    }

    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        if let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(trimmed) {
            return values
                .iter()
                .find_map(|value| value.as_str().map(collapse_whitespace))
                .filter(|name| !name.is_empty())
                .unwrap_or_default();
        }
    }

    let stripped: String = trimmed
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | '"'))
        .collect();
    collapse_whitespace(&stripped)
}

/// 連続する空白を 1 つにまとめ、前後を落とす。
#[must_use]
pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 比較・辞書キー用の正規化 (NFKC + 小文字 + 空白整理)。
#[must_use]
pub fn normalize_key(value: &str) -> String {
    let folded: String = value.nfkc().collect::<String>().to_lowercase();
    collapse_whitespace(&folded)
}

/// 正規化した上で句読点を除去する。表記ゆれ判定に使う。
#[must_use]
pub fn strip_punctuation(value: &str) -> String {
    let normalized = normalize_key(value);
    collapse_whitespace(&NON_WORD.replace_all(&normalized, " "))
}

/// 2 つの名前が大文字小文字・空白の違いだけか。
#[must_use]
pub fn same_name(a: &str, b: &str) -> bool {
    normalize_key(a) == normalize_key(b)
}

/// 2 つの名前が書式（大文字小文字・空白・句読点）の違いだけか。
#[must_use]
pub fn formatting_only_difference(a: &str, b: &str) -> bool {
    let left = strip_punctuation(a);
    !left.is_empty() && left == strip_punctuation(b)
}

/// 先頭の冠詞と敬称・役職を取り除いた中核の名前（句読点除去・正規化済み）。
///
/// 敬称しかない名前は空文字になる。
#[must_use]
pub fn core_name(name: &str) -> String {
    let key = strip_punctuation(name);
    let tokens: Vec<&str> = key.split(' ').filter(|token| !token.is_empty()).collect();
    let mut rest = tokens.as_slice();
    loop {
        if rest.first() == Some(&"the") {
            rest = &rest[1..];
            continue;
        }
        match title_prefix_len(rest) {
            Some(width) => rest = &rest[width..],
            None => break,
        }
    }
    rest.join(" ")
}

/// 略称の敬称・役職 (DCI, Dr など) を含むか。
#[must_use]
pub fn has_title_abbreviation(name: &str) -> bool {
    let key = strip_punctuation(name);
    let tokens: Vec<&str> = key.split(' ').filter(|token| !token.is_empty()).collect();
    TITLES
        .iter()
        .flat_map(|(_, abbreviations)| abbreviations.iter())
        .any(|abbr| {
            let parts: Vec<&str> = abbr.split(' ').collect();
            tokens.windows(parts.len()).any(|window| window == parts.as_slice())
        })
}

fn title_prefix_len(tokens: &[&str]) -> Option<usize> {
    TITLES
        .iter()
        .flat_map(|(full, abbreviations)| std::iter::once(full).chain(abbreviations.iter()))
        .chain(HONORIFICS.iter())
        .map(|title| title.split(' ').collect::<Vec<_>>())
        .filter(|parts| tokens.starts_with(parts))
        .map(|parts| parts.len())
        .max()
}

/// 役名として意味を持たないプレースホルダーの集合。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderNames {
    names: BTreeSet<String>,
}

impl PlaceholderNames {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names
            .into_iter()
            .map(|name| normalize_key(name.as_ref()))
            .filter(|name| !name.is_empty())
            .collect();
        Self { names }
    }

    /// 空・空白のみ・プレースホルダーのいずれかなら `true`。
    #[must_use]
    pub fn is_missing(&self, name: &str) -> bool {
        let key = normalize_key(name);
        key.is_empty() || self.names.contains(&key)
    }
}

impl Default for PlaceholderNames {
    fn default() -> Self {
        Self::new(["self", "uncredited", "unknown", "n/a", "null", "none"])
    }
}

/// 名前の敬称バリエーションを返す（すべて正規化済み、元の名前を含む）。
///
/// 略称は正式名称へ、正式名称は代表略称へ置き換え、ピリオドの有無と先頭の
/// "the" の有無も吸収する。
#[must_use]
pub fn title_variations(name: &str) -> BTreeSet<String> {
    let base = normalize_key(name);
    let mut variations = BTreeSet::new();
    if base.is_empty() {
        return variations;
    }

    let undotted = collapse_whitespace(&base.replace('.', " "));
    let without_article = undotted
        .strip_prefix("the ")
        .map(str::to_string)
        .unwrap_or_else(|| undotted.clone());

    let tokens: Vec<&str> = without_article.split(' ').collect();
    if let Some(expanded) = expand_abbreviations(&tokens) {
        variations.insert(expanded);
    }
    if let Some(contracted) = contract_titles(&tokens) {
        variations.insert(contracted);
    }

    variations.insert(base);
    variations.insert(undotted);
    variations.insert(without_article);
    variations
}

fn expand_abbreviations(tokens: &[&str]) -> Option<String> {
    let mut changed = false;
    let mut out: Vec<&str> = Vec::with_capacity(tokens.len());
    let mut index = 0;
    while index < tokens.len() {
        let matched = TITLES.iter().find_map(|(full, abbreviations)| {
            abbreviations.iter().find_map(|abbr| {
                let parts: Vec<&str> = abbr.split(' ').collect();
                tokens[index..]
                    .starts_with(&parts)
                    .then_some((*full, parts.len()))
            })
        });
        match matched {
            Some((full, width)) => {
                out.push(full);
                index += width;
                changed = true;
            }
            None => {
                out.push(tokens[index]);
                index += 1;
            }
        }
    }
    changed.then(|| out.join(" "))
}

fn contract_titles(tokens: &[&str]) -> Option<String> {
    // 長い正式名称から先に当てる
    let mut by_length: Vec<(Vec<&str>, &str)> = TITLES
        .iter()
        .filter_map(|(full, abbreviations)| {
            abbreviations
                .first()
                .map(|abbr| (full.split(' ').collect(), *abbr))
        })
        .collect();
    by_length.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut changed = false;
    let mut out: Vec<&str> = Vec::with_capacity(tokens.len());
    let mut index = 0;
    while index < tokens.len() {
        let matched = by_length
            .iter()
            .find(|(parts, _)| tokens[index..].starts_with(parts));
        match matched {
            Some((parts, abbr)) => {
                out.push(*abbr);
                index += parts.len();
                changed = true;
            }
            None => {
                out.push(tokens[index]);
                index += 1;
            }
        }
    }
    changed.then(|| out.join(" "))
}
