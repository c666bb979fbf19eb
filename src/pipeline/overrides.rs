//! Persisted manual override table (raw character name → canonical name).
//!
//! Keys may be scoped to one actor as `"raw name::actorId"`. Lookups normalise the
//! raw name first, so `"  officer FIDEL "` hits an entry written as `"Officer Fidel"`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::util::text::normalize_key;

const SCOPE_SEPARATOR: &str = "::";

#[derive(Debug, Error)]
pub enum OverrideStoreError {
    #[error("failed to read override file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("override file {} is not a JSON object of strings: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize override table: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write override file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to replace override file {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
}

/// `flush` の結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// 全エントリを書き出した。
    Persisted(usize),
    /// 前回のロード以降に変更がなかった。
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    /// ファイルに書かれていた（または最初に記録された）キーの表記
    written_key: String,
    canonical: String,
}

type Table = BTreeMap<String, Entry>;

fn lookup_key(raw_name: &str, actor_id: Option<&str>) -> String {
    let name = normalize_key(raw_name);
    match actor_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(actor) => format!("{name}{SCOPE_SEPARATOR}{actor}"),
        None => name,
    }
}

fn written_key(raw_name: &str, actor_id: Option<&str>) -> String {
    let name = raw_name.trim();
    match actor_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(actor) => format!("{name}{SCOPE_SEPARATOR}{actor}"),
        None => name.to_string(),
    }
}

/// 永続化キー `"raw::actor"` を (raw, actor) に分解する。最後の区切りで分ける。
fn split_scoped(key: &str) -> (&str, Option<&str>) {
    match key.rsplit_once(SCOPE_SEPARATOR) {
        Some((raw, actor)) if !raw.trim().is_empty() && !actor.trim().is_empty() => {
            (raw, Some(actor))
        }
        _ => (key, None),
    }
}

/// 実行開始時点のオーバーライド表。安価に clone できる読み取り専用ビュー。
#[derive(Debug, Clone, Default)]
pub struct OverrideSnapshot {
    table: Arc<Table>,
}

impl OverrideSnapshot {
    /// 俳優スコープのエントリを優先し、なければ俳優非依存のエントリを返す。
    #[must_use]
    pub fn lookup(&self, raw_name: &str, actor_id: &str) -> Option<&str> {
        if normalize_key(raw_name).is_empty() {
            return None;
        }
        self.table
            .get(&lookup_key(raw_name, Some(actor_id)))
            .or_else(|| self.table.get(&lookup_key(raw_name, None)))
            .map(|entry| entry.canonical.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[derive(Debug)]
struct StoreState {
    table: Arc<Table>,
    dirty: bool,
}

/// オーバーライド表のストア。
///
/// 読み取りは [`OverrideSnapshot`] を通し、書き込みは内部の Mutex で直列化する。
#[derive(Debug)]
pub struct OverrideStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl OverrideStore {
    /// 空のストアを作る。`flush` 時に `path` へ書き出す。
    #[must_use]
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(StoreState {
                table: Arc::new(Table::new()),
                dirty: false,
            }),
        }
    }

    /// ファイルから読み込む。ファイルが存在しなければ空のストアになる。
    ///
    /// # Errors
    /// 読み込みに失敗した場合、または内容が文字列→文字列の JSON オブジェクトでない場合。
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, OverrideStoreError> {
        let path = path.into();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "override file not found; starting empty");
                return Ok(Self::empty(path));
            }
            Err(source) => return Err(OverrideStoreError::Read { path, source }),
        };

        let entries: BTreeMap<String, String> = if raw.trim().is_empty() {
            BTreeMap::new()
        } else {
            match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(source) => return Err(OverrideStoreError::Parse { path, source }),
            }
        };

        let mut table = Table::new();
        for (key, canonical) in entries {
            let (raw_name, actor) = split_scoped(&key);
            let normalized = lookup_key(raw_name, actor);
            if normalized.is_empty() || canonical.trim().is_empty() {
                warn!(key = %key, "skipping blank override entry");
                continue;
            }
            let entry = Entry {
                written_key: key.clone(),
                canonical: canonical.trim().to_string(),
            };
            if let Some(previous) = table.insert(normalized, entry) {
                warn!(
                    key = %key,
                    previous_key = %previous.written_key,
                    "override file has keys that differ only in case or spacing; last entry wins"
                );
            }
        }

        info!(path = %path.display(), entries = table.len(), "loaded override table");
        Ok(Self {
            path,
            state: Mutex::new(StoreState {
                table: Arc::new(table),
                dirty: false,
            }),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 現在の表のスナップショット。
    #[must_use]
    pub fn snapshot(&self) -> OverrideSnapshot {
        OverrideSnapshot {
            table: Arc::clone(&self.lock().table),
        }
    }

    /// 現在の表から直接引く。実行中の判定には [`Self::snapshot`] を使うこと。
    #[must_use]
    pub fn lookup(&self, raw_name: &str, actor_id: &str) -> Option<String> {
        self.snapshot()
            .lookup(raw_name, actor_id)
            .map(str::to_string)
    }

    /// エントリを追加・更新する。
    ///
    /// 既存エントリと異なる値で上書きする場合は警告を出し、後勝ちとする。
    /// 変更があれば `true`。
    pub fn record(&self, raw_name: &str, actor_id: Option<&str>, canonical: &str) -> bool {
        let canonical = canonical.trim();
        if normalize_key(raw_name).is_empty() || canonical.is_empty() {
            return false;
        }
        let key = lookup_key(raw_name, actor_id);

        let mut state = self.lock();
        if let Some(existing) = state.table.get(&key) {
            if existing.canonical == canonical {
                return false;
            }
            warn!(
                key = %existing.written_key,
                previous = %existing.canonical,
                replacement = %canonical,
                "override collision; last write wins"
            );
        }

        let display_key = state
            .table
            .get(&key)
            .map_or_else(|| written_key(raw_name, actor_id), |e| e.written_key.clone());
        Arc::make_mut(&mut state.table).insert(
            key,
            Entry {
                written_key: display_key,
                canonical: canonical.to_string(),
            },
        );
        state.dirty = true;
        debug!(raw_name, actor_id, canonical, "recorded override");
        true
    }

    /// 永続化形式 (表記どおりのキー → 正規名) の一覧。
    #[must_use]
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.lock()
            .table
            .values()
            .map(|entry| (entry.written_key.clone(), entry.canonical.clone()))
            .collect()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// 変更があればファイル全体をアトミックに書き換える。
    ///
    /// 同じディレクトリの一時ファイルに書いて fsync した後 rename するので、
    /// ファイルは常に旧内容か新内容のどちらか。
    ///
    /// # Errors
    /// シリアライズ・書き込み・置き換えのいずれかに失敗した場合。旧ファイルは残る。
    pub fn flush(&self) -> Result<FlushOutcome, OverrideStoreError> {
        let mut state = self.lock();
        if !state.dirty {
            debug!(path = %self.path.display(), "override table unchanged; skipping flush");
            return Ok(FlushOutcome::Unchanged);
        }

        let entries: BTreeMap<&str, &str> = state
            .table
            .values()
            .map(|entry| (entry.written_key.as_str(), entry.canonical.as_str()))
            .collect();
        let mut body = serde_json::to_string_pretty(&entries).map_err(OverrideStoreError::Serialize)?;
        body.push('\n');

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let write_error = |source| OverrideStoreError::Write {
            path: self.path.clone(),
            source,
        };
        let mut tmp = NamedTempFile::new_in(&dir).map_err(write_error)?;
        tmp.write_all(body.as_bytes()).map_err(write_error)?;
        tmp.as_file().sync_all().map_err(write_error)?;
        tmp.persist(&self.path)
            .map_err(|source| OverrideStoreError::Persist {
                path: self.path.clone(),
                source,
            })?;

        let count = entries.len();
        drop(entries);
        state.dirty = false;
        info!(path = %self.path.display(), entries = count, "persisted override table");
        Ok(FlushOutcome::Persisted(count))
    }
}
