//! JSON record files read and written by the batch binary.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::model::{CastRecord, SourceTag};

/// JSON 配列のレコードを読み込み、出所タグを付け直す。
///
/// 行単位で解釈し、レコードとして読めない行は警告を出して読み飛ばす。
///
/// # Errors
/// ファイルが読めない場合、または JSON 配列でない場合。
pub fn load_records(path: &Path, source: SourceTag) -> Result<Vec<CastRecord>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read records from {}", path.display()))?;
    let rows: Vec<Value> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of cast records", path.display()))?;

    let total = rows.len();
    let mut records = Vec::with_capacity(total);
    for (row, value) in rows.into_iter().enumerate() {
        match serde_json::from_value::<CastRecord>(value) {
            Ok(mut record) => {
                record.source = source;
                records.push(record);
            }
            Err(error) => warn!(
                path = %path.display(),
                row,
                error = %error,
                "skipping malformed record"
            ),
        }
    }
    info!(
        path = %path.display(),
        records = records.len(),
        malformed = total - records.len(),
        ?source,
        "loaded records"
    );
    Ok(records)
}

/// 一時ファイル経由で JSON 配列としてアトミックに書き出す。
///
/// # Errors
/// シリアライズ・書き込み・置き換えのいずれかに失敗した場合。
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_vec_pretty(value).context("failed to serialize output")?;
    body.push(b'\n');
    write_atomic(path, &body)
}

/// 同じディレクトリの一時ファイルに書いてから置き換える。
///
/// # Errors
/// 一時ファイルの作成・書き込み・置き換えに失敗した場合。
pub fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = NamedTempFile::new_in(&dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(body)
        .with_context(|| format!("failed to write {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
