//! 外部サービス呼び出しのエラー分類。
use anyhow::Error;
use reqwest::StatusCode;

/// エラーの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// リトライ可能なエラー（タイムアウト、429、5xx など）
    Retryable,
    /// このリクエストに限って失敗（リクエスト内容の不備、不正な応答など）
    NonRetryable,
    /// 実行全体で外部呼び出しを止めるべきエラー（認証・設定エラー）
    Fatal,
}

/// HTTPステータスを分類する。
#[must_use]
pub fn classify_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => ErrorKind::Retryable,
        s if s.is_server_error() => ErrorKind::Retryable,
        // 認証・認可、エンドポイント/モデル不在は設定の問題
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            ErrorKind::Fatal
        }
        _ => ErrorKind::NonRetryable,
    }
}

/// `anyhow::Error` の中身を見て分類する。
#[must_use]
pub fn classify_error(error: &Error) -> ErrorKind {
    if let Some(reqwest_err) = error.downcast_ref::<reqwest::Error>() {
        if reqwest_err.is_timeout() || reqwest_err.is_connect() {
            return ErrorKind::Retryable;
        }
        if let Some(status) = reqwest_err.status() {
            return classify_status(status);
        }
        if reqwest_err.is_builder() {
            return ErrorKind::Fatal;
        }
        if reqwest_err.is_request() || reqwest_err.is_body() {
            return ErrorKind::Retryable;
        }
    }

    ErrorKind::NonRetryable
}
