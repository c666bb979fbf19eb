//! Resolution of ambiguous name clusters.
//!
//! A cluster is the primary name plus every secondary variant that cleared the fuzzy
//! threshold. The external text-generation service is asked once per distinct cluster;
//! when it is disabled, unreachable or misbehaving the most frequent variant wins.

use std::cmp::Reverse;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::observability::metrics::Metrics;
use crate::util::error::ErrorKind;
use crate::util::retry::RetryConfig;
use crate::util::text::{
    core_name, formatting_only_difference, has_title_abbreviation, normalize_key, same_name,
};

use super::annotate::{Decision, FallbackReason};
use super::fuzzy::Candidate;
use super::overrides::{OverrideSnapshot, OverrideStore};

/// 応答として受け付ける名前の最大長（文字数）。
pub const MAX_CANONICAL_NAME_CHARS: usize = 120;

/// 正規化サービスに渡す情報。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalizeRequest {
    pub actor_name: String,
    pub series_id: String,
    /// Primary の名前を先頭に、候補をスコア順に並べたもの（重複なし）
    pub variants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonicalizeError {
    #[error("transient service failure: {0}")]
    Transient(String),
    #[error("service rejected the request: {0}")]
    Rejected(String),
    #[error("service unusable for this run: {0}")]
    Fatal(String),
    #[error("invalid service response: {0}")]
    InvalidResponse(String),
}

impl CanonicalizeError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Retryable,
            Self::Rejected(_) | Self::InvalidResponse(_) => ErrorKind::NonRetryable,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    #[must_use]
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Retryable => Self::Transient(message),
            ErrorKind::NonRetryable => Self::Rejected(message),
            ErrorKind::Fatal => Self::Fatal(message),
        }
    }
}

/// 曖昧なクラスタから正規名を 1 つ選ぶ外部サービス。
#[async_trait]
pub trait NameCanonicalizer: Send + Sync {
    /// # Errors
    /// 呼び出しに失敗した場合は種類に応じた [`CanonicalizeError`] を返す。
    async fn canonicalize(&self, request: &CanonicalizeRequest)
    -> Result<String, CanonicalizeError>;
}

/// Fuzzy Matcher が曖昧と判定した名前の集まり。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub actor_id: String,
    pub actor_name: String,
    pub series_id: String,
    pub primary_name: String,
    /// スコア降順の候補
    pub candidates: Vec<Candidate>,
}

impl Cluster {
    /// Primary の名前と候補名（正規化して重複を除いたもの）。
    pub fn names(&self) -> impl Iterator<Item = &str> {
        let mut seen = Vec::new();
        std::iter::once(self.primary_name.as_str())
            .chain(self.candidates.iter().map(|c| c.name.as_str()))
            .filter(move |name| {
                let key = normalize_key(name);
                if seen.contains(&key) {
                    false
                } else {
                    seen.push(key);
                    true
                }
            })
    }

    /// 実行中キャッシュのキー。名前の並び順に依存しない。
    #[must_use]
    pub fn cache_key(&self) -> String {
        let mut names: Vec<String> = self.names().map(normalize_key).collect();
        names.sort_unstable();
        format!("{}|{}", self.actor_id.trim(), names.join("|"))
    }

    /// 出現回数が最大の候補。同数ならスコア順で先のもの。
    #[must_use]
    pub fn most_frequent(&self) -> Option<&Candidate> {
        self.candidates.iter().fold(None, |best, candidate| match best {
            Some(current) if current.count >= candidate.count => Some(current),
            _ => Some(candidate),
        })
    }

    /// 全ての名前が句読点・大文字小文字の違いしかないか。
    #[must_use]
    pub fn is_formatting_only(&self) -> bool {
        let mut names = self.names();
        let Some(first) = names.next() else {
            return false;
        };
        let mut rest = names.peekable();
        rest.peek().is_some() && rest.all(|name| formatting_only_difference(first, name))
    }

    /// 全ての名前が敬称・役職の違いだけなら、代表にする名前を返す。
    ///
    /// 中核の名前が空のもの（敬称だけの名前）は判定から外す。略称の敬称を含む
    /// 名前、大文字始まり、短い名前の順に優先する。
    #[must_use]
    pub fn title_variant(&self) -> Option<&str> {
        let mut cores = Vec::new();
        let names: Vec<&str> = self
            .names()
            .filter(|name| {
                let core = core_name(name);
                if core.is_empty() {
                    return false;
                }
                cores.push(core);
                true
            })
            .collect();
        let (first, rest) = cores.split_first()?;
        if rest.is_empty() || rest.iter().any(|core| core != first) {
            return None;
        }
        names.into_iter().min_by_key(|name| {
            (
                Reverse(has_title_abbreviation(name)),
                Reverse(name.chars().next().is_some_and(char::is_uppercase)),
                name.chars().count(),
            )
        })
    }

    /// Secondary での出現回数。Primary だけの名前は 0。
    #[must_use]
    pub fn occurrences(&self, name: &str) -> usize {
        self.candidates
            .iter()
            .find(|candidate| same_name(&candidate.name, name))
            .map_or(0, |candidate| candidate.count)
    }

    #[must_use]
    pub fn request(&self) -> CanonicalizeRequest {
        CanonicalizeRequest {
            actor_name: self.actor_name.clone(),
            series_id: self.series_id.clone(),
            variants: self.names().map(str::to_string).collect(),
        }
    }
}

/// 1 分あたりのリクエスト数のような「interval あたり N 回」の制限。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: NonZeroU32,
    pub interval: Duration,
}

impl RateLimit {
    fn limiter(self) -> Option<DefaultDirectRateLimiter> {
        let period = self.interval / self.requests.get();
        Quota::with_period(period)
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalizerSettings {
    pub enabled: bool,
    pub timeout: Duration,
    pub retry: RetryConfig,
    pub rate_limit: Option<RateLimit>,
}

impl Default for CanonicalizerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(20),
            retry: RetryConfig::default(),
            rate_limit: Some(RateLimit {
                requests: NonZeroU32::new(60).unwrap_or(NonZeroU32::MIN),
                interval: Duration::from_secs(60),
            }),
        }
    }
}

/// サービス応答を名前として整える。
///
/// 前後の空白と引用符を落とし、1 行目だけを使う。
///
/// # Errors
/// 空、または長すぎる場合は理由を返す。
pub fn clean_response(raw: &str) -> Result<String, String> {
    let first_line = raw.trim().lines().next().unwrap_or_default().trim();
    let unquoted = first_line
        .trim_matches(|c| matches!(c, '"' | '\'' | '`' | '“' | '”' | '‘' | '’'))
        .trim();
    if unquoted.is_empty() {
        return Err("empty answer".to_string());
    }
    let length = unquoted.chars().count();
    if length > MAX_CANONICAL_NAME_CHARS {
        return Err(format!(
            "answer is {length} characters (limit {MAX_CANONICAL_NAME_CHARS})"
        ));
    }
    Ok(unquoted.to_string())
}

/// 曖昧なクラスタを解決するステージ。
pub struct Canonicalizer {
    service: Option<Arc<dyn NameCanonicalizer>>,
    settings: CanonicalizerSettings,
    limiter: Option<DefaultDirectRateLimiter>,
    overrides: Arc<OverrideStore>,
    metrics: Arc<Metrics>,
    cache: Mutex<FxHashMap<String, Arc<OnceCell<Decision>>>>,
    disabled: AtomicBool,
    calls: AtomicUsize,
}

impl std::fmt::Debug for Canonicalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canonicalizer")
            .field("has_service", &self.service.is_some())
            .field("settings", &self.settings)
            .field("disabled", &self.disabled.load(Ordering::Relaxed))
            .field("calls", &self.calls.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Canonicalizer {
    #[must_use]
    pub fn new(
        service: Option<Arc<dyn NameCanonicalizer>>,
        settings: CanonicalizerSettings,
        overrides: Arc<OverrideStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let limiter = settings.rate_limit.and_then(RateLimit::limiter);
        Self {
            service,
            settings,
            limiter,
            overrides,
            metrics,
            cache: Mutex::new(FxHashMap::default()),
            disabled: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// これまでに外部サービスへ送ったリクエスト数（再試行を含む）。
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_service_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// クラスタを解決する。
    ///
    /// オーバーライドに載っている名前があればそれを使う。なければ同じクラスタの
    /// 判定を実行中で 1 回だけ行い、以降は同じ結果を返す。
    pub async fn resolve(&self, cluster: &Cluster, snapshot: &OverrideSnapshot) -> Decision {
        for name in cluster.names() {
            if let Some(canonical) = snapshot.lookup(name, &cluster.actor_id) {
                return Decision::ManualOverride {
                    name: canonical.to_string(),
                    matched: name.to_string(),
                };
            }
        }

        let cell = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cache.entry(cluster.cache_key()).or_default())
        };
        cell.get_or_init(|| self.decide(cluster)).await.clone()
    }

    async fn decide(&self, cluster: &Cluster) -> Decision {
        let Some(fallback) = cluster.most_frequent() else {
            return Decision::Unresolved {
                name: cluster.primary_name.clone(),
                reason: "cluster has no candidates".to_string(),
            };
        };

        if cluster.is_formatting_only() {
            return Decision::FormattingVariant {
                name: fallback.name.clone(),
                count: fallback.count,
            };
        }
        if let Some(name) = cluster.title_variant() {
            return Decision::TitleVariant {
                name: name.to_string(),
                core: core_name(name),
                count: cluster.occurrences(name),
            };
        }

        let service = match (&self.service, self.settings.enabled) {
            (_, false) => return self.fall_back(fallback, FallbackReason::Disabled),
            (None, true) => return self.fall_back(fallback, FallbackReason::MissingCredentials),
            (Some(service), true) => service,
        };
        if self.is_service_disabled() {
            return self.fall_back(fallback, FallbackReason::ServiceDisabled);
        }

        let request = cluster.request();
        match self.call_with_retry(service.as_ref(), &request).await {
            Ok(answer) => match clean_response(&answer) {
                Ok(name) => {
                    self.learn(cluster, &name);
                    Decision::LlmNormalized {
                        name,
                        cluster_size: request.variants.len(),
                    }
                }
                Err(reason) => {
                    warn!(
                        actor_id = %cluster.actor_id,
                        reason = %reason,
                        "rejecting normalization answer"
                    );
                    self.fall_back(fallback, FallbackReason::InvalidResponse(reason))
                }
            },
            Err(error) => {
                if error.kind() == ErrorKind::Fatal {
                    self.disable(&error);
                }
                let reason = match error {
                    CanonicalizeError::InvalidResponse(message) => {
                        FallbackReason::InvalidResponse(message)
                    }
                    other => FallbackReason::ServiceFailed(other.to_string()),
                };
                self.fall_back(fallback, reason)
            }
        }
    }

    fn fall_back(&self, fallback: &Candidate, reason: FallbackReason) -> Decision {
        self.metrics.llm_fallbacks.inc();
        Decision::FuzzyFallback {
            name: fallback.name.clone(),
            count: fallback.count,
            reason,
        }
    }

    /// Primary と異なる正規名が得られたら、俳優スコープでオーバーライドに記録する。
    fn learn(&self, cluster: &Cluster, canonical: &str) {
        if same_name(canonical, &cluster.primary_name) {
            return;
        }
        if self
            .overrides
            .record(&cluster.primary_name, Some(&cluster.actor_id), canonical)
        {
            self.metrics.overrides_learned.inc();
        }
    }

    fn disable(&self, error: &CanonicalizeError) {
        if !self.disabled.swap(true, Ordering::AcqRel) {
            warn!(
                error = %error,
                "disabling llm normalization for the rest of the run"
            );
        }
    }

    async fn call_with_retry(
        &self,
        service: &dyn NameCanonicalizer,
        request: &CanonicalizeRequest,
    ) -> Result<String, CanonicalizeError> {
        let retry = self.settings.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            self.calls.fetch_add(1, Ordering::Relaxed);
            self.metrics.llm_requests.inc();
            let started = Instant::now();
            let result = match tokio::time::timeout(
                self.settings.timeout,
                service.canonicalize(request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(CanonicalizeError::Transient(format!(
                    "timed out after {}ms",
                    self.settings.timeout.as_millis()
                ))),
            };
            self.metrics
                .llm_latency
                .observe(started.elapsed().as_secs_f64());

            match result {
                Ok(answer) => {
                    debug!(attempt, variants = request.variants.len(), "normalization call succeeded");
                    return Ok(answer);
                }
                Err(error)
                    if error.kind() == ErrorKind::Retryable
                        && retry.can_retry(attempt)
                        && !self.is_service_disabled() =>
                {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts = retry.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "normalization call failed; retrying"
                    );
                    self.metrics.llm_retries.inc();
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    self.metrics.llm_failures.inc();
                    info!(attempt, error = %error, "normalization call gave up");
                    return Err(error);
                }
            }
        }
    }
}
