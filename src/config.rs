use std::{env, num::NonZeroUsize, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::pipeline::actor_index::TieBreak;
use crate::util::retry::RetryConfig;
use crate::util::similarity::ScoreCombination;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

const DEFAULT_PLACEHOLDERS: &str = "self,uncredited,unknown,n/a,null,none";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    primary_path: Option<PathBuf>,
    secondary_path: Option<PathBuf>,
    output_path: Option<PathBuf>,
    overrides_path: PathBuf,
    metrics_path: Option<PathBuf>,
    fuzzy_threshold: u8,
    fuzzy_high_confidence: u8,
    fuzzy_competitor_floor: u8,
    fuzzy_combination: ScoreCombination,
    fuzzy_title_variations: bool,
    backfill_majority: f64,
    variant_tie_break: TieBreak,
    placeholder_names: Vec<String>,
    batch_size: NonZeroUsize,
    batch_concurrency: NonZeroUsize,
    llm_enabled: bool,
    llm_base_url: String,
    llm_api_key: Option<String>,
    llm_model: String,
    llm_timeout: Duration,
    llm_rate_limit_requests: NonZeroUsize,
    llm_rate_limit_interval: Duration,
    llm_max_attempts: usize,
    llm_backoff_base_ms: u64,
    llm_backoff_cap_ms: u64,
    otel_exporter_endpoint: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// 環境変数から設定値を読み込み、検証する。
    ///
    /// 入出力パスはバイナリ側で必須チェックするため、ここでは任意扱い。
    ///
    /// # Errors
    /// 数値・真偽値・列挙値のパースに失敗した場合や、値同士の整合性が取れない場合は
    /// [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        let primary_path = optional_path("CAST_PRIMARY_PATH");
        let secondary_path = optional_path("CAST_SECONDARY_PATH");
        let output_path = optional_path("CAST_OUTPUT_PATH");
        let overrides_path = optional_path("CAST_OVERRIDES_PATH")
            .unwrap_or_else(|| PathBuf::from("character_name_mappings.json"));
        let metrics_path = optional_path("CAST_METRICS_PATH");

        // Fuzzy matching
        let fuzzy_threshold = parse_percentage("CAST_FUZZY_THRESHOLD", 80)?;
        let fuzzy_high_confidence = parse_percentage("CAST_FUZZY_HIGH_CONFIDENCE", 95)?;
        if fuzzy_high_confidence < fuzzy_threshold {
            return Err(ConfigError::Invalid {
                name: "CAST_FUZZY_HIGH_CONFIDENCE",
                source: anyhow::anyhow!(
                    "cutoff {fuzzy_high_confidence} is below threshold {fuzzy_threshold}"
                ),
            });
        }
        let fuzzy_competitor_floor = parse_percentage("CAST_FUZZY_COMPETITOR_FLOOR", 80)?;
        let fuzzy_combination = parse_from_str("CAST_FUZZY_COMBINATION", "max")?;
        let fuzzy_title_variations = parse_bool("CAST_FUZZY_TITLE_VARIATIONS", true)?;

        // Backfill
        let backfill_majority = parse_f64("CAST_BACKFILL_MAJORITY", 0.5)?;
        if !(backfill_majority > 0.0 && backfill_majority < 1.0) {
            return Err(ConfigError::Invalid {
                name: "CAST_BACKFILL_MAJORITY",
                source: anyhow::anyhow!("share must be between 0 and 1 exclusive"),
            });
        }
        let variant_tie_break = parse_from_str("CAST_VARIANT_TIE_BREAK", "first-seen")?;
        let placeholder_names = parse_csv("CAST_PLACEHOLDER_NAMES", DEFAULT_PLACEHOLDERS);

        // Batch processing
        let batch_size = parse_non_zero_usize("CAST_BATCH_SIZE", 100)?;
        let batch_concurrency = parse_non_zero_usize("CAST_BATCH_CONCURRENCY", 1)?;

        // LLM normalization
        let llm_enabled = parse_bool("LLM_NORMALIZATION_ENABLED", true)?;
        let llm_base_url =
            env::var("LLM_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1/".to_string());
        let llm_api_key = env::var("LLM_API_KEY")
            .or_else(|_| env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|key| !key.trim().is_empty());
        let llm_model = env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let llm_timeout = parse_duration_ms("LLM_TIMEOUT_MS", 20_000)?;
        let llm_rate_limit_requests = parse_non_zero_usize("LLM_RATE_LIMIT_REQUESTS", 60)?;
        let llm_rate_limit_interval = parse_duration_secs("LLM_RATE_LIMIT_INTERVAL_SECS", 60)?;
        if llm_rate_limit_interval.is_zero() {
            return Err(ConfigError::Invalid {
                name: "LLM_RATE_LIMIT_INTERVAL_SECS",
                source: anyhow::anyhow!("must be greater than zero"),
            });
        }

        // Retry settings (exponential backoff + jitter)
        let llm_max_attempts = parse_non_zero_usize("LLM_MAX_ATTEMPTS", 3)?.get();
        let llm_backoff_base_ms = parse_u64("LLM_BACKOFF_BASE_MS", 250)?;
        let llm_backoff_cap_ms = parse_u64("LLM_BACKOFF_CAP_MS", 10_000)?;

        let otel_exporter_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();

        Ok(Self {
            primary_path,
            secondary_path,
            output_path,
            overrides_path,
            metrics_path,
            fuzzy_threshold,
            fuzzy_high_confidence,
            fuzzy_competitor_floor,
            fuzzy_combination,
            fuzzy_title_variations,
            backfill_majority,
            variant_tie_break,
            placeholder_names,
            batch_size,
            batch_concurrency,
            llm_enabled,
            llm_base_url,
            llm_api_key,
            llm_model,
            llm_timeout,
            llm_rate_limit_requests,
            llm_rate_limit_interval,
            llm_max_attempts,
            llm_backoff_base_ms,
            llm_backoff_cap_ms,
            otel_exporter_endpoint,
        })
    }

    /// 必須パスを取り出す。未設定なら [`ConfigError::Missing`]。
    ///
    /// # Errors
    /// 入出力パスのいずれかが未設定の場合。
    pub fn require_io_paths(&self) -> Result<(PathBuf, PathBuf, PathBuf), ConfigError> {
        let primary = self
            .primary_path
            .clone()
            .ok_or(ConfigError::Missing("CAST_PRIMARY_PATH"))?;
        let secondary = self
            .secondary_path
            .clone()
            .ok_or(ConfigError::Missing("CAST_SECONDARY_PATH"))?;
        let output = self
            .output_path
            .clone()
            .ok_or(ConfigError::Missing("CAST_OUTPUT_PATH"))?;
        Ok((primary, secondary, output))
    }

    #[must_use]
    pub fn overrides_path(&self) -> &std::path::Path {
        &self.overrides_path
    }

    #[must_use]
    pub fn metrics_path(&self) -> Option<&std::path::Path> {
        self.metrics_path.as_deref()
    }

    #[must_use]
    pub fn fuzzy_threshold(&self) -> u8 {
        self.fuzzy_threshold
    }

    #[must_use]
    pub fn fuzzy_high_confidence(&self) -> u8 {
        self.fuzzy_high_confidence
    }

    #[must_use]
    pub fn fuzzy_competitor_floor(&self) -> u8 {
        self.fuzzy_competitor_floor
    }

    #[must_use]
    pub fn fuzzy_combination(&self) -> ScoreCombination {
        self.fuzzy_combination
    }

    #[must_use]
    pub fn fuzzy_title_variations(&self) -> bool {
        self.fuzzy_title_variations
    }

    #[must_use]
    pub fn backfill_majority(&self) -> f64 {
        self.backfill_majority
    }

    #[must_use]
    pub fn variant_tie_break(&self) -> TieBreak {
        self.variant_tie_break
    }

    #[must_use]
    pub fn placeholder_names(&self) -> &[String] {
        &self.placeholder_names
    }

    #[must_use]
    pub fn batch_size(&self) -> NonZeroUsize {
        self.batch_size
    }

    #[must_use]
    pub fn batch_concurrency(&self) -> NonZeroUsize {
        self.batch_concurrency
    }

    #[must_use]
    pub fn llm_enabled(&self) -> bool {
        self.llm_enabled
    }

    #[must_use]
    pub fn llm_base_url(&self) -> &str {
        &self.llm_base_url
    }

    #[must_use]
    pub fn llm_api_key(&self) -> Option<&str> {
        self.llm_api_key.as_deref()
    }

    #[must_use]
    pub fn llm_model(&self) -> &str {
        &self.llm_model
    }

    #[must_use]
    pub fn llm_timeout(&self) -> Duration {
        self.llm_timeout
    }

    #[must_use]
    pub fn llm_rate_limit_requests(&self) -> NonZeroUsize {
        self.llm_rate_limit_requests
    }

    #[must_use]
    pub fn llm_rate_limit_interval(&self) -> Duration {
        self.llm_rate_limit_interval
    }

    #[must_use]
    pub fn llm_retry(&self) -> RetryConfig {
        RetryConfig::new(
            self.llm_max_attempts,
            self.llm_backoff_base_ms,
            self.llm_backoff_cap_ms,
        )
    }

    #[must_use]
    pub fn otel_exporter_endpoint(&self) -> Option<&str> {
        self.otel_exporter_endpoint.as_deref()
    }
}

fn optional_path(name: &'static str) -> Option<PathBuf> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn parse_from_str<T>(name: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = String>,
{
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!(error),
    })
}

fn parse_non_zero_usize(name: &'static str, default: usize) -> Result<NonZeroUsize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let parsed = raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    NonZeroUsize::new(parsed).ok_or_else(|| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!("must be greater than zero"),
    })
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_secs)?;
    Ok(Duration::from_secs(value))
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default_ms.to_string());
    let ms = raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    Ok(Duration::from_millis(ms))
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_percentage(name: &'static str, default: u8) -> Result<u8, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let parsed = raw.parse::<u8>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    if parsed > 100 {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("value must be between 0 and 100"),
        });
    }
    Ok(parsed)
}

fn parse_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<f64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}

fn parse_csv(name: &'static str, default: &str) -> Vec<String> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: &[&str] = &[
        "CAST_PRIMARY_PATH",
        "CAST_SECONDARY_PATH",
        "CAST_OUTPUT_PATH",
        "CAST_OVERRIDES_PATH",
        "CAST_METRICS_PATH",
        "CAST_FUZZY_THRESHOLD",
        "CAST_FUZZY_HIGH_CONFIDENCE",
        "CAST_FUZZY_COMPETITOR_FLOOR",
        "CAST_FUZZY_COMBINATION",
        "CAST_FUZZY_TITLE_VARIATIONS",
        "CAST_BACKFILL_MAJORITY",
        "CAST_VARIANT_TIE_BREAK",
        "CAST_PLACEHOLDER_NAMES",
        "CAST_BATCH_SIZE",
        "CAST_BATCH_CONCURRENCY",
        "LLM_NORMALIZATION_ENABLED",
        "LLM_BASE_URL",
        "LLM_API_KEY",
        "OPENAI_API_KEY",
        "LLM_MODEL",
        "LLM_TIMEOUT_MS",
        "LLM_RATE_LIMIT_REQUESTS",
        "LLM_RATE_LIMIT_INTERVAL_SECS",
        "LLM_MAX_ATTEMPTS",
        "LLM_BACKOFF_BASE_MS",
        "LLM_BACKOFF_CAP_MS",
        "OTEL_EXPORTER_OTLP_ENDPOINT",
    ];

    fn set_env(name: &str, value: &str) {
        // SAFETY: tests run sequentially and assign valid UTF-8 values.
        unsafe {
            env::set_var(name, value);
        }
    }

    fn remove_env(name: &str) {
        // SAFETY: tests run sequentially and clean up deterministic keys.
        unsafe {
            env::remove_var(name);
        }
    }

    fn reset_env() {
        for key in KEYS {
            remove_env(key);
        }
    }

    #[test]
    fn from_env_uses_defaults_when_optional_missing() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();

        let config = Config::from_env().expect("config should load");

        assert_eq!(
            config.overrides_path(),
            std::path::Path::new("character_name_mappings.json")
        );
        assert_eq!(config.metrics_path(), None);
        assert_eq!(config.fuzzy_threshold(), 80);
        assert_eq!(config.fuzzy_high_confidence(), 95);
        assert_eq!(config.fuzzy_competitor_floor(), 80);
        assert_eq!(config.fuzzy_combination(), ScoreCombination::Max);
        assert!(config.fuzzy_title_variations());
        assert!((config.backfill_majority() - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.variant_tie_break(), TieBreak::FirstSeen);
        assert_eq!(
            config.placeholder_names(),
            &["self", "uncredited", "unknown", "n/a", "null", "none"]
        );
        assert_eq!(config.batch_size().get(), 100);
        assert_eq!(config.batch_concurrency().get(), 1);
        assert!(config.llm_enabled());
        assert_eq!(config.llm_base_url(), "https://api.openai.com/v1/");
        assert_eq!(config.llm_api_key(), None);
        assert_eq!(config.llm_model(), "gpt-4o-mini");
        assert_eq!(config.llm_timeout(), Duration::from_secs(20));
        assert_eq!(config.llm_rate_limit_requests().get(), 60);
        assert_eq!(config.llm_rate_limit_interval(), Duration::from_secs(60));
        assert_eq!(config.llm_retry(), RetryConfig::new(3, 250, 10_000));
        assert!(config.require_io_paths().is_err());
    }

    #[test]
    fn from_env_overrides_values() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();
        set_env("CAST_PRIMARY_PATH", "/data/imdb.json");
        set_env("CAST_SECONDARY_PATH", "/data/tmdb.json");
        set_env("CAST_OUTPUT_PATH", "/data/out.json");
        set_env("CAST_METRICS_PATH", "/data/metrics.prom");
        set_env("CAST_FUZZY_THRESHOLD", "70");
        set_env("CAST_FUZZY_HIGH_CONFIDENCE", "90");
        set_env("CAST_FUZZY_COMBINATION", "mean");
        set_env("CAST_VARIANT_TIE_BREAK", "lexicographic");
        set_env("CAST_PLACEHOLDER_NAMES", "self, himself ,herself");
        set_env("CAST_BATCH_SIZE", "25");
        set_env("CAST_BATCH_CONCURRENCY", "4");
        set_env("LLM_NORMALIZATION_ENABLED", "off");
        set_env("OPENAI_API_KEY", "sk-test");
        set_env("LLM_MAX_ATTEMPTS", "5");
        set_env("OTEL_EXPORTER_OTLP_ENDPOINT", "http://otel:4317");

        let config = Config::from_env().expect("config should load");

        let (primary, secondary, output) = config.require_io_paths().expect("paths set");
        assert_eq!(primary, PathBuf::from("/data/imdb.json"));
        assert_eq!(secondary, PathBuf::from("/data/tmdb.json"));
        assert_eq!(output, PathBuf::from("/data/out.json"));
        assert_eq!(
            config.metrics_path(),
            Some(std::path::Path::new("/data/metrics.prom"))
        );
        assert_eq!(config.fuzzy_threshold(), 70);
        assert_eq!(config.fuzzy_high_confidence(), 90);
        assert_eq!(config.fuzzy_combination(), ScoreCombination::Mean);
        assert_eq!(config.variant_tie_break(), TieBreak::Lexicographic);
        assert_eq!(config.placeholder_names(), &["self", "himself", "herself"]);
        assert_eq!(config.batch_size().get(), 25);
        assert_eq!(config.batch_concurrency().get(), 4);
        assert!(!config.llm_enabled());
        assert_eq!(config.llm_api_key(), Some("sk-test"));
        assert_eq!(config.llm_retry().max_attempts, 5);
        assert_eq!(config.otel_exporter_endpoint(), Some("http://otel:4317"));
        reset_env();
    }

    #[test]
    fn from_env_rejects_cutoff_below_threshold() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();
        set_env("CAST_FUZZY_THRESHOLD", "90");
        set_env("CAST_FUZZY_HIGH_CONFIDENCE", "85");

        let error = Config::from_env().expect_err("cutoff below threshold should fail");

        assert!(matches!(
            error,
            ConfigError::Invalid {
                name: "CAST_FUZZY_HIGH_CONFIDENCE",
                ..
            }
        ));
        reset_env();
    }

    #[test]
    fn from_env_rejects_out_of_range_values() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();
        set_env("CAST_FUZZY_THRESHOLD", "101");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "CAST_FUZZY_THRESHOLD",
                ..
            })
        ));

        reset_env();
        set_env("CAST_BATCH_SIZE", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "CAST_BATCH_SIZE",
                ..
            })
        ));

        reset_env();
        set_env("CAST_BACKFILL_MAJORITY", "1.5");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "CAST_BACKFILL_MAJORITY",
                ..
            })
        ));

        reset_env();
        set_env("CAST_VARIANT_TIE_BREAK", "random");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "CAST_VARIANT_TIE_BREAK",
                ..
            })
        ));
        reset_env();
    }

    #[test]
    fn require_io_paths_reports_first_missing() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();
        set_env("CAST_PRIMARY_PATH", "/data/imdb.json");

        let config = Config::from_env().expect("config should load");
        let error = config.require_io_paths().expect_err("secondary missing");

        assert!(matches!(error, ConfigError::Missing("CAST_SECONDARY_PATH")));
        reset_env();
    }
}
