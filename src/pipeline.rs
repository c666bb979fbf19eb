use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use crate::config::Config;
use crate::observability::metrics::Metrics;
use crate::util::text::PlaceholderNames;

pub mod actor_index;
pub mod annotate;
pub mod backfill;
pub mod canonicalize;
pub mod fuzzy;
pub mod orchestrator;
pub mod overrides;

use actor_index::TieBreak;
use backfill::BackfillResolver;
use canonicalize::{CanonicalizerSettings, NameCanonicalizer, RateLimit};
use fuzzy::{FuzzyMatcher, FuzzySettings};
use orchestrator::{LoggingObserver, PipelineOrchestrator, ProgressObserver};
use overrides::OverrideStore;

pub use orchestrator::{BatchEvent, FlushStatus, RunOutcome, SkippedRecord};

/// パイプライン全体の調整値。
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub fuzzy: FuzzySettings,
    pub backfill_majority: f64,
    pub tie_break: TieBreak,
    pub placeholders: PlaceholderNames,
    pub batch_size: NonZeroUsize,
    pub batch_concurrency: NonZeroUsize,
    pub canonicalizer: CanonicalizerSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fuzzy: FuzzySettings::default(),
            backfill_majority: 0.5,
            tie_break: TieBreak::default(),
            placeholders: PlaceholderNames::default(),
            batch_size: NonZeroUsize::new(100).unwrap_or(NonZeroUsize::MIN),
            batch_concurrency: NonZeroUsize::MIN,
            canonicalizer: CanonicalizerSettings::default(),
        }
    }
}

impl PipelineSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let requests = u32::try_from(config.llm_rate_limit_requests().get())
            .ok()
            .and_then(NonZeroU32::new)
            .unwrap_or(NonZeroU32::MAX);

        Self {
            fuzzy: FuzzySettings {
                threshold: config.fuzzy_threshold(),
                high_confidence: config.fuzzy_high_confidence(),
                competitor_floor: config.fuzzy_competitor_floor(),
                combination: config.fuzzy_combination(),
                title_variations: config.fuzzy_title_variations(),
            },
            backfill_majority: config.backfill_majority(),
            tie_break: config.variant_tie_break(),
            placeholders: PlaceholderNames::new(config.placeholder_names()),
            batch_size: config.batch_size(),
            batch_concurrency: config.batch_concurrency(),
            canonicalizer: CanonicalizerSettings {
                enabled: config.llm_enabled(),
                timeout: config.llm_timeout(),
                retry: config.llm_retry(),
                rate_limit: Some(RateLimit {
                    requests,
                    interval: config.llm_rate_limit_interval(),
                }),
            },
        }
    }
}

/// Builder pattern for constructing [`PipelineOrchestrator`].
pub struct PipelineBuilder {
    settings: PipelineSettings,
    overrides: Option<Arc<OverrideStore>>,
    service: Option<Arc<dyn NameCanonicalizer>>,
    metrics: Option<Arc<Metrics>>,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            overrides: None,
            service: None,
            metrics: None,
            observer: None,
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, store: Arc<OverrideStore>) -> Self {
        self.overrides = Some(store);
        self
    }

    /// 曖昧クラスタの正規化に使うサービス。未設定なら常にヒューリスティックで解決する。
    #[must_use]
    pub fn with_canonicalizer_service(mut self, service: Arc<dyn NameCanonicalizer>) -> Self {
        self.service = Some(service);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// # Errors
    /// オーバーライドストアが未設定の場合、またはメトリクスの登録に失敗した場合。
    pub fn build(self) -> Result<PipelineOrchestrator> {
        let overrides = self
            .overrides
            .ok_or_else(|| anyhow!("override store must be configured before build"))?;
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => {
                Metrics::standalone()
                    .context("failed to register pipeline metrics")?
                    .1
            }
        };
        let observer = self
            .observer
            .unwrap_or_else(|| Arc::new(LoggingObserver));

        Ok(PipelineOrchestrator {
            backfill: BackfillResolver::new(
                self.settings.placeholders.clone(),
                self.settings.backfill_majority,
            ),
            matcher: FuzzyMatcher::new(self.settings.fuzzy),
            service: self.service,
            overrides,
            metrics,
            observer,
            settings: self.settings,
        })
    }
}
