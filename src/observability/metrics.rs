//! Prometheusメトリクス定義。
use std::sync::Arc;

use prometheus::{
    Counter, CounterVec, Histogram, Registry, histogram_opts, opts,
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_with_registry,
};

use crate::model::{ConfidenceTier, DecisionSource};

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    pub records_resolved: CounterVec,
    pub records_by_tier: CounterVec,
    pub records_skipped: Counter,
    pub batches_completed: Counter,
    pub llm_requests: Counter,
    pub llm_retries: Counter,
    pub llm_failures: Counter,
    pub llm_fallbacks: Counter,
    pub overrides_learned: Counter,

    // ヒストグラム
    pub batch_duration: Histogram,
    pub llm_latency: Histogram,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成する。
    ///
    /// # Errors
    /// 同名のメトリクスが既に登録されている場合。
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            records_resolved: register_counter_vec_with_registry!(
                opts!(
                    "cast_records_resolved_total",
                    "Resolved records by deciding stage"
                ),
                &["source"],
                registry
            )?,
            records_by_tier: register_counter_vec_with_registry!(
                opts!(
                    "cast_records_confidence_total",
                    "Resolved records by confidence tier"
                ),
                &["tier"],
                registry
            )?,
            records_skipped: register_counter_with_registry!(
                "cast_records_skipped_total",
                "Input records skipped because of missing identifiers",
                registry
            )?,
            batches_completed: register_counter_with_registry!(
                "cast_batches_completed_total",
                "Number of batches fully resolved",
                registry
            )?,
            llm_requests: register_counter_with_registry!(
                "cast_llm_requests_total",
                "Requests sent to the name normalization service",
                registry
            )?,
            llm_retries: register_counter_with_registry!(
                "cast_llm_retries_total",
                "Retries after transient normalization failures",
                registry
            )?,
            llm_failures: register_counter_with_registry!(
                "cast_llm_failures_total",
                "Clusters whose normalization call ultimately failed",
                registry
            )?,
            llm_fallbacks: register_counter_with_registry!(
                "cast_llm_fallbacks_total",
                "Clusters resolved by the most-frequent-variant fallback",
                registry
            )?,
            overrides_learned: register_counter_with_registry!(
                "cast_overrides_learned_total",
                "Override entries recorded during the run",
                registry
            )?,
            batch_duration: register_histogram_with_registry!(
                histogram_opts!(
                    "cast_batch_duration_seconds",
                    "Duration of one batch resolution"
                ),
                registry
            )?,
            llm_latency: register_histogram_with_registry!(
                histogram_opts!(
                    "cast_llm_latency_seconds",
                    "Latency of a single normalization call",
                    vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0]
                ),
                registry
            )?,
        })
    }

    /// 専用レジストリ付きで作成する（テスト・ライブラリ利用向け）。
    ///
    /// # Errors
    /// メトリクス登録に失敗した場合。
    pub fn standalone() -> Result<(Arc<Registry>, Arc<Self>), prometheus::Error> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Self::new(&registry)?);
        Ok((registry, metrics))
    }

    pub fn record_outcome(&self, source: DecisionSource, tier: ConfidenceTier) {
        self.records_resolved
            .with_label_values(&[source.as_str()])
            .inc();
        self.records_by_tier.with_label_values(&[tier.as_str()]).inc();
    }
}
