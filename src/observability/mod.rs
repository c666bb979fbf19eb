pub mod metrics;
pub mod tracing;

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Encoder, Registry, TextEncoder};

use self::metrics::Metrics;

/// Telemetry（メトリクスとトレーシング）を管理する構造体。
#[derive(Debug, Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Telemetry {
    /// トレーシングを初期化し、実行用のメトリクスを登録する。
    ///
    /// `otel_endpoint` があればスパンを OTLP でも送る。
    ///
    /// # Errors
    /// サブスクライバの初期化、またはメトリクス登録に失敗した場合。
    pub fn new(otel_endpoint: Option<&str>) -> Result<Self> {
        tracing::init(otel_endpoint)?;
        Self::metrics_only()
    }

    /// トレーシングに触れずにメトリクスだけを用意する。
    ///
    /// # Errors
    /// メトリクス登録に失敗した場合。
    pub fn metrics_only() -> Result<Self> {
        let (registry, metrics) =
            Metrics::standalone().context("failed to register cast-resolver metrics")?;
        Ok(Self { registry, metrics })
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Prometheus テキスト形式でレンダリングする。
    ///
    /// # Errors
    /// エンコードに失敗した場合。
    pub fn render_prometheus(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics output is not UTF-8")
    }
}
