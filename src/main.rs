use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cast_resolver::{
    clients::ChatCompletionsClient,
    config::Config,
    dataset::{load_records, write_atomic, write_json},
    model::SourceTag,
    observability::{self, Telemetry},
    pipeline::{FlushStatus, PipelineBuilder, PipelineSettings, overrides::OverrideStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(String::as_str)
            })
            .unwrap_or("unknown panic payload");

        if let Some(location) = panic_info.location() {
            error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                column = location.column(),
                message,
                "panic occurred"
            );
        } else {
            error!(
                thread = thread_name,
                message, "panic occurred without location information"
            );
        }
    }));

    let config = Config::from_env().context("failed to load configuration")?;
    let telemetry = Telemetry::new(config.otel_exporter_endpoint())
        .context("failed to initialize telemetry")?;
    let result = run(&config, &telemetry).await;
    if let Err(error) = &result {
        error!(error = %format!("{error:#}"), "cast-resolver failed");
    }
    observability::tracing::shutdown();
    result
}

async fn run(config: &Config, telemetry: &Telemetry) -> Result<()> {
    let (primary_path, secondary_path, output_path) = config.require_io_paths()?;

    let primary = load_records(&primary_path, SourceTag::Primary)?;
    let secondary = load_records(&secondary_path, SourceTag::Secondary)?;
    let overrides = Arc::new(
        OverrideStore::load(config.overrides_path()).context("failed to load override table")?,
    );

    let mut builder = PipelineBuilder::new(PipelineSettings::from_config(config))
        .with_overrides(overrides)
        .with_metrics(telemetry.metrics());
    match (config.llm_enabled(), config.llm_api_key()) {
        (false, _) => {
            info!("llm normalization disabled; ambiguous clusters use the most frequent variant");
        }
        (true, None) => warn!(
            "no LLM_API_KEY or OPENAI_API_KEY set; ambiguous clusters use the most frequent variant"
        ),
        (true, Some(api_key)) => {
            let client = ChatCompletionsClient::new(
                config.llm_base_url(),
                api_key,
                config.llm_model(),
                config.llm_timeout(),
            )?;
            info!(
                model = client.model(),
                base_url = config.llm_base_url(),
                "llm normalization enabled"
            );
            builder = builder.with_canonicalizer_service(Arc::new(client));
        }
    }
    let pipeline = builder.build()?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current batch");
            signal_token.cancel();
        }
    });

    let outcome = pipeline.run(&primary, &secondary, &cancel).await;

    write_json(&output_path, &outcome.records)?;
    info!(
        run_id = %outcome.run_id,
        path = %output_path.display(),
        records = outcome.records.len(),
        skipped = outcome.skipped.len(),
        cancelled = outcome.cancelled,
        "wrote resolved records"
    );

    if let Some(path) = config.metrics_path() {
        let text = telemetry.render_prometheus()?;
        write_atomic(path, text.as_bytes())?;
    }

    match outcome.flush {
        FlushStatus::Failed(error) => {
            Err(anyhow::Error::new(error).context("override table was not persisted"))
        }
        FlushStatus::Persisted(_) | FlushStatus::Unchanged => Ok(()),
    }
}
