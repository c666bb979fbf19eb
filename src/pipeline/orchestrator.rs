//! Pipeline orchestrator: batches primary records through backfill, fuzzy matching,
//! canonicalization and annotation, then flushes the override store once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{StreamExt, future, stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::model::{CastRecord, ConfidenceTier, DecisionSource, RecordDefect, ResolvedRecord};
use crate::observability::metrics::Metrics;

use super::PipelineSettings;
use super::actor_index::ActorIndex;
use super::annotate::{Decision, annotate};
use super::backfill::{BackfillOutcome, BackfillResolver};
use super::canonicalize::{Canonicalizer, Cluster, NameCanonicalizer};
use super::fuzzy::{FuzzyMatcher, FuzzyVerdict};
use super::overrides::{FlushOutcome, OverrideSnapshot, OverrideStore, OverrideStoreError};

/// 入力の欠陥でスキップしたレコード。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    /// Primary 入力内の位置
    pub index: usize,
    pub defect: RecordDefect,
}

/// 1 バッチ分の処理結果。
#[derive(Debug, Clone)]
pub struct BatchEvent {
    pub index: usize,
    pub total_batches: usize,
    pub resolved: usize,
    pub skipped: usize,
    pub elapsed: Duration,
    pub sources: BTreeMap<DecisionSource, usize>,
}

/// バッチ完了の通知を受け取る。
pub trait ProgressObserver: Send + Sync {
    fn on_batch(&self, event: &BatchEvent);
}

/// `tracing` にバッチの進捗を出すデフォルトのオブザーバー。
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ProgressObserver for LoggingObserver {
    fn on_batch(&self, event: &BatchEvent) {
        let sources = event
            .sources
            .iter()
            .map(|(source, count)| format!("{source}={count}"))
            .collect::<Vec<_>>()
            .join(",");
        info!(
            batch = event.index + 1,
            total_batches = event.total_batches,
            resolved = event.resolved,
            skipped = event.skipped,
            elapsed_ms = u64::try_from(event.elapsed.as_millis()).unwrap_or(u64::MAX),
            sources = %sources,
            "batch completed"
        );
    }
}

/// 実行終了時のオーバーライド表の書き出し結果。
#[derive(Debug)]
pub enum FlushStatus {
    Persisted(usize),
    Unchanged,
    Failed(OverrideStoreError),
}

impl FlushStatus {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// 1 回の実行の結果。
#[derive(Debug)]
pub struct RunOutcome {
    /// ログと突き合わせるための実行 ID
    pub run_id: Uuid,
    /// 入力順の解決済みレコード（スキップ分を除く）
    pub records: Vec<ResolvedRecord>,
    pub skipped: Vec<SkippedRecord>,
    pub by_source: BTreeMap<DecisionSource, usize>,
    pub by_tier: BTreeMap<ConfidenceTier, usize>,
    /// 完了したバッチ数
    pub batches: usize,
    /// 停止要求により途中で終わったか
    pub cancelled: bool,
    /// 外部サービスへのリクエスト数（再試行を含む）
    pub llm_calls: usize,
    pub flush: FlushStatus,
}

struct BatchResult {
    index: usize,
    records: Vec<ResolvedRecord>,
    skipped: Vec<SkippedRecord>,
    elapsed: Duration,
}

/// 1 回の実行で共有する読み取り専用の状態。
struct RunContext {
    index: ActorIndex,
    snapshot: OverrideSnapshot,
    canonicalizer: Canonicalizer,
}

/// 名前解決パイプライン。[`super::PipelineBuilder`] で組み立てる。
pub struct PipelineOrchestrator {
    pub(super) settings: PipelineSettings,
    pub(super) backfill: BackfillResolver,
    pub(super) matcher: FuzzyMatcher,
    pub(super) service: Option<Arc<dyn NameCanonicalizer>>,
    pub(super) overrides: Arc<OverrideStore>,
    pub(super) metrics: Arc<Metrics>,
    pub(super) observer: Arc<dyn ProgressObserver>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("settings", &self.settings)
            .field("has_service", &self.service.is_some())
            .field("overrides", &self.overrides.path())
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    #[must_use]
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    #[must_use]
    pub fn overrides(&self) -> &Arc<OverrideStore> {
        &self.overrides
    }

    /// Primary レコード全体を解決する。
    ///
    /// `cancel` が発火すると実行中のバッチを終えた時点で止まる。オーバーライド表は
    /// 停止時も含めて最後に 1 回だけ書き出す。
    pub async fn run(
        &self,
        primary: &[CastRecord],
        secondary: &[CastRecord],
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let context = RunContext {
            index: ActorIndex::build(
                secondary,
                self.backfill.placeholders(),
                self.settings.tie_break,
            ),
            snapshot: self.overrides.snapshot(),
            canonicalizer: Canonicalizer::new(
                self.service.clone(),
                self.settings.canonicalizer.clone(),
                Arc::clone(&self.overrides),
                Arc::clone(&self.metrics),
            ),
        };

        let batch_size = self.settings.batch_size.get();
        let total_batches = primary.len().div_ceil(batch_size);
        info!(
            %run_id,
            primary = primary.len(),
            secondary = secondary.len(),
            actors = context.index.actor_count(),
            overrides = context.snapshot.len(),
            batch_size,
            concurrency = self.settings.batch_concurrency.get(),
            total_batches,
            "starting cast name resolution"
        );

        let context = &context;
        let mut batches = stream::iter(primary.chunks(batch_size).enumerate())
            .take_while(|_| future::ready(!cancel.is_cancelled()))
            .map(|(index, chunk)| self.process_batch(context, index, index * batch_size, chunk))
            .buffered(self.settings.batch_concurrency.get());

        let mut records = Vec::with_capacity(primary.len());
        let mut skipped = Vec::new();
        let mut by_source = BTreeMap::new();
        let mut by_tier = BTreeMap::new();
        let mut completed = 0;

        while let Some(batch) = batches.next().await {
            let mut sources = BTreeMap::new();
            for record in &batch.records {
                *sources.entry(record.source()).or_insert(0) += 1;
                *by_tier.entry(record.confidence()).or_insert(0) += 1;
            }
            for (source, count) in &sources {
                *by_source.entry(*source).or_insert(0) += count;
            }

            let event = BatchEvent {
                index: batch.index,
                total_batches,
                resolved: batch.records.len(),
                skipped: batch.skipped.len(),
                elapsed: batch.elapsed,
                sources,
            };
            self.metrics.batches_completed.inc();
            self.metrics
                .batch_duration
                .observe(batch.elapsed.as_secs_f64());
            self.observer.on_batch(&event);

            records.extend(batch.records);
            skipped.extend(batch.skipped);
            completed += 1;
        }
        drop(batches);

        let cancelled = completed < total_batches;
        if cancelled {
            warn!(
                %run_id,
                completed,
                total_batches,
                "run cancelled; remaining batches were not processed"
            );
        }

        let flush = match self.overrides.flush() {
            Ok(FlushOutcome::Persisted(count)) => FlushStatus::Persisted(count),
            Ok(FlushOutcome::Unchanged) => FlushStatus::Unchanged,
            Err(err) => {
                error!(%run_id, error = %err, "failed to persist override table");
                FlushStatus::Failed(err)
            }
        };

        let llm_calls = context.canonicalizer.calls();
        info!(
            %run_id,
            resolved = records.len(),
            skipped = skipped.len(),
            batches = completed,
            llm_calls,
            cancelled,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "cast name resolution finished"
        );

        RunOutcome {
            run_id,
            records,
            skipped,
            by_source,
            by_tier,
            batches: completed,
            cancelled,
            llm_calls,
            flush,
        }
    }

    #[instrument(skip_all, fields(batch = index, records = chunk.len()))]
    async fn process_batch(
        &self,
        context: &RunContext,
        index: usize,
        offset: usize,
        chunk: &[CastRecord],
    ) -> BatchResult {
        let started = Instant::now();
        let mut records = Vec::with_capacity(chunk.len());
        let mut skipped = Vec::new();

        for (position, record) in chunk.iter().enumerate() {
            if let Err(defect) = record.validate_primary() {
                warn!(
                    index = offset + position,
                    actor_id = %record.actor_id,
                    episode_id = %record.episode_id,
                    defect = %defect,
                    "skipping malformed primary record"
                );
                self.metrics.records_skipped.inc();
                skipped.push(SkippedRecord {
                    index: offset + position,
                    defect,
                });
                continue;
            }

            let decision = self.resolve_record(context, record).await;
            let outcome = annotate(&decision);
            debug!(
                actor_id = %record.actor_id,
                episode_id = %record.episode_id,
                source = %outcome.source,
                confidence = %outcome.confidence,
                "resolved character name"
            );
            self.metrics
                .record_outcome(outcome.source, outcome.confidence);
            records.push(ResolvedRecord::new(record, outcome));
        }

        BatchResult {
            index,
            records,
            skipped,
            elapsed: started.elapsed(),
        }
    }

    async fn resolve_record(&self, context: &RunContext, record: &CastRecord) -> Decision {
        let raw = record.character_name.trim();
        if let Some(canonical) = context.snapshot.lookup(raw, &record.actor_id) {
            return Decision::ManualOverride {
                name: canonical.to_string(),
                matched: raw.to_string(),
            };
        }

        let name = match self.backfill.resolve(record, &context.index) {
            BackfillOutcome::Resolved(decision) => return decision,
            BackfillOutcome::Present(name) => name,
        };

        if name != raw {
            if let Some(canonical) = context.snapshot.lookup(&name, &record.actor_id) {
                return Decision::ManualOverride {
                    name: canonical.to_string(),
                    matched: name,
                };
            }
        }

        let variants = context.index.variants(&record.actor_id);
        match self.matcher.evaluate(&name, variants) {
            FuzzyVerdict::Exact { .. } => Decision::Confirmed { name },
            FuzzyVerdict::NoCandidates { best } => {
                let reason = match best {
                    Some(score) => format!(
                        "no secondary variant reached threshold {} (best score {score})",
                        self.matcher.settings().threshold
                    ),
                    None => "no secondary variants for actor".to_string(),
                };
                Decision::Unresolved { name, reason }
            }
            FuzzyVerdict::Direct(candidate) => Decision::FuzzyDirect {
                name: candidate.name,
                score: candidate.score,
                cutoff: self
                    .matcher
                    .settings()
                    .high_confidence
                    .max(self.matcher.settings().threshold),
            },
            FuzzyVerdict::Ambiguous(candidates) => {
                let cluster = Cluster {
                    actor_id: record.actor_id.trim().to_string(),
                    actor_name: record.actor_name.clone(),
                    series_id: record.series_id.clone(),
                    primary_name: name,
                    candidates,
                };
                context
                    .canonicalizer
                    .resolve(&cluster, &context.snapshot)
                    .await
            }
        }
    }
}
