//! Pipeline orchestrator: wires poll, validate, batch, deliver and commit.
//!
//! Stages run as tokio tasks joined by bounded channels, so a slow
//! destination stalls batching, validation and finally polling. Shutdown
//! cancels the poll stage only; every downstream stage drains once its input
//! channel closes, so in-flight batches still reach a terminal state and
//! their offsets are committed before `run_pipeline` returns.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use streambridge_state::StateBackend;
use streambridge_types::batch::Batch;
use streambridge_types::envelope::DlqRecord;
use streambridge_types::message::{DomainEvent, RawMessage};
use streambridge_types::outcome::DeliveryOutcome;
use streambridge_types::state::{PartitionId, PipelineId, RunStats, RunStatus};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::batcher::{run_batch_stage, BatchLimits};
use crate::config::types::PipelineConfig;
use crate::config::validator::validate_pipeline;
use crate::connector::{DestinationStream, QueueConsumer};
use crate::delivery::DeliveryClient;
use crate::errors::{PipelineError, PipelineFault};
use crate::execution::ExecutionOptions;
use crate::offsets::OffsetTracker;
use crate::resolve::{
    build_destination, build_source, check_destination, check_source, check_state_backend,
    create_state_backend,
};
use crate::result::{CheckResult, DeliveryStats, PipelineCounts, PipelineResult};
use crate::retry::{deliver_with_retry, BackoffPolicy};
use crate::validation::RecordValidator;

/// DLQ records are flushed to the state backend once this many are buffered.
const DLQ_FLUSH_THRESHOLD: usize = 256;

/// The external systems a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn QueueConsumer>,
    pub destination: Arc<dyn DestinationStream>,
    pub state: Arc<dyn StateBackend>,
}

#[derive(Debug, Default)]
struct RunCounters {
    polled: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    fatal: AtomicU64,
    escalated: AtomicU64,
    batches: AtomicU64,
    put_attempts: AtomicU64,
    retries: AtomicU64,
    commits: AtomicU64,
    dlq_records: AtomicU64,
}

impl RunCounters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Offsets resolved by an upstream stage, with their dead-letter copies.
#[derive(Debug, Default)]
struct Resolution {
    dlq: Vec<DlqRecord>,
}

struct RunContext {
    pipeline: PipelineId,
    tracker: Arc<OffsetTracker>,
    counters: Arc<RunCounters>,
    shutdown: CancellationToken,
    dlq_enabled: bool,
}

/// Run a pipeline from its configuration using the built-in collaborators.
///
/// Runs until `shutdown` is cancelled, the source is exhausted, or
/// `options.max_messages` have been polled.
///
/// # Errors
///
/// Returns `PipelineError::Config` for an invalid pipeline, `Fault` when a
/// systemic source or destination failure stopped the run, and
/// `Infrastructure` for state backend or task failures.
pub async fn run_pipeline(
    config: &PipelineConfig,
    options: &ExecutionOptions,
    shutdown: CancellationToken,
) -> Result<PipelineResult, PipelineError> {
    validate_pipeline(config).map_err(|e| PipelineError::Config(format!("{e:#}")))?;
    let state = create_state_backend(config)?;
    let source = build_source(config, Arc::clone(&state))?;
    let destination = build_destination(config).await?;
    run_with_collaborators(
        config,
        Collaborators {
            source,
            destination,
            state,
        },
        options,
        shutdown,
    )
    .await
}

/// Run a pipeline against caller-supplied collaborators.
///
/// # Errors
///
/// See [`run_pipeline`].
pub async fn run_with_collaborators(
    config: &PipelineConfig,
    collaborators: Collaborators,
    options: &ExecutionOptions,
    shutdown: CancellationToken,
) -> Result<PipelineResult, PipelineError> {
    let start = Instant::now();
    let validator = RecordValidator::from_config(&config.validation).map_err(PipelineError::Config)?;
    let pipeline = PipelineId::new(config.pipeline.clone());
    let Collaborators {
        source,
        destination,
        state,
    } = collaborators;

    tracing::info!(
        pipeline = config.pipeline,
        rules = validator.rule_count(),
        max_batch_records = config.batching.max_batch_records,
        max_batch_bytes = config.batching.max_batch_bytes,
        max_batch_window_ms = config.batching.max_batch_window_ms,
        max_retry_attempts = config.retry.max_retry_attempts,
        "Starting pipeline"
    );

    let tracker = Arc::new(OffsetTracker::new());
    let committed = source
        .committed_offsets()
        .await
        .map_err(|e| PipelineError::Fault(PipelineFault::Source(e)))?;
    for (&partition, &offset) in &committed {
        tracker.seed(partition, offset);
        tracing::debug!(partition = %partition, offset, "Seeded commit point");
    }

    let run_id = {
        let state = Arc::clone(&state);
        let pipeline = pipeline.clone();
        tokio::task::spawn_blocking(move || state.start_run(&pipeline))
            .await
            .map_err(|e| PipelineError::Infrastructure(anyhow::anyhow!("start_run task panicked: {e}")))?
            .map_err(|e| PipelineError::Infrastructure(e.into()))?
    };

    let ctx = Arc::new(RunContext {
        pipeline: pipeline.clone(),
        tracker: Arc::clone(&tracker),
        counters: Arc::new(RunCounters::default()),
        shutdown: shutdown.child_token(),
        dlq_enabled: config.dlq.enabled,
    });

    let capacity = config.resources.channel_capacity.max(1);
    let (raw_tx, raw_rx) = mpsc::channel::<RawMessage>(capacity);
    let (event_tx, event_rx) = mpsc::channel::<DomainEvent>(capacity);
    let (batch_tx, batch_rx) = mpsc::channel::<Batch>(config.resources.max_inflight_batches.max(1));
    let (resolved_tx, resolved_rx) = mpsc::channel::<Resolution>(capacity);

    let mut stages: JoinSet<Result<(), PipelineError>> = JoinSet::new();
    stages.spawn(poll_stage(
        Arc::clone(&ctx),
        Arc::clone(&source),
        raw_tx,
        options.clone(),
        config.resources.poll_timeout(),
    ));
    stages.spawn(validate_stage(
        Arc::clone(&ctx),
        validator,
        raw_rx,
        event_tx,
        resolved_tx.clone(),
    ));
    let limits = BatchLimits::from_config(&config.batching);
    let batch_counters = Arc::clone(&ctx.counters);
    stages.spawn(async move {
        let emitted = run_batch_stage(event_rx, batch_tx, limits).await;
        RunCounters::add(&batch_counters.batches, emitted);
        Ok(())
    });
    stages.spawn(deliver_stage(
        Arc::clone(&ctx),
        DeliveryClient::new(destination).with_put_timeout(config.resources.put_timeout()),
        BackoffPolicy::from_config(&config.retry),
        batch_rx,
        resolved_tx,
    ));
    stages.spawn(commit_stage(
        Arc::clone(&ctx),
        Arc::clone(&source),
        Arc::clone(&state),
        run_id,
        resolved_rx,
    ));

    let first_error = collect_stage_results(stages).await?;
    let counters = &ctx.counters;
    let result = PipelineResult {
        counts: PipelineCounts {
            records_polled: RunCounters::get(&counters.polled),
            records_rejected: RunCounters::get(&counters.rejected),
            records_delivered: RunCounters::get(&counters.delivered),
            records_fatal: RunCounters::get(&counters.fatal),
            records_escalated: RunCounters::get(&counters.escalated),
        },
        delivery: DeliveryStats {
            batches: RunCounters::get(&counters.batches),
            put_attempts: RunCounters::get(&counters.put_attempts),
            retries: RunCounters::get(&counters.retries),
            offset_commits: RunCounters::get(&counters.commits),
            dlq_records: RunCounters::get(&counters.dlq_records),
        },
        committed: tracker.snapshot(),
        duration_secs: start.elapsed().as_secs_f64(),
    };

    finalize_run(&state, run_id, &result, first_error.as_ref()).await?;

    if let Some(err) = first_error {
        tracing::error!(
            pipeline = config.pipeline,
            unresolved = tracker.in_flight(),
            "Pipeline stopped by fault: {err}"
        );
        return Err(err);
    }

    tracing::info!(
        pipeline = config.pipeline,
        polled = result.counts.records_polled,
        delivered = result.counts.records_delivered,
        rejected = result.counts.records_rejected,
        fatal = result.counts.records_fatal,
        escalated = result.counts.records_escalated,
        batches = result.delivery.batches,
        retries = result.delivery.retries,
        duration_secs = result.duration_secs,
        "Pipeline run completed"
    );
    Ok(result)
}

/// Join every stage; return the first stage error, if any.
///
/// Stages are never aborted: after a fault the remaining stages still drain
/// so that resolved offsets get committed.
async fn collect_stage_results(
    mut stages: JoinSet<Result<(), PipelineError>>,
) -> Result<Option<PipelineError>, PipelineError> {
    let mut first_error: Option<PipelineError> = None;
    while let Some(joined) = stages.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!("Stage failed: {error}");
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
            Err(join_err) => {
                return Err(PipelineError::Infrastructure(anyhow::anyhow!(
                    "Stage task panicked: {join_err}"
                )));
            }
        }
    }
    Ok(first_error)
}

async fn finalize_run(
    state: &Arc<dyn StateBackend>,
    run_id: i64,
    result: &PipelineResult,
    error: Option<&PipelineError>,
) -> Result<(), PipelineError> {
    let (status, stats) = match error {
        Some(err) => (
            RunStatus::Failed,
            RunStats {
                error_message: Some(err.to_string()),
                ..result.run_stats()
            },
        ),
        None => (RunStatus::Completed, result.run_stats()),
    };
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || state.complete_run(run_id, status, &stats))
        .await
        .map_err(|e| PipelineError::Infrastructure(anyhow::anyhow!("complete_run task panicked: {e}")))?
        .map_err(|e| PipelineError::Infrastructure(e.into()))
}

async fn poll_stage(
    ctx: Arc<RunContext>,
    source: Arc<dyn QueueConsumer>,
    raw_tx: mpsc::Sender<RawMessage>,
    options: ExecutionOptions,
    poll_timeout: std::time::Duration,
) -> Result<(), PipelineError> {
    let mut polled = 0u64;
    loop {
        if options.remaining(polled) == Some(0) {
            tracing::info!(polled, "Message limit reached; draining");
            break;
        }
        if source.is_finished() {
            tracing::info!(polled, "Source exhausted; draining");
            break;
        }

        let messages = tokio::select! {
            biased;
            () = ctx.shutdown.cancelled() => break,
            res = source.poll(poll_timeout) => res,
        };
        let mut messages = match messages {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(error = %e, "Source poll failed");
                ctx.shutdown.cancel();
                return Err(PipelineError::Fault(PipelineFault::Source(e)));
            }
        };
        if let Some(remaining) = options.remaining(polled) {
            messages.truncate(usize::try_from(remaining).unwrap_or(usize::MAX));
        }

        for message in messages {
            ctx.tracker.register(message.position());
            polled += 1;
            RunCounters::add(&ctx.counters.polled, 1);
            if raw_tx.send(message).await.is_err() {
                tracing::debug!("Validate stage closed; stopping poll");
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn validate_stage(
    ctx: Arc<RunContext>,
    validator: RecordValidator,
    mut raw_rx: mpsc::Receiver<RawMessage>,
    event_tx: mpsc::Sender<DomainEvent>,
    resolved_tx: mpsc::Sender<Resolution>,
) -> Result<(), PipelineError> {
    while let Some(message) = raw_rx.recv().await {
        match validator.validate(&message) {
            Ok(event) => {
                if event_tx.send(event).await.is_err() {
                    tracing::debug!("Batch stage closed; stopping validation");
                    return Ok(());
                }
            }
            Err(rejection) => {
                tracing::warn!(
                    partition = %message.partition,
                    offset = message.offset,
                    category = %rejection.kind,
                    "Rejected message: {}",
                    rejection.reasons.join("; ")
                );
                RunCounters::add(&ctx.counters.rejected, 1);
                ctx.tracker.resolve(rejection.position);
                let mut resolution = Resolution::default();
                if ctx.dlq_enabled {
                    resolution.dlq.push(crate::dlq::rejected_record(&message, &rejection));
                }
                let _ = resolved_tx.send(resolution).await;
            }
        }
    }
    Ok(())
}

async fn deliver_stage(
    ctx: Arc<RunContext>,
    client: DeliveryClient,
    policy: BackoffPolicy,
    mut batch_rx: mpsc::Receiver<Batch>,
    resolved_tx: mpsc::Sender<Resolution>,
) -> Result<(), PipelineError> {
    while let Some(batch) = batch_rx.recv().await {
        let batch_id = batch.id;
        let records = batch.len();
        let resolved = match deliver_with_retry(&client, batch, policy.clone()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!(
                    batch_id = %batch_id,
                    records,
                    code = %e.code,
                    "Systemic destination failure; stopping consumption"
                );
                ctx.shutdown.cancel();
                return Err(PipelineError::Fault(PipelineFault::Destination(e)));
            }
        };

        let counters = &ctx.counters;
        RunCounters::add(&counters.put_attempts, u64::from(resolved.put_attempts));
        RunCounters::add(
            &counters.retries,
            u64::from(resolved.put_attempts.saturating_sub(1)),
        );
        RunCounters::add(&counters.escalated, resolved.escalated as u64);

        let mut resolution = Resolution::default();
        for (event, outcome) in &resolved.records {
            match outcome {
                DeliveryOutcome::Delivered => RunCounters::add(&counters.delivered, 1),
                DeliveryOutcome::FatalFailure { reason } => {
                    if reason.category != streambridge_types::error::ErrorCategory::RetriesExhausted {
                        RunCounters::add(&counters.fatal, 1);
                        tracing::warn!(
                            batch_id = %batch_id,
                            partition = %event.position().partition,
                            offset = event.position().offset,
                            category = %reason.category,
                            code = %reason.code,
                            "Record refused by destination: {}",
                            reason.message
                        );
                    }
                    if ctx.dlq_enabled {
                        resolution.dlq.push(crate::dlq::failed_record(event, reason));
                    }
                }
                DeliveryOutcome::RetryableFailure { .. } => {
                    // A resolved batch never carries a retryable outcome.
                    continue;
                }
            }
            ctx.tracker.resolve(event.position());
        }

        tracing::debug!(
            batch_id = %batch_id,
            records,
            delivered = resolved.delivered(),
            failed = resolved.failed(),
            attempts = resolved.put_attempts,
            "Batch resolved"
        );
        let _ = resolved_tx.send(resolution).await;
    }
    Ok(())
}

async fn commit_stage(
    ctx: Arc<RunContext>,
    source: Arc<dyn QueueConsumer>,
    state: Arc<dyn StateBackend>,
    run_id: i64,
    mut resolved_rx: mpsc::Receiver<Resolution>,
) -> Result<(), PipelineError> {
    let mut unacked: BTreeMap<PartitionId, u64> = BTreeMap::new();
    let mut dlq_buffer: Vec<DlqRecord> = Vec::new();

    while let Some(resolution) = resolved_rx.recv().await {
        dlq_buffer.extend(resolution.dlq);
        // Coalesce whatever else is already queued into one commit pass.
        while let Ok(more) = resolved_rx.try_recv() {
            dlq_buffer.extend(more.dlq);
        }
        commit_pending(&ctx, &source, &state, &mut unacked).await;
        if dlq_buffer.len() >= DLQ_FLUSH_THRESHOLD {
            flush_dlq(&ctx, &state, run_id, &mut dlq_buffer).await?;
        }
    }

    commit_pending(&ctx, &source, &state, &mut unacked).await;
    if !unacked.is_empty() {
        tracing::error!(
            partitions = unacked.len(),
            "Offsets could not be committed before shutdown; they will be redelivered"
        );
    }
    flush_dlq(&ctx, &state, run_id, &mut dlq_buffer).await
}

async fn commit_pending(
    ctx: &RunContext,
    source: &Arc<dyn QueueConsumer>,
    state: &Arc<dyn StateBackend>,
    unacked: &mut BTreeMap<PartitionId, u64>,
) {
    for (partition, offset) in ctx.tracker.take_pending_commits() {
        let entry = unacked.entry(partition).or_insert(offset);
        *entry = (*entry).max(offset);
    }

    let pending = std::mem::take(unacked);
    for (partition, offset) in pending {
        if let Err(e) = source.commit(partition, offset).await {
            tracing::warn!(
                partition = %partition,
                offset,
                error = %e,
                "Offset commit failed; will retry on the next pass"
            );
            unacked.insert(partition, offset);
            continue;
        }
        RunCounters::add(&ctx.counters.commits, 1);
        tracing::debug!(partition = %partition, offset, "Committed offset");

        let state = Arc::clone(state);
        let pipeline = ctx.pipeline.clone();
        let persisted =
            tokio::task::spawn_blocking(move || state.commit_offset(&pipeline, partition, offset)).await;
        match persisted {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(
                partition = %partition,
                offset,
                error = %e,
                "Failed to record committed offset in state backend"
            ),
            Err(e) => tracing::warn!(error = %e, "commit_offset task panicked"),
        }
    }
}

async fn flush_dlq(
    ctx: &RunContext,
    state: &Arc<dyn StateBackend>,
    run_id: i64,
    buffer: &mut Vec<DlqRecord>,
) -> Result<(), PipelineError> {
    if buffer.is_empty() {
        return Ok(());
    }
    let records = std::mem::take(buffer);
    RunCounters::add(&ctx.counters.dlq_records, records.len() as u64);
    let state = Arc::clone(state);
    let pipeline = ctx.pipeline.clone();
    tokio::task::spawn_blocking(move || {
        crate::dlq::persist_dlq_records(state.as_ref(), &pipeline, run_id, &records);
    })
    .await
    .map_err(|e| {
        PipelineError::Infrastructure(anyhow::anyhow!("persist_dlq_records task panicked: {e}"))
    })
}

/// Check a pipeline without consuming: config, rules, collaborators, state.
///
/// # Errors
///
/// Returns an error only if checking itself could not run.
pub async fn check_pipeline(config: &PipelineConfig) -> Result<CheckResult> {
    tracing::info!(pipeline = config.pipeline, "Checking pipeline configuration");

    let config_ok = match validate_pipeline(config) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("Pipeline config: FAILED: {e:#}");
            false
        }
    };
    let rules_compiled = RecordValidator::from_config(&config.validation)
        .map(|v| v.rule_count())
        .unwrap_or(0);

    let source_ok = report_check("Source", check_source(config));
    let destination_ok = report_check("Destination", check_destination(config));

    let state_config = config.clone();
    let state_ok = tokio::task::spawn_blocking(move || check_state_backend(&state_config))
        .await
        .map_err(|e| anyhow::anyhow!("State check task panicked: {e}"))?;

    Ok(CheckResult {
        config_ok,
        rules_compiled,
        source_ok,
        destination_ok,
        state_ok,
    })
}

fn report_check(what: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => {
            tracing::info!("{what}: OK");
            true
        }
        Err(e) => {
            tracing::error!("{what}: FAILED: {e:#}");
            false
        }
    }
}
