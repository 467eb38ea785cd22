use std::path::Path;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use streambridge_engine::config::parser;
use streambridge_engine::config::validator;
use streambridge_engine::{run_pipeline, ExecutionOptions, PipelineResult};

/// Execute the `run` command: parse, validate, and run a pipeline.
pub async fn execute(pipeline_path: &Path, max_messages: Option<u64>) -> Result<()> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    validator::validate_pipeline(&config)?;

    tracing::info!(
        pipeline = config.pipeline,
        source = config.source.use_ref,
        destination = config.destination.use_ref,
        rules = config.validation.rules.len(),
        "Pipeline validated"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received; draining in-flight batches");
            signal_token.cancel();
        }
    });

    let options = ExecutionOptions { max_messages };
    let result = run_pipeline(&config, &options, shutdown).await?;

    print_summary(&config.pipeline, &result);
    Ok(())
}

fn print_summary(pipeline: &str, result: &PipelineResult) {
    let counts = &result.counts;
    let delivery = &result.delivery;
    println!("Pipeline '{pipeline}' completed.");
    println!("  Records polled:    {}", counts.records_polled);
    println!("  Records delivered: {}", counts.records_delivered);
    println!("  Records rejected:  {}", counts.records_rejected);
    println!("  Records fatal:     {}", counts.records_fatal);
    println!("  Records escalated: {}", counts.records_escalated);
    println!("  Batches:           {}", delivery.batches);
    println!("  Put attempts:      {}", delivery.put_attempts);
    if delivery.retries > 0 {
        println!("  Retries:           {}", delivery.retries);
    }
    if delivery.dlq_records > 0 {
        println!("  DLQ records:       {}", delivery.dlq_records);
    }
    println!("  Duration:          {:.2}s", result.duration_secs);
    if result.duration_secs > 0.0 {
        println!(
            "  Throughput:        {:.0} records/sec",
            counts.records_delivered as f64 / result.duration_secs
        );
    }
    for (partition, offset) in &result.committed {
        println!("  Committed:         partition {partition} @ {offset}");
    }

    // Machine-readable summary for scripts
    match serde_json::to_string(result) {
        Ok(json) => println!("@@RUN_JSON@@{json}"),
        Err(e) => tracing::warn!(error = %e, "Failed to serialize run summary"),
    }
}
