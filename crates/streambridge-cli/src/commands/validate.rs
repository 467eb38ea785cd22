use std::path::Path;

use anyhow::{Context, Result};

use streambridge_engine::config::parser;
use streambridge_engine::config::validator;
use streambridge_engine::validation::RecordValidator;
use streambridge_types::message::RawMessage;

/// Tally of a sample run through the record validator.
#[derive(Debug, Default, PartialEq, Eq)]
struct SampleReport {
    accepted: usize,
    rejected: usize,
}

/// Execute the `validate` command: check a pipeline file and, optionally,
/// run its record rules over a JSON-lines sample.
pub fn execute(pipeline_path: &Path, sample_path: Option<&Path>) -> Result<()> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    validator::validate_pipeline(&config)?;

    println!("Pipeline '{}' is valid.", config.pipeline);
    println!("  Source:      {}", config.source.use_ref);
    println!("  Destination: {}", config.destination.use_ref);

    let Some(sample_path) = sample_path else {
        return Ok(());
    };
    let record_validator = RecordValidator::from_config(&config.validation)
        .map_err(|e| anyhow::anyhow!("invalid validation rules: {e}"))?;
    println!("  Rules:       {}", record_validator.rule_count());

    let sample = std::fs::read_to_string(sample_path)
        .with_context(|| format!("Failed to read sample: {}", sample_path.display()))?;
    let report = validate_sample(&record_validator, &sample);
    println!(
        "\nSample {}: {} accepted, {} rejected",
        sample_path.display(),
        report.accepted,
        report.rejected
    );
    Ok(())
}

fn validate_sample(record_validator: &RecordValidator, sample: &str) -> SampleReport {
    let mut report = SampleReport::default();
    for (line_no, line) in sample.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let message = RawMessage::new(0, line_no as u64, line.to_owned());
        match record_validator.validate(&message) {
            Ok(event) => {
                report.accepted += 1;
                println!("  line {:>4}: OK (key {})", line_no + 1, event.partition_key());
            }
            Err(rejection) => {
                report.rejected += 1;
                println!("  line {:>4}: REJECTED ({})", line_no + 1, rejection.kind);
                for reason in &rejection.reasons {
                    println!("             {reason}");
                }
            }
        }
    }
    report
}
