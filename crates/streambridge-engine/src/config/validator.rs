//! Semantic validation for parsed pipeline configuration values.

use anyhow::{bail, Result};

use crate::config::types::{BatchingConfig, PipelineConfig, ResourceConfig, RetryConfig};
use crate::validation::rules;

fn validate_batching(batching: &BatchingConfig, errors: &mut Vec<String>) {
    if batching.max_batch_records == 0 {
        errors.push("batching.max_batch_records must be at least 1".to_string());
    }
    if batching.max_batch_bytes == 0 {
        errors.push("batching.max_batch_bytes must be at least 1".to_string());
    }
    if batching.max_batch_window_ms == 0 {
        errors.push("batching.max_batch_window_ms must be > 0".to_string());
    }
}

fn validate_retry(retry: &RetryConfig, errors: &mut Vec<String>) {
    if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
        errors.push(format!(
            "retry.backoff_multiplier must be a finite number >= 1.0, got {}",
            retry.backoff_multiplier
        ));
    }
    if retry.initial_backoff_ms > retry.max_backoff_ms {
        errors.push(format!(
            "retry.initial_backoff_ms ({}) must not exceed retry.max_backoff_ms ({})",
            retry.initial_backoff_ms, retry.max_backoff_ms
        ));
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        errors.push(format!(
            "retry.jitter must be within [0, 1], got {}",
            retry.jitter
        ));
    }
}

fn validate_resources(resources: &ResourceConfig, errors: &mut Vec<String>) {
    if resources.channel_capacity == 0 {
        errors.push("resources.channel_capacity must be at least 1".to_string());
    }
    if resources.max_inflight_batches == 0 {
        errors.push("resources.max_inflight_batches must be at least 1".to_string());
    }
    if resources.poll_timeout_ms == 0 {
        errors.push("resources.poll_timeout_ms must be > 0".to_string());
    }
    if resources.put_timeout_ms == 0 {
        errors.push("resources.put_timeout_ms must be > 0".to_string());
    }
}

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if config.source.use_ref.trim().is_empty() {
        errors.push("Source reference (use) must not be empty".to_string());
    }

    if config.destination.use_ref.trim().is_empty() {
        errors.push("Destination reference (use) must not be empty".to_string());
    }

    validate_batching(&config.batching, &mut errors);
    validate_retry(&config.retry, &mut errors);
    validate_resources(&config.resources, &mut errors);

    if let Err(e) = rules::compile(&config.validation.rules) {
        errors.push(format!("validation.rules: {e}"));
    }
    if let Err(e) = rules::check_partition_key(&config.validation.partition_key) {
        errors.push(format!("validation.partition_key: {e}"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_pipeline_str;

    fn base_yaml() -> String {
        r#"
version: "1.0"
pipeline: orders
source:
  use: file
  config:
    dir: /tmp/in
destination:
  use: stdout
"#
        .to_string()
    }

    #[test]
    fn test_valid_minimal_config() {
        let config = parse_pipeline_str(&base_yaml()).unwrap();
        assert!(validate_pipeline(&config).is_ok());
    }

    #[test]
    fn test_wrong_version() {
        let yaml = base_yaml().replace("\"1.0\"", "\"2.0\"");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("Unsupported pipeline version"));
    }

    #[test]
    fn test_empty_names() {
        let yaml = base_yaml()
            .replace("pipeline: orders", "pipeline: \"\"")
            .replace("use: stdout", "use: \" \"");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("Pipeline name must not be empty"));
        assert!(err.contains("Destination reference"));
    }

    #[test]
    fn test_collects_every_error() {
        let yaml = format!(
            "{}batching:\n  max_batch_records: 0\n  max_batch_window_ms: 0\nretry:\n  backoff_multiplier: 0.5\n  initial_backoff_ms: 5000\n  max_backoff_ms: 100\n  jitter: 1.5\nresources:\n  channel_capacity: 0\n",
            base_yaml()
        );
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("max_batch_records"));
        assert!(err.contains("max_batch_window_ms"));
        assert!(err.contains("backoff_multiplier"));
        assert!(err.contains("must not exceed"));
        assert!(err.contains("jitter"));
        assert!(err.contains("channel_capacity"));
    }

    #[test]
    fn test_zero_put_timeout_rejected() {
        let yaml = format!("{}resources:\n  put_timeout_ms: 0\n", base_yaml());
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("resources.put_timeout_ms must be > 0"), "got: {err}");
    }

    #[test]
    fn test_rule_compile_errors_surface() {
        let yaml = format!(
            "{}validation:\n  rules:\n    - assert_regex: {{ field: id, pattern: \"(\" }}\n  partition_key:\n    field: \"\"\n",
            base_yaml()
        );
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("validation.rules"));
        assert!(err.contains("validation.partition_key"));
    }
}
