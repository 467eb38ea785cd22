use std::path::Path;

use anyhow::{Context, Result};

use streambridge_engine::check_pipeline;
use streambridge_engine::config::parser;

/// Execute the `check` command: validate config, rules, collaborators and state.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    let result = check_pipeline(&config).await?;

    print_status("Pipeline config:", result.config_ok);
    println!("{:18} {}", "Rules compiled:", result.rules_compiled);
    print_status("Source:", result.source_ok);
    print_status("Destination:", result.destination_ok);
    print_status("State backend:", result.state_ok);

    if result.all_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}

fn print_status(label: &str, ok: bool) {
    println!("{:18} {}", label, if ok { "OK" } else { "FAILED" });
}
