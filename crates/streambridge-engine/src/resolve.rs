//! Collaborator resolution and state backend creation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use streambridge_state::{SqliteStateBackend, StateBackend};
use streambridge_types::state::PipelineId;

use crate::config::types::{PipelineConfig, StateBackendKind};
use crate::connector::{DestinationStream, QueueConsumer};
use crate::local::{FileDestinationConfig, FileDestinationStream, FileQueueConsumer, FileSourceConfig};

pub(crate) fn create_state_backend(config: &PipelineConfig) -> Result<Arc<dyn StateBackend>> {
    let backend = match config.state.backend {
        StateBackendKind::Sqlite => {
            if let Some(path) = &config.state.connection {
                SqliteStateBackend::open(Path::new(path)).context("Failed to open state DB")?
            } else {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                let state_path = PathBuf::from(home).join(".streambridge").join("state.db");
                SqliteStateBackend::open(&state_path).context("Failed to open default state DB")?
            }
        }
        StateBackendKind::Memory => {
            SqliteStateBackend::in_memory().context("Failed to open in-memory state DB")?
        }
    };
    Ok(Arc::new(backend) as Arc<dyn StateBackend>)
}

pub(crate) fn check_state_backend(config: &PipelineConfig) -> bool {
    match create_state_backend(config) {
        Ok(_) => {
            tracing::info!("State backend: OK");
            true
        }
        Err(e) => {
            tracing::error!("State backend: FAILED: {e:#}");
            false
        }
    }
}

pub(crate) fn build_source(
    config: &PipelineConfig,
    state: Arc<dyn StateBackend>,
) -> Result<Arc<dyn QueueConsumer>> {
    match config.source.use_ref.as_str() {
        "file" => {
            let consumer = FileQueueConsumer::from_config(
                &config.source.config,
                PipelineId::new(config.pipeline.clone()),
                state,
            )?;
            Ok(Arc::new(consumer) as Arc<dyn QueueConsumer>)
        }
        other => anyhow::bail!(
            "Unknown source '{other}'; the CLI supports 'file' (embed the engine to plug in a queue client)"
        ),
    }
}

pub(crate) async fn build_destination(config: &PipelineConfig) -> Result<Arc<dyn DestinationStream>> {
    match config.destination.use_ref.as_str() {
        "file" => {
            let stream = FileDestinationStream::from_config(&config.destination.config).await?;
            Ok(Arc::new(stream) as Arc<dyn DestinationStream>)
        }
        "stdout" => Ok(Arc::new(FileDestinationStream::stdout()) as Arc<dyn DestinationStream>),
        other => anyhow::bail!(
            "Unknown destination '{other}'; the CLI supports 'file' and 'stdout' (embed the engine to plug in a stream client)"
        ),
    }
}

/// Check the source definition without consuming anything.
pub(crate) fn check_source(config: &PipelineConfig) -> Result<()> {
    match config.source.use_ref.as_str() {
        "file" => {
            let file: FileSourceConfig = serde_json::from_value(config.source.config.clone())
                .context("invalid file source config")?;
            if !file.dir.is_dir() {
                anyhow::bail!("file source dir {} is not a directory", file.dir.display());
            }
            Ok(())
        }
        other => anyhow::bail!("Unknown source '{other}'"),
    }
}

/// Check the destination definition without writing anything.
pub(crate) fn check_destination(config: &PipelineConfig) -> Result<()> {
    match config.destination.use_ref.as_str() {
        "file" => {
            let _: FileDestinationConfig = serde_json::from_value(config.destination.config.clone())
                .context("invalid file destination config")?;
            Ok(())
        }
        "stdout" => Ok(()),
        other => anyhow::bail!("Unknown destination '{other}'"),
    }
}
