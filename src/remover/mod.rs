//! Background removal.
//!
//! The removal itself is done by an external capability behind [`BackgroundRemover`].
//! [`RemovalAdapter`] is what the HTTP layer talks to: it turns a local path into the
//! `file://` locator the capability expects and bounds how long and how many removals
//! may run at once.

mod command;
mod plugin;
mod plugin_ffi;

pub use command::CommandRemover;
pub use plugin::PluginRemover;

use crate::format::OutputSpec;
use async_trait::async_trait;
use clap::ValueEnum;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum RemovalError {
    #[error("cannot build a file locator for {0:?}")]
    InvalidSource(PathBuf),
    #[error("background removal failed: {0}")]
    Failed(String),
    #[error("background removal produced no output")]
    EmptyOutput,
    #[error("background removal timed out after {0:?}")]
    TimedOut(Duration),
    #[error("background removal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("plugin error: {0}")]
    Plugin(String),
}

/// The external background-removal capability.
///
/// Implementations receive a locator for a local image and must return the result
/// already encoded as `output` asks. They are not expected to retry.
#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    async fn remove(&self, source: &Url, output: &OutputSpec) -> Result<Vec<u8>, RemovalError>;
}

/// Converts a filesystem path into a `file://` URL.
pub fn file_url(path: &Path) -> Result<Url, RemovalError> {
    let absolute =
        std::path::absolute(path).map_err(|_| RemovalError::InvalidSource(path.to_path_buf()))?;
    Url::from_file_path(&absolute).map_err(|_| RemovalError::InvalidSource(absolute))
}

#[derive(Clone)]
pub struct RemovalAdapter {
    remover: Arc<dyn BackgroundRemover>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl RemovalAdapter {
    pub fn new(remover: Arc<dyn BackgroundRemover>, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            remover,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        }
    }

    /// Removes the background of the image at `path`.
    /// Waiting for a free slot counts towards the timeout.
    pub async fn remove(&self, path: &Path, output: &OutputSpec) -> Result<Vec<u8>, RemovalError> {
        let source = file_url(path)?;

        let run = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| RemovalError::Failed(format!("removal slots closed: {}", e)))?;
            debug!("Invoking background removal for {}", source);
            self.remover.remove(&source, output).await
        };

        let data = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| RemovalError::TimedOut(self.timeout))??;

        if data.is_empty() {
            return Err(RemovalError::EmptyOutput);
        }
        Ok(data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RemoverKind {
    /// Run an external program per image.
    Command,
    /// Call into a native shared library.
    Plugin,
}

#[derive(Debug, Clone)]
pub struct RemoverConfig {
    pub kind: RemoverKind,
    pub command: String,
    pub command_args: Vec<String>,
    pub plugin_path: Option<PathBuf>,
}

/// Builds the configured capability.
///
/// Loading a plugin runs foreign initialization code, so this can fail at startup.
pub fn create_remover(config: &RemoverConfig) -> Result<Arc<dyn BackgroundRemover>, RemovalError> {
    match config.kind {
        RemoverKind::Command => Ok(Arc::new(CommandRemover::new(
            config.command.clone(),
            config.command_args.clone(),
        ))),
        RemoverKind::Plugin => {
            let path = config.plugin_path.as_ref().ok_or_else(|| {
                RemovalError::Plugin("the plugin backend requires --plugin-path".to_string())
            })?;
            let plugin = unsafe { PluginRemover::load(path) }?;
            Ok(Arc::new(plugin))
        }
    }
}
