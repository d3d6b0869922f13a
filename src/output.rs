//! Output Layer
//!
//! An outputter owns the consumer end of the shared measurement queue and
//! drains it for the lifetime of the process, independent of the tick cadence.
//!
//! - [`stdout`]: l2met lines on stdout (`stdout-raw`, `stdout-derived`)
//! - [`http`]: batched JSON delivery with a bounded backlog and retry/backoff

pub mod http;
pub mod stdout;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{AgentConfig, OutputKind};
use crate::measurement::Measurement;

pub use http::HttpOutputter;
pub use stdout::StdoutOutputter;

/// Errors raised while building an outputter.
#[derive(Debug, Error)]
pub enum OutputError {
    /// Target URL could not be parsed.
    #[error("invalid output url {url:?}: {reason}")]
    Url { url: String, reason: String },

    /// HTTP client construction failed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Consumer of the shared measurement queue.
pub trait Outputter: Send + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Spawn the outputter's tasks. They run until `rx` is closed and drained.
    fn start(self: Box<Self>, rx: mpsc::Receiver<Measurement>) -> Vec<JoinHandle<()>>;
}

/// Build the outputter selected by `config.output`.
pub fn build(config: &AgentConfig) -> Result<Box<dyn Outputter>, OutputError> {
    let outputter: Box<dyn Outputter> = match config.output {
        OutputKind::StdoutRaw => Box::new(StdoutOutputter::raw(
            config.prefix.clone(),
            config.source.clone(),
        )),
        OutputKind::StdoutDerived => Box::new(StdoutOutputter::derived(
            config.prefix.clone(),
            config.source.clone(),
        )),
        OutputKind::Http => Box::new(HttpOutputter::from_config(config)?),
    };
    tracing::info!(output = outputter.name(), "Outputter selected");
    Ok(outputter)
}
