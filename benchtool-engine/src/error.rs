use thiserror::Error;

use crate::balancer::BalancerError;

/// Errors setting up a dispatcher.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The HTTP client could not be created.
    #[error("failed to create http client: {0}")]
    Http(#[from] reqwest::Error),
    /// The initial address resolution failed.
    #[error("unable to resolve endpoints: {0}")]
    Resolve(#[from] BalancerError),
    /// The worker pool is empty.
    #[error("at least one worker is required")]
    NoWorkers,
}
