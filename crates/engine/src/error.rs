use deck_graph::GraphError;

/// Outcome of a request that can be superseded before it completes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// Superseded or torn down. Expected control flow, never worth logging.
    #[error("request was cancelled")]
    Cancelled,

    #[error("request failed: {0}")]
    Failed(String),
}

impl RequestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestError::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("volume must be finite and non-negative, got {0}")]
    VolumeOutOfRange(f64),

    #[error("max duration must be non-negative, got {0}")]
    InvalidMaxDuration(f64),

    #[error(transparent)]
    Graph(#[from] GraphError),
}
