use thiserror::Error;

/// Per-request failure taxonomy. Every variant is recoverable: a failed
/// request reports through the response envelope and never takes the
/// process down.
#[derive(Debug, Error)]
pub enum EnhanceError {
    #[error("{0}")]
    Validation(String),

    #[error("Unsupported scale {0} (supported: 2, 4, 8)")]
    UnsupportedScale(u32),

    #[error("failed to fetch model weights: {0}")]
    ModelFetch(String),

    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("failed to encode result: {0}")]
    Encoding(String),
}

impl EnhanceError {
    /// Stable machine-readable label, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::UnsupportedScale(_) => "unsupported_scale",
            Self::ModelFetch(_) => "model_fetch",
            Self::ModelLoad(_) => "model_load",
            Self::Inference(_) => "inference",
            Self::Encoding(_) => "encoding",
        }
    }
}
