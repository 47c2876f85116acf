use thiserror::Error;

/// Errors the conversion core emits. Pre-flight kinds surface immediately,
/// transient kinds are recovered by the retry policies of their subsystem.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("input text is empty")]
    NoContent,

    #[error("LLM endpoint or model is not configured")]
    LlmNotConfigured,

    #[error("no output directory selected")]
    NoDirectory,

    #[error("not enough voices enabled ({male} male, {female} female)")]
    InsufficientVoices { male: usize, female: usize },

    #[error("cancelled")]
    Cancelled,

    #[error("{stage} response failed validation: {details}")]
    ValidationFailed {
        stage: &'static str,
        details: String,
    },

    #[error("{stage} request was refused: {message}")]
    Refused {
        stage: &'static str,
        message: String,
    },

    #[error("transient failure: {0}")]
    Retriable(String),

    #[error("audio encoder failed: {0}")]
    EncoderFatal(String),

    #[error("file system permission denied: {0}")]
    FileSystemPermission(String),

    #[error("assignments produced no renderable audio chunks")]
    NoPronounceableContent,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConvertError {
    /// Whether the retry loops may attempt this operation again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ConvertError::Retriable(_)
                | ConvertError::ValidationFailed { .. }
                | ConvertError::Io(_)
                | ConvertError::Other(_)
        )
    }

    /// Stable short name for structured logging and status reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            ConvertError::NoContent => "no_content",
            ConvertError::LlmNotConfigured => "llm_not_configured",
            ConvertError::NoDirectory => "no_directory",
            ConvertError::InsufficientVoices { .. } => "insufficient_voices",
            ConvertError::Cancelled => "cancelled",
            ConvertError::ValidationFailed { .. } => "validation_failed",
            ConvertError::Refused { .. } => "refused",
            ConvertError::Retriable(_) => "retriable",
            ConvertError::EncoderFatal(_) => "encoder_fatal",
            ConvertError::FileSystemPermission(_) => "fs_permission",
            ConvertError::NoPronounceableContent => "no_pronounceable_content",
            ConvertError::Io(_) => "io",
            ConvertError::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(ConvertError::Retriable("503".into()).is_retriable());
        assert!(ConvertError::ValidationFailed {
            stage: "extract",
            details: "bad json".into()
        }
        .is_retriable());
        assert!(!ConvertError::Cancelled.is_retriable());
        assert!(!ConvertError::Refused {
            stage: "assign",
            message: "policy".into()
        }
        .is_retriable());
        assert!(!ConvertError::NoContent.is_retriable());
    }
}
