use thiserror::Error;

#[derive(Debug, Error)]
pub enum CriticalCssError {
    /// Missing or empty stylesheet, bad URL, nonsensical viewport.
    #[error("Input error: {0}")]
    Input(String),

    /// Only raised in strict mode; otherwise the recovered tree is used.
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Navigation error: {0}")]
    Navigation(String),

    /// The page target or renderer process went away mid-job.
    #[error("Renderer crashed: {0}")]
    RendererCrash(String),

    #[error("Timed out: critical css generation exceeded the configured timeout of {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CriticalCssError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_renderer_crash(&self) -> bool {
        matches!(self, Self::RendererCrash(_))
    }

    /// Whether a failed job may be worth one more attempt on a fresh browser.
    ///
    /// Caller mistakes and timeouts are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Input(_) | Self::Parse(_) | Self::Config(_) | Self::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CriticalCssError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_states_value() {
        let err = CriticalCssError::Timeout { timeout_ms: 1500 };
        assert!(err.to_string().contains("1500ms"), "got: {err}");
        assert!(err.is_timeout());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retry_classification() {
        assert!(CriticalCssError::RendererCrash("target closed".into()).is_retryable());
        assert!(CriticalCssError::Navigation("net::ERR_FAILED".into()).is_retryable());
        assert!(!CriticalCssError::Input("empty css".into()).is_retryable());
        assert!(!CriticalCssError::Parse("unexpected }".into()).is_retryable());
    }
}
