//! The renderer seam: what the orchestrator needs from a headless browser.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use critcss_core::{CriticalCssError, ScreenshotFormat};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    /// The page target or the whole renderer went away.
    #[error("Target closed: {0}")]
    TargetClosed(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Browser launch failed: {0}")]
    Launch(String),
}

impl From<DriverError> for CriticalCssError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::TargetClosed(msg) => CriticalCssError::RendererCrash(msg),
            DriverError::Navigation(msg) => CriticalCssError::Navigation(msg),
            other => CriticalCssError::Browser(other.to_string()),
        }
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> DriverResult<Arc<dyn Browser>>;
}

#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_page(&self) -> DriverResult<Box<dyn RenderPage>>;

    /// Cheap liveness check of the renderer process.
    async fn is_responsive(&self) -> bool;

    async fn close(&self) -> DriverResult<()>;
}

/// One renderer page (tab).
#[async_trait]
pub trait RenderPage: Send + Sync {
    /// Abort script requests while `block_scripts` is set. The first call
    /// installs request interception; later calls only flip the policy.
    async fn set_request_blocking(&self, block_scripts: bool) -> DriverResult<()>;

    async fn set_viewport(&self, width: u32, height: u32) -> DriverResult<()>;

    async fn set_user_agent(&self, user_agent: &str) -> DriverResult<()>;

    async fn set_extra_headers(&self, headers: &BTreeMap<String, String>) -> DriverResult<()>;

    /// Forward console messages and uncaught page errors to the log.
    async fn attach_observers(&self) -> DriverResult<()>;

    async fn set_script_execution(&self, enabled: bool) -> DriverResult<()>;

    async fn goto(&self, url: &str) -> DriverResult<()>;

    async fn set_content(&self, html: &str) -> DriverResult<()>;

    /// Evaluate an expression, awaiting it if it yields a promise. Only
    /// JSON-serializable results cross back.
    async fn evaluate(&self, expression: &str) -> DriverResult<serde_json::Value>;

    async fn screenshot(&self, format: ScreenshotFormat, quality: Option<u8>) -> DriverResult<Vec<u8>>;

    async fn close(&self) -> DriverResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_mapping() {
        let crash: CriticalCssError = DriverError::TargetClosed("tab crashed".into()).into();
        assert!(crash.is_renderer_crash());

        let nav: CriticalCssError = DriverError::Navigation("net::ERR_NAME_NOT_RESOLVED".into()).into();
        assert!(matches!(nav, CriticalCssError::Navigation(_)));

        let proto: CriticalCssError = DriverError::Protocol("bad params".into()).into();
        assert!(proto.to_string().contains("bad params"));
    }

    #[test]
    fn test_only_target_loss_is_a_crash() {
        let eval: CriticalCssError = DriverError::Evaluation("ReferenceError".into()).into();
        assert!(!eval.is_renderer_crash());
        let launch: CriticalCssError = DriverError::Launch("no chrome".into()).into();
        assert!(!launch.is_renderer_crash());
    }
}
