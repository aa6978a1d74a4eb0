//! Chromium over the DevTools protocol.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetScriptExecutionDisabledParams,
};
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, ContinueRequestParams, EventRequestPaused, FailRequestParams, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{
    self, ErrorReason, Headers, ResourceType, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, CaptureScreenshotParams};
use chromiumoxide::cdp::js_protocol::runtime::{EventConsoleApiCalled, EventExceptionThrown};
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser as CdpBrowser, BrowserConfig as CdpBrowserConfig, Page};
use critcss_core::ScreenshotFormat;
use critcss_core::config::BrowserConfig;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::driver::{Browser, BrowserLauncher, DriverError, DriverResult, RenderPage};

/// Switches every launch gets on top of the configured ones.
const DEFAULT_ARGS: &[&str] = &[
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-background-networking",
    "--disable-sync",
    "--hide-scrollbars",
    "--mute-audio",
];

fn protocol_error(err: CdpError) -> DriverError {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("target closed")
        || lower.contains("no target")
        || lower.contains("session closed")
        || lower.contains("crashed")
        || lower.contains("channel")
    {
        DriverError::TargetClosed(message)
    } else {
        DriverError::Protocol(message)
    }
}

pub struct ChromiumLauncher {
    config: BrowserConfig,
}

impl ChromiumLauncher {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> DriverResult<Arc<dyn Browser>> {
        let mut builder = CdpBrowserConfig::builder();
        if !self.config.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.config.chrome_path {
            builder = builder.chrome_executable(path);
        }
        for arg in DEFAULT_ARGS {
            builder = builder.arg(*arg);
        }
        for arg in &self.config.launch_args {
            builder = builder.arg(arg.as_str());
        }
        let config = builder.build().map_err(DriverError::Launch)?;

        let (browser, mut handler) = CdpBrowser::launch(config)
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "CDP handler error");
                }
            }
        });
        debug!("Chromium launched");

        Ok(Arc::new(ChromiumBrowser {
            browser: Mutex::new(browser),
            handler,
        }))
    }
}

pub struct ChromiumBrowser {
    browser: Mutex<CdpBrowser>,
    handler: JoinHandle<()>,
}

#[async_trait]
impl Browser for ChromiumBrowser {
    async fn new_page(&self) -> DriverResult<Box<dyn RenderPage>> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(protocol_error)?;
        Ok(Box::new(ChromiumPage::new(page)))
    }

    async fn is_responsive(&self) -> bool {
        !self.handler.is_finished() && self.browser.lock().await.version().await.is_ok()
    }

    async fn close(&self) -> DriverResult<()> {
        let mut browser = self.browser.lock().await;
        let closed = browser.close().await.map(|_| ()).map_err(protocol_error);
        let _ = browser.wait().await;
        self.handler.abort();
        closed
    }
}

pub struct ChromiumPage {
    page: Page,
    block_scripts: Arc<AtomicBool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    interception_installed: AtomicBool,
}

impl ChromiumPage {
    fn new(page: Page) -> Self {
        Self {
            page,
            block_scripts: Arc::new(AtomicBool::new(false)),
            tasks: std::sync::Mutex::new(Vec::new()),
            interception_installed: AtomicBool::new(false),
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(task);
    }
}

impl Drop for ChromiumPage {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl RenderPage for ChromiumPage {
    async fn set_request_blocking(&self, block_scripts: bool) -> DriverResult<()> {
        self.block_scripts.store(block_scripts, Ordering::SeqCst);
        if self.interception_installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut paused = self
            .page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(protocol_error)?;
        let pattern = RequestPattern::builder()
            .url_pattern("*")
            .request_stage(RequestStage::Request)
            .build();
        self.page
            .execute(fetch::EnableParams::builder().patterns(vec![pattern]).build())
            .await
            .map_err(protocol_error)?;

        let page = self.page.clone();
        let block = self.block_scripts.clone();
        self.track(tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let request_id = event.request_id.clone();
                let result = if block.load(Ordering::SeqCst) && event.resource_type == ResourceType::Script {
                    debug!(url = %event.request.url, "Blocking script request");
                    page.execute(FailRequestParams::new(request_id, ErrorReason::BlockedByClient))
                        .await
                        .map(|_| ())
                } else {
                    page.execute(ContinueRequestParams::new(request_id)).await.map(|_| ())
                };
                if let Err(e) = result {
                    debug!(error = %e, "Could not resolve intercepted request");
                }
            }
        }));
        Ok(())
    }

    async fn set_viewport(&self, width: u32, height: u32) -> DriverResult<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(width))
            .height(i64::from(height))
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(DriverError::Protocol)?;
        self.page.execute(params).await.map_err(protocol_error)?;
        Ok(())
    }

    async fn set_user_agent(&self, user_agent: &str) -> DriverResult<()> {
        self.page
            .execute(SetUserAgentOverrideParams::new(user_agent))
            .await
            .map_err(protocol_error)?;
        Ok(())
    }

    async fn set_extra_headers(&self, headers: &BTreeMap<String, String>) -> DriverResult<()> {
        let headers = serde_json::to_value(headers).map_err(|e| DriverError::Protocol(e.to_string()))?;
        self.page
            .execute(network::EnableParams::default())
            .await
            .map_err(protocol_error)?;
        self.page
            .execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
            .await
            .map_err(protocol_error)?;
        Ok(())
    }

    async fn attach_observers(&self) -> DriverResult<()> {
        let mut console = self
            .page
            .event_listener::<EventConsoleApiCalled>()
            .await
            .map_err(protocol_error)?;
        self.track(tokio::spawn(async move {
            while let Some(event) = console.next().await {
                let text = event
                    .args
                    .iter()
                    .map(|arg| match (&arg.value, &arg.description) {
                        (Some(value), _) => value.to_string(),
                        (None, Some(description)) => description.clone(),
                        (None, None) => String::new(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                debug!(kind = ?event.r#type, %text, "Page console");
            }
        }));

        let mut exceptions = self
            .page
            .event_listener::<EventExceptionThrown>()
            .await
            .map_err(protocol_error)?;
        self.track(tokio::spawn(async move {
            while let Some(event) = exceptions.next().await {
                warn!(text = %event.exception_details.text, "Uncaught error in page");
            }
        }));
        Ok(())
    }

    async fn set_script_execution(&self, enabled: bool) -> DriverResult<()> {
        self.page
            .execute(SetScriptExecutionDisabledParams::new(!enabled))
            .await
            .map_err(protocol_error)?;
        Ok(())
    }

    async fn goto(&self, url: &str) -> DriverResult<()> {
        self.page.goto(url).await.map_err(|e| match protocol_error(e) {
            DriverError::Protocol(message) => DriverError::Navigation(message),
            other => other,
        })?;
        Ok(())
    }

    async fn set_content(&self, html: &str) -> DriverResult<()> {
        self.page.set_content(html).await.map_err(|e| match protocol_error(e) {
            DriverError::Protocol(message) => DriverError::Navigation(message),
            other => other,
        })?;
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> DriverResult<serde_json::Value> {
        let result = self.page.evaluate(expression).await.map_err(|e| match protocol_error(e) {
            DriverError::Protocol(message) => DriverError::Evaluation(message),
            other => other,
        })?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn screenshot(&self, format: ScreenshotFormat, quality: Option<u8>) -> DriverResult<Vec<u8>> {
        let mut params = CaptureScreenshotParams::builder().format(match format {
            ScreenshotFormat::Png => CaptureScreenshotFormat::Png,
            ScreenshotFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
        });
        if let (ScreenshotFormat::Jpeg, Some(quality)) = (format, quality) {
            params = params.quality(i64::from(quality.min(100)));
        }
        let response = self.page.execute(params.build()).await.map_err(protocol_error)?;
        let data: &str = response.data.as_ref();
        BASE64_STANDARD
            .decode(data)
            .map_err(|e| DriverError::Protocol(format!("Failed to decode screenshot: {e}")))
    }

    async fn close(&self) -> DriverResult<()> {
        self.page.clone().close().await.map_err(protocol_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use critcss_core::{JobOptions, PageSource};

    use crate::Orchestrator;

    fn chrome_available() -> bool {
        std::env::var("CRITCSS_TEST_CHROME").is_ok()
    }

    #[tokio::test]
    #[ignore = "needs Chrome/Chromium; set CRITCSS_TEST_CHROME=1"]
    async fn test_real_chrome_inline_html() {
        if !chrome_available() {
            eprintln!("Skipping: CRITCSS_TEST_CHROME not set");
            return;
        }
        let config = BrowserConfig::default();
        let orchestrator = Orchestrator::new(config.clone(), Arc::new(ChromiumLauncher::new(config)));
        let html = r#"<html><body><h1 class="top">Hi</h1>
            <div style="height:3000px"></div><p class="below">bye</p></body></html>"#;
        let mut options = JobOptions::new(
            ".top{color:red}.below{color:blue}@media print{.top{color:black}}",
            PageSource::Html(html.into()),
        );
        options.settings.height = 600;

        let css = orchestrator.generate(&options).await.unwrap();
        assert_eq!(css, ".top{color:red}");
        assert_eq!(orchestrator.in_flight(), 0);
        assert!(!orchestrator.is_browser_running().await);
    }
}
