//! Idle renderer pages and the per-page setup they carry between jobs.

use std::collections::BTreeMap;

use critcss_core::{JobSettings, Result};
use tracing::{debug, warn};

use crate::driver::{DriverResult, RenderPage};

/// Page-level state a job needs. A reused page only gets the parts that
/// differ from what it already has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSettings {
    pub width: u32,
    pub height: u32,
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
    pub block_js: bool,
}

impl PageSettings {
    pub fn from_job(settings: &JobSettings) -> Self {
        Self {
            width: settings.width,
            height: settings.height,
            user_agent: settings.user_agent.clone(),
            headers: settings.custom_page_headers.clone(),
            block_js: settings.block_js_requests,
        }
    }
}

/// A page owned by the pool or leased to a job.
pub struct PooledPage {
    page: Box<dyn RenderPage>,
    /// Browser generation the page belongs to.
    generation: u64,
    /// `None` until a job has configured the page.
    settings: Option<PageSettings>,
    observers_attached: bool,
}

impl std::fmt::Debug for PooledPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledPage")
            .field("generation", &self.generation)
            .field("settings", &self.settings)
            .field("observers_attached", &self.observers_attached)
            .finish_non_exhaustive()
    }
}

impl PooledPage {
    pub fn new(page: Box<dyn RenderPage>, generation: u64) -> Self {
        Self {
            page,
            generation,
            settings: None,
            observers_attached: false,
        }
    }

    pub fn page(&self) -> &dyn RenderPage {
        self.page.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a previous job already ran on this page. Pre-opened pages
    /// that never served a job are not reused.
    pub fn is_reused(&self) -> bool {
        self.settings.is_some()
    }

    /// Bring the page in line with `wanted`. Header failures are logged and
    /// ignored; everything else is an error.
    pub async fn configure(&mut self, wanted: &PageSettings) -> Result<()> {
        let current = self.settings.take();
        if current.as_ref() == Some(wanted) {
            debug!("Reusing configured page as-is");
            self.settings = current;
            return Ok(());
        }

        if current.as_ref().map(|c| c.block_js) != Some(wanted.block_js) {
            self.page.set_request_blocking(wanted.block_js).await?;
        }
        if current.as_ref().map(|c| (c.width, c.height)) != Some((wanted.width, wanted.height)) {
            self.page.set_viewport(wanted.width, wanted.height).await?;
        }
        if current.as_ref().map(|c| c.user_agent.as_str()) != Some(wanted.user_agent.as_str()) {
            self.page.set_user_agent(&wanted.user_agent).await?;
        }
        if !self.observers_attached {
            self.page.attach_observers().await?;
            self.observers_attached = true;
        }
        let headers_changed = match &current {
            Some(c) => c.headers != wanted.headers,
            None => !wanted.headers.is_empty(),
        };
        if headers_changed {
            if let Err(e) = self.page.set_extra_headers(&wanted.headers).await {
                warn!(error = %e, "Failed to set custom page headers, continuing without them");
            }
        }

        self.settings = Some(wanted.clone());
        Ok(())
    }

    /// Navigate away from whatever the last job left behind.
    pub async fn reset(&self) -> DriverResult<()> {
        self.page.goto("about:blank").await
    }

    pub async fn close(self) {
        if let Err(e) = self.page.close().await {
            debug!(error = %e, "Page close failed");
        }
    }
}
