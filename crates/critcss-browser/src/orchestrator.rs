//! The browser resource orchestrator.
//!
//! Owns the browser handle, the idle page pool and the in-flight job count.
//! Each job leases one page, runs under a single global timeout and goes
//! through exactly one cleanup, whatever the outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use critcss_core::config::BrowserConfig;
use critcss_core::{CriticalCssError, JobOptions, PageSource, Result, ScreenshotOptions};
use critcss_css::PreparedStylesheet;
use tokio::sync::Mutex;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::driver::{Browser, BrowserLauncher, RenderPage};
use crate::job::{CriticalCss, JobLease, JobPhase, JobStats};
use crate::matcher::{MatchRequest, find_critical_selectors, replace_styles_expression};
use crate::pool::{PageSettings, PooledPage};

/// Bound on page housekeeping (reset, close) so a wedged page can't stall cleanup.
const PAGE_HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(5);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_ATTEMPTS: u32 = 2;

struct BrowserState {
    browser: Option<Arc<dyn Browser>>,
    pool: Vec<PooledPage>,
    /// Bumped on every launch; pages and failures are tagged with it.
    generation: u64,
}

/// Decrements the in-flight counter even if the job future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    config: BrowserConfig,
    /// `None` when the caller supplied the browser: never relaunch or close it.
    launcher: Option<Arc<dyn BrowserLauncher>>,
    state: Mutex<BrowserState>,
    in_flight: AtomicUsize,
}

impl Orchestrator {
    /// An orchestrator that launches its browser lazily on the first job.
    pub fn new(config: BrowserConfig, launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            config,
            launcher: Some(launcher),
            state: Mutex::new(BrowserState {
                browser: None,
                pool: Vec::new(),
                generation: 0,
            }),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// An orchestrator running on a browser the caller owns.
    pub fn with_browser(config: BrowserConfig, browser: Arc<dyn Browser>) -> Self {
        Self {
            config,
            launcher: None,
            state: Mutex::new(BrowserState {
                browser: Some(browser),
                pool: Vec::new(),
                generation: 1,
            }),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn idle_pages(&self) -> usize {
        self.state.lock().await.pool.len()
    }

    pub async fn is_browser_running(&self) -> bool {
        self.state.lock().await.browser.is_some()
    }

    /// Launch the browser (and pre-open pages) if it isn't running yet.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_browser(&mut state).await?;
        Ok(())
    }

    async fn ensure_browser(&self, state: &mut BrowserState) -> Result<Arc<dyn Browser>> {
        if let Some(browser) = &state.browser {
            return Ok(browser.clone());
        }
        let launcher = self.launcher.as_ref().ok_or_else(|| {
            CriticalCssError::Browser("The supplied browser is no longer available".into())
        })?;

        info!(generation = state.generation + 1, "Launching browser");
        let timeout = Duration::from_millis(self.config.launch_timeout_ms);
        let browser = tokio::time::timeout(timeout, launcher.launch())
            .await
            .map_err(|_| {
                CriticalCssError::Browser(format!(
                    "Browser did not start within {}ms",
                    self.config.launch_timeout_ms
                ))
            })??;
        state.generation += 1;
        state.browser = Some(browser.clone());

        let prewarm = self.config.prewarm_pages.min(self.config.keep_open_pages);
        for _ in 0..prewarm {
            match browser.new_page().await {
                Ok(page) => state.pool.push(PooledPage::new(page, state.generation)),
                Err(e) => {
                    warn!(error = %e, "Failed to pre-open page");
                    break;
                }
            }
        }
        if prewarm > 0 {
            debug!(pages = state.pool.len(), "Pre-opened pages");
        }
        Ok(browser)
    }

    /// Take an idle page, or open a new one.
    pub async fn acquire_page(&self) -> Result<PooledPage> {
        self.acquire(None).await
    }

    /// Like [`acquire_page`](Self::acquire_page), recording on `lease` which
    /// browser the attempt used before a page is opened.
    async fn acquire(&self, lease: Option<&JobLease>) -> Result<PooledPage> {
        let mut state = self.state.lock().await;
        let browser = self.ensure_browser(&mut state).await?;
        let generation = state.generation;
        if let Some(lease) = lease {
            lease.note_generation(generation);
        }
        if let Some(page) = state.pool.pop() {
            debug!(reused = page.is_reused(), idle = state.pool.len(), "Took page from pool");
            return Ok(page);
        }
        drop(state);

        let page = browser.new_page().await?;
        debug!(generation, "Opened new page");
        Ok(PooledPage::new(page, generation))
    }

    /// Hand a page back after a job. It goes back into the pool when there is
    /// room and it belongs to the running browser; a page whose job failed is
    /// reset first. Pages from fatal failures are always closed.
    pub async fn release_page(&self, page: PooledPage, job_failed: bool, fatal: bool) {
        if fatal || !self.has_room_for(&page).await {
            close_page(page).await;
            return;
        }
        if job_failed {
            match tokio::time::timeout(PAGE_HOUSEKEEPING_TIMEOUT, page.reset()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(error = %e, "Page reset failed, closing it");
                    close_page(page).await;
                    return;
                }
                Err(_) => {
                    debug!("Page reset timed out, closing it");
                    close_page(page).await;
                    return;
                }
            }
        }

        let mut state = self.state.lock().await;
        if Self::pool_accepts(&state, &page, self.config.keep_open_pages) {
            state.pool.push(page);
            debug!(idle = state.pool.len(), "Page returned to pool");
        } else {
            drop(state);
            close_page(page).await;
        }
    }

    async fn has_room_for(&self, page: &PooledPage) -> bool {
        let state = self.state.lock().await;
        Self::pool_accepts(&state, page, self.config.keep_open_pages)
    }

    fn pool_accepts(state: &BrowserState, page: &PooledPage, capacity: usize) -> bool {
        state.browser.is_some()
            && state.generation == page.generation()
            && state.pool.len() < capacity
    }

    /// Close the pool and the browser if no job is running, unless the
    /// browser is meant to stay alive.
    pub async fn shutdown_if_idle(&self) {
        if self.config.keep_alive || self.in_flight() > 0 {
            return;
        }
        let mut state = self.state.lock().await;
        // A job may have started while we waited for the lock.
        if self.in_flight() > 0 {
            return;
        }
        self.teardown(&mut state).await;
    }

    /// Close everything regardless of running jobs.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        self.teardown(&mut state).await;
    }

    async fn teardown(&self, state: &mut BrowserState) {
        for page in state.pool.drain(..) {
            close_page(page).await;
        }
        if self.launcher.is_none() {
            return;
        }
        if let Some(browser) = state.browser.take() {
            info!(generation = state.generation, "Closing browser");
            close_browser(browser.as_ref()).await;
        }
    }

    /// After a failure on browser `generation`: decide whether a retry makes
    /// sense, relaunching the browser if it stopped responding.
    async fn recover(&self, generation: u64) -> Result<bool> {
        if self.launcher.is_none() {
            return Ok(false);
        }
        let mut state = self.state.lock().await;
        if state.generation != generation {
            debug!("Browser was already restarted by another job");
            return Ok(true);
        }
        let Some(browser) = state.browser.clone() else {
            return Ok(true);
        };
        let responsive = tokio::time::timeout(LIVENESS_TIMEOUT, browser.is_responsive())
            .await
            .unwrap_or(false);
        if responsive {
            return Ok(false);
        }

        warn!(generation, "Browser is not responding, restarting it");
        state.browser = None;
        for page in state.pool.drain(..) {
            close_page(page).await;
        }
        close_browser(browser.as_ref()).await;
        self.ensure_browser(&mut state).await?;
        Ok(true)
    }

    /// Compute critical css for one job.
    pub async fn generate(&self, options: &JobOptions) -> Result<String> {
        self.generate_with_report(options).await.map(|result| result.css)
    }

    /// Like [`generate`](Self::generate), with job counters.
    pub async fn generate_with_report(&self, options: &JobOptions) -> Result<CriticalCss> {
        options.validate()?;
        let job_id = Uuid::new_v4();
        let span = info_span!("critcss_job", %job_id, page = options.page_label());
        async {
            let started = Instant::now();
            let in_flight = InFlight::enter(&self.in_flight);
            let result = self.run_with_retry(job_id, options).await;
            drop(in_flight);
            self.shutdown_if_idle().await;

            match &result {
                Ok(output) => info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    input_rules = output.stats.input_rules,
                    output_rules = output.stats.output_rules,
                    selectors = output.stats.selectors_tested,
                    critical = output.stats.critical_selectors,
                    "Generated critical css"
                ),
                Err(e) => warn!(error = %e, "Critical css generation failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_with_retry(&self, job_id: Uuid, options: &JobOptions) -> Result<CriticalCss> {
        // One budget for the whole job; a retry only gets what is left.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(options.settings.timeout_ms);
        let mut attempt = 1;
        loop {
            let (result, generation) = self.run_attempt(job_id, options, deadline).await;
            let err = match result {
                Ok(mut output) => {
                    output.stats.attempts = attempt;
                    return Ok(output);
                }
                Err(err) => err,
            };
            if attempt >= MAX_ATTEMPTS || !err.is_retryable() {
                return Err(err);
            }
            let Some(generation) = generation else {
                return Err(err);
            };
            if !self.recover(generation).await? {
                return Err(err);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CriticalCssError::Timeout {
                    timeout_ms: options.settings.timeout_ms,
                });
            }
            warn!(attempt, error = %err, "Retrying job on a fresh browser");
            attempt += 1;
        }
    }

    /// One attempt, bounded by the job's deadline. Returns the outcome and
    /// the browser generation the attempt ran on, if it got that far.
    async fn run_attempt(
        &self,
        job_id: Uuid,
        options: &JobOptions,
        deadline: tokio::time::Instant,
    ) -> (Result<CriticalCss>, Option<u64>) {
        let timeout_ms = options.settings.timeout_ms;
        let lease = JobLease::new(job_id);
        let outcome = match tokio::time::timeout_at(deadline, self.job_body(options, &lease)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(timeout_ms, phase = ?lease.phase(), "Job timed out");
                Err(CriticalCssError::Timeout { timeout_ms })
            }
        };
        self.cleanup(&lease, &outcome).await;
        (outcome, lease.generation())
    }

    /// The single cleanup path: release the page exactly once. Returns false
    /// when cleanup already ran for this lease.
    async fn cleanup(&self, lease: &JobLease, outcome: &Result<CriticalCss>) -> bool {
        if !lease.claim_cleanup() {
            debug!(job_id = %lease.id(), "Cleanup already done");
            return false;
        }
        lease.set_phase(JobPhase::Cleanup);
        if let Some(page) = lease.take_page().await {
            let fatal = matches!(outcome, Err(e) if e.is_renderer_crash());
            self.release_page(page, outcome.is_err(), fatal).await;
        }
        lease.set_phase(JobPhase::Done);
        true
    }

    async fn job_body(&self, options: &JobOptions, lease: &JobLease) -> Result<CriticalCss> {
        let started = Instant::now();
        let settings = &options.settings;

        // Stylesheet work needs no page; run it while the page gets ready.
        let css = options.css.clone();
        let css_settings = settings.clone();
        let prepare = tokio::task::spawn_blocking(move || critcss_css::prepare(&css, &css_settings));
        let page_ready = async {
            let page = self.acquire(Some(lease)).await?;
            let reused = page.is_reused();
            // Attach before configuring so a failed or cancelled setup still reaches cleanup.
            lease.attach(page).await;
            let mut slot = lease.page().await;
            let page = slot
                .as_mut()
                .ok_or_else(|| CriticalCssError::Browser("Lease lost its page".into()))?;
            page.configure(&PageSettings::from_job(settings)).await?;
            Ok::<bool, CriticalCssError>(reused)
        };
        let (prepared, reused) = tokio::join!(prepare, page_ready);
        let prepared = prepared.map_err(|e| anyhow::anyhow!("Stylesheet preparation panicked: {e}"))??;
        let reused_page = reused?;

        let slot = lease.page().await;
        let page = slot
            .as_ref()
            .ok_or_else(|| CriticalCssError::Browser("Lease lost its page".into()))?
            .page();

        lease.set_phase(JobPhase::Navigating);
        navigate(page, options).await?;
        if let Some(shots) = &settings.screenshots {
            capture_screenshot(page, shots, "before").await;
        }

        lease.set_phase(JobPhase::Processing);
        let output = process(page, prepared, options).await?;
        if let Some(shots) = &settings.screenshots {
            match replace_styles_expression(&output.css) {
                Ok(expression) => match page.evaluate(&expression).await {
                    Ok(_) => capture_screenshot(page, shots, "after").await,
                    Err(e) => warn!(error = %e, "Could not apply critical css for the after screenshot"),
                },
                Err(e) => warn!(error = %e, "Could not encode critical css for the page"),
            }
        }
        drop(slot);

        let mut output = output;
        output.stats.reused_page = reused_page;
        output.stats.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(output)
    }
}

async fn navigate(page: &dyn RenderPage, options: &JobOptions) -> Result<()> {
    let settings = &options.settings;
    page.set_script_execution(!settings.block_js_requests).await?;

    let load = async {
        match &options.page {
            PageSource::Url(url) => page.goto(url).await,
            PageSource::Html(html) => page.set_content(html).await,
        }
    };
    if settings.page_load_skip_timeout_ms == 0 {
        load.await?;
        return Ok(());
    }
    let skip_after = Duration::from_millis(settings.page_load_skip_timeout_ms);
    match tokio::time::timeout(skip_after, load).await {
        Ok(loaded) => loaded?,
        Err(_) => info!(
            page_load_skip_timeout_ms = settings.page_load_skip_timeout_ms,
            "Page still loading, continuing with what has loaded"
        ),
    }
    Ok(())
}

async fn process(page: &dyn RenderPage, prepared: PreparedStylesheet, options: &JobOptions) -> Result<CriticalCss> {
    let request = MatchRequest::new(prepared.selectors().to_vec(), &options.settings);
    let response = find_critical_selectors(page, &request).await?;

    let mut stats = JobStats {
        input_rules: prepared.input_rules,
        removed_media_rules: prepared.removed_media_rules,
        parse_issues: prepared.issues.len(),
        selectors_tested: request.selectors.len(),
        critical_selectors: response.critical_selectors.len(),
        invalid_selectors: response.invalid_selectors.len(),
        ..JobStats::default()
    };
    let finalized = tokio::task::spawn_blocking(move || prepared.finalize(response.critical_selectors))
        .await
        .map_err(|e| anyhow::anyhow!("Stylesheet finalization panicked: {e}"))?;
    stats.output_rules = finalized.output_rules;
    Ok(CriticalCss {
        css: finalized.css,
        stats,
    })
}

/// Best effort: failures are logged.
async fn capture_screenshot(page: &dyn RenderPage, shots: &ScreenshotOptions, suffix: &str) {
    let path = shots.path_for(suffix);
    let bytes = match page.screenshot(shots.format, shots.quality).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Screenshot failed");
            return;
        }
    };
    match tokio::fs::write(&path, bytes).await {
        Ok(()) => debug!(path = %path.display(), "Saved screenshot"),
        Err(e) => warn!(error = %e, path = %path.display(), "Could not write screenshot"),
    }
}

async fn close_page(page: PooledPage) {
    if tokio::time::timeout(PAGE_HOUSEKEEPING_TIMEOUT, page.close())
        .await
        .is_err()
    {
        debug!("Page close timed out");
    }
}

async fn close_browser(browser: &dyn Browser) {
    match tokio::time::timeout(PAGE_HOUSEKEEPING_TIMEOUT, browser.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Browser close failed"),
        Err(_) => debug!("Browser close timed out"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use critcss_core::ScreenshotFormat;

    use super::*;
    use crate::driver::{DriverError, DriverResult};

    #[derive(Default)]
    struct Calls {
        gotos: AtomicUsize,
        closes: AtomicUsize,
    }

    struct StubPage(Arc<Calls>);

    #[async_trait]
    impl RenderPage for StubPage {
        async fn set_request_blocking(&self, _block_scripts: bool) -> DriverResult<()> {
            Ok(())
        }
        async fn set_viewport(&self, _width: u32, _height: u32) -> DriverResult<()> {
            Ok(())
        }
        async fn set_user_agent(&self, _user_agent: &str) -> DriverResult<()> {
            Ok(())
        }
        async fn set_extra_headers(&self, _headers: &BTreeMap<String, String>) -> DriverResult<()> {
            Ok(())
        }
        async fn attach_observers(&self) -> DriverResult<()> {
            Ok(())
        }
        async fn set_script_execution(&self, _enabled: bool) -> DriverResult<()> {
            Ok(())
        }
        async fn goto(&self, _url: &str) -> DriverResult<()> {
            self.0.gotos.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn set_content(&self, _html: &str) -> DriverResult<()> {
            Ok(())
        }
        async fn evaluate(&self, _expression: &str) -> DriverResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
        async fn screenshot(&self, _format: ScreenshotFormat, _quality: Option<u8>) -> DriverResult<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn close(&self) -> DriverResult<()> {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubBrowser {
        calls: Arc<Calls>,
        alive: AtomicBool,
    }

    #[async_trait]
    impl Browser for StubBrowser {
        async fn new_page(&self) -> DriverResult<Box<dyn RenderPage>> {
            if !self.alive.load(Ordering::SeqCst) {
                return Err(DriverError::TargetClosed("browser is gone".into()));
            }
            Ok(Box::new(StubPage(self.calls.clone())))
        }
        async fn is_responsive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        async fn close(&self) -> DriverResult<()> {
            Ok(())
        }
    }

    fn stub(alive: bool) -> (Orchestrator, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let browser = Arc::new(StubBrowser {
            calls: calls.clone(),
            alive: AtomicBool::new(alive),
        });
        let config = BrowserConfig {
            keep_alive: true,
            ..BrowserConfig::default()
        };
        (Orchestrator::with_browser(config, browser), calls)
    }

    #[tokio::test]
    async fn test_cleanup_releases_the_page_once() {
        let (orchestrator, calls) = stub(true);
        let lease = JobLease::new(Uuid::new_v4());
        let page = orchestrator.acquire(Some(&lease)).await.unwrap();
        lease.attach(page).await;

        let outcome: Result<CriticalCss> = Err(CriticalCssError::Navigation("net::ERR_FAILED".into()));
        assert!(orchestrator.cleanup(&lease, &outcome).await);
        assert!(!orchestrator.cleanup(&lease, &outcome).await);
        assert!(!orchestrator.cleanup(&lease, &Err(CriticalCssError::Timeout { timeout_ms: 1 })).await);

        assert_eq!(lease.phase(), JobPhase::Done);
        assert_eq!(orchestrator.idle_pages().await, 1);
        assert_eq!(calls.gotos.load(Ordering::SeqCst), 1, "page reset once");
        assert_eq!(calls.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_crash_cleanup_closes_instead_of_pooling() {
        let (orchestrator, calls) = stub(true);
        let lease = JobLease::new(Uuid::new_v4());
        let page = orchestrator.acquire(Some(&lease)).await.unwrap();
        lease.attach(page).await;

        let outcome: Result<CriticalCss> = Err(CriticalCssError::RendererCrash("gone".into()));
        assert!(orchestrator.cleanup(&lease, &outcome).await);
        assert_eq!(orchestrator.idle_pages().await, 0);
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_acquire_still_records_generation() {
        let (orchestrator, _calls) = stub(false);
        let lease = JobLease::new(Uuid::new_v4());
        let err = orchestrator.acquire(Some(&lease)).await.unwrap_err();
        assert!(err.is_renderer_crash(), "got: {err}");
        assert_eq!(lease.generation(), Some(1));
        assert!(orchestrator.cleanup(&lease, &Err(err)).await);
    }
}
