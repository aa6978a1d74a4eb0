//! One job's claim on a renderer page, and what a job reports back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::MutexGuard;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pool::PooledPage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Idle,
    PageAcquired,
    Navigating,
    Processing,
    Cleanup,
    Done,
}

/// Counters reported with every successful job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub input_rules: usize,
    pub removed_media_rules: usize,
    pub parse_issues: usize,
    pub selectors_tested: usize,
    pub critical_selectors: usize,
    pub invalid_selectors: usize,
    pub output_rules: usize,
    pub reused_page: bool,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CriticalCss {
    pub css: String,
    pub stats: JobStats,
}

/// Ties a page to one job attempt until cleanup hands it back.
///
/// Cleanup is claimed at most once. If the lease is dropped without it (the
/// caller abandoned the job future), the page is closed in the background.
pub struct JobLease {
    id: Uuid,
    page: tokio::sync::Mutex<Option<PooledPage>>,
    phase: Mutex<JobPhase>,
    /// Browser generation the attempt ran on, known as soon as a page is
    /// requested, even if none was obtained.
    generation: Mutex<Option<u64>>,
    cleanup_claimed: AtomicBool,
}

impl JobLease {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            page: tokio::sync::Mutex::new(None),
            phase: Mutex::new(JobPhase::Idle),
            generation: Mutex::new(None),
            cleanup_claimed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> JobPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_phase(&self, phase: JobPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
        debug!(job_id = %self.id, ?phase, "Job phase");
    }

    pub fn generation(&self) -> Option<u64> {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn note_generation(&self, generation: u64) {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner) = Some(generation);
    }

    pub(crate) async fn attach(&self, page: PooledPage) {
        self.note_generation(page.generation());
        let mut slot = self.page.lock().await;
        if slot.replace(page).is_some() {
            warn!(job_id = %self.id, "Lease already held a page");
        }
        drop(slot);
        self.set_phase(JobPhase::PageAcquired);
    }

    /// Exclusive access to the leased page for the job body.
    pub(crate) async fn page(&self) -> MutexGuard<'_, Option<PooledPage>> {
        self.page.lock().await
    }

    /// True for the first caller only.
    pub(crate) fn claim_cleanup(&self) -> bool {
        !self.cleanup_claimed.swap(true, Ordering::AcqRel)
    }

    pub(crate) async fn take_page(&self) -> Option<PooledPage> {
        self.page.lock().await.take()
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        if self.cleanup_claimed.load(Ordering::Acquire) {
            return;
        }
        let Some(page) = self.page.get_mut().take() else {
            return;
        };
        warn!(job_id = %self.id, "Job dropped before cleanup, closing its page");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(page.close());
            }
            Err(_) => debug!(job_id = %self.id, "No runtime to close the page on"),
        }
    }
}
