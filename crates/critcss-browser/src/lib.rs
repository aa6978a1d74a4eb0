//! Renderer side of critical css generation.
//!
//! The [`Orchestrator`] drives jobs against pages from a pooled browser; the
//! browser itself sits behind the [`driver`] traits. The Chromium driver
//! requires the `chromium` feature and Chrome/Chromium installed.

#[cfg(feature = "chromium")]
pub mod chromium;
pub mod driver;
pub mod job;
pub mod matcher;
pub mod orchestrator;
pub mod pool;

pub use driver::{Browser, BrowserLauncher, DriverError, DriverResult, RenderPage};
pub use job::{CriticalCss, JobLease, JobPhase, JobStats};
pub use orchestrator::Orchestrator;
