//! Core types, config, and errors for critcss.

pub mod config;
pub mod error;
pub mod options;

pub use error::{CriticalCssError, Result};
pub use options::{ForcePattern, JobOptions, JobSettings, PageSource, ScreenshotFormat, ScreenshotOptions};
