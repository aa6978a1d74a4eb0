//! Batch runs: many jobs from one JSON5 manifest over a shared orchestrator.
//!
//! ```json5
//! {
//!   concurrency: 4,
//!   jobs: [
//!     { css: "site.css", url: "https://example.com/", output: "out/home.css" },
//!     { css: "site.css", html: "pages/about.html", output: "out/about.css",
//!       settings: { height: 667, force_include: [".hero"] } },
//!   ],
//! }
//! ```
//!
//! Relative paths are resolved against the manifest's directory. `settings`
//! entries override the configured job defaults key by key.

use std::path::{Path, PathBuf};

use anyhow::Context;
use critcss_browser::{JobStats, Orchestrator};
use critcss_core::{JobOptions, JobSettings, PageSource};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{error, info};

fn default_concurrency() -> usize {
    2
}

#[derive(Debug, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    pub jobs: Vec<ManifestJob>,
}

#[derive(Debug, Deserialize)]
pub struct ManifestJob {
    pub css: PathBuf,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub html: Option<PathBuf>,
    pub output: PathBuf,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

impl Manifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let mut manifest: Manifest = json5::from_str(&raw)
            .with_context(|| format!("Invalid manifest {}", path.display()))?;

        if manifest.jobs.is_empty() {
            anyhow::bail!("Manifest {} has no jobs", path.display());
        }
        manifest.concurrency = manifest.concurrency.max(1);

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for (index, job) in manifest.jobs.iter_mut().enumerate() {
            if job.url.is_some() == job.html.is_some() {
                anyhow::bail!("Job {index}: exactly one of `url` and `html` is required");
            }
            job.css = base.join(&job.css);
            job.output = base.join(&job.output);
            if let Some(html) = &job.html {
                job.html = Some(base.join(html));
            }
        }
        Ok(manifest)
    }
}

impl ManifestJob {
    /// Defaults overlaid with this job's `settings`.
    pub fn settings(&self, defaults: &JobSettings) -> anyhow::Result<JobSettings> {
        let mut merged = serde_json::to_value(defaults)?;
        if let serde_json::Value::Object(map) = &mut merged {
            for (key, value) in &self.settings {
                map.insert(key.clone(), value.clone());
            }
        }
        serde_json::from_value(merged).context("Invalid job settings")
    }

    pub async fn to_options(&self, defaults: &JobSettings) -> anyhow::Result<JobOptions> {
        let css = tokio::fs::read_to_string(&self.css)
            .await
            .with_context(|| format!("Failed to read stylesheet {}", self.css.display()))?;
        let page = match (&self.url, &self.html) {
            (Some(url), _) => PageSource::Url(url.clone()),
            (None, Some(path)) => PageSource::Html(
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read html file {}", path.display()))?,
            ),
            (None, None) => anyhow::bail!("Job has neither `url` nor `html`"),
        };
        Ok(JobOptions::new(css, page).with_settings(self.settings(defaults)?))
    }
}

async fn run_job(orchestrator: &Orchestrator, job: &ManifestJob, defaults: &JobSettings) -> anyhow::Result<JobStats> {
    let options = job.to_options(defaults).await?;
    let result = orchestrator.generate_with_report(&options).await?;
    if let Some(parent) = job.output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&job.output, &result.css)
        .await
        .with_context(|| format!("Failed to write {}", job.output.display()))?;
    Ok(result.stats)
}

/// Run all jobs with at most `manifest.concurrency` in flight. Failures are
/// logged and counted; they do not stop the other jobs.
pub async fn run(orchestrator: &Orchestrator, manifest: &Manifest, defaults: &JobSettings) -> BatchSummary {
    let outcomes: Vec<_> = futures::stream::iter(manifest.jobs.iter().enumerate())
        .map(|(index, job)| async move { (index, job, run_job(orchestrator, job, defaults).await) })
        .buffer_unordered(manifest.concurrency)
        .collect()
        .await;

    let mut summary = BatchSummary::default();
    for (index, job, outcome) in outcomes {
        match outcome {
            Ok(stats) => {
                summary.succeeded += 1;
                info!(
                    job = index,
                    output = %job.output.display(),
                    output_rules = stats.output_rules,
                    elapsed_ms = stats.elapsed_ms,
                    "Job done"
                );
            }
            Err(e) => {
                summary.failed += 1;
                error!(job = index, error = %format!("{e:#}"), "Job failed");
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("manifest.json5");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"{
                jobs: [
                    { css: "site.css", url: "https://example.com/", output: "out/home.css" },
                    { css: "/abs/site.css", html: "about.html", output: "about.css" },
                ],
            }"#,
        );
        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.concurrency, 2);
        assert_eq!(manifest.jobs[0].css, dir.path().join("site.css"));
        assert_eq!(manifest.jobs[0].output, dir.path().join("out/home.css"));
        assert_eq!(manifest.jobs[1].css, PathBuf::from("/abs/site.css"));
        assert_eq!(manifest.jobs[1].html, Some(dir.path().join("about.html")));
    }

    #[test]
    fn test_load_rejects_ambiguous_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"{ jobs: [{ css: "a.css", url: "https://example.com/", html: "a.html", output: "a.out" }] }"#,
        );
        let err = Manifest::load(&path).unwrap_err();
        assert!(err.to_string().contains("exactly one"), "got: {err}");

        let path = write_manifest(dir.path(), r#"{ jobs: [] }"#);
        assert!(Manifest::load(&path).is_err());
    }

    #[test]
    fn test_settings_overlay_defaults() {
        let job: ManifestJob = json5::from_str(
            r#"{ css: "a.css", url: "https://example.com/", output: "a.out",
                 settings: { height: 667, force_include: [".hero", { source: "^\\.nav", flags: "i" }] } }"#,
        )
        .unwrap();
        let defaults = JobSettings {
            width: 375,
            ..JobSettings::default()
        };
        let settings = job.settings(&defaults).unwrap();
        assert_eq!(settings.width, 375);
        assert_eq!(settings.height, 667);
        assert_eq!(settings.force_include.len(), 2);
        assert_eq!(settings.timeout_ms, defaults.timeout_ms);
    }

    #[test]
    fn test_bad_settings_are_reported() {
        let job: ManifestJob = json5::from_str(
            r#"{ css: "a.css", url: "https://example.com/", output: "a.out", settings: { height: "tall" } }"#,
        )
        .unwrap();
        assert!(job.settings(&JobSettings::default()).is_err());
    }

    #[tokio::test]
    async fn test_to_options_reads_inputs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("site.css"), "a{color:red}").unwrap();
        std::fs::write(dir.path().join("page.html"), "<a>x</a>").unwrap();
        let path = write_manifest(
            dir.path(),
            r#"{ jobs: [{ css: "site.css", html: "page.html", output: "out.css" }] }"#,
        );
        let manifest = Manifest::load(&path).unwrap();
        let options = manifest.jobs[0].to_options(&JobSettings::default()).await.unwrap();
        assert_eq!(options.css, "a{color:red}");
        assert_eq!(options.page, PageSource::Html("<a>x</a>".into()));
    }
}
