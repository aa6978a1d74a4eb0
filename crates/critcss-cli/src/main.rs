use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use critcss_browser::Orchestrator;
use critcss_browser::chromium::ChromiumLauncher;
use critcss_core::config::{BrowserConfig, Config, LoggingConfig};
use critcss_core::{ForcePattern, JobOptions, JobSettings, PageSource, ScreenshotOptions};
use tracing_subscriber::EnvFilter;

mod batch;

#[derive(Parser)]
#[command(
    name = "critcss",
    about = "Critical path CSS generator: keeps the rules a page needs to render above the fold",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate critical css for one page
    Generate(GenerateArgs),

    /// Run every job of a JSON5 manifest on one shared browser
    Batch {
        /// Path to the manifest
        manifest: PathBuf,

        /// Jobs in flight at once (overrides the manifest)
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

#[derive(Args)]
struct GenerateArgs {
    /// Stylesheet to reduce
    css: PathBuf,

    /// Page to render
    #[arg(long, required_unless_present = "html", conflicts_with = "html")]
    url: Option<String>,

    /// Render this html file instead of a url
    #[arg(long)]
    html: Option<PathBuf>,

    /// Write the critical css here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Global job timeout in ms
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    render_wait_ms: Option<u64>,

    /// Stop waiting for the page load after this many ms
    #[arg(long)]
    page_load_skip_timeout_ms: Option<u64>,

    /// Selector to always keep; `/source/flags` for a regular expression
    #[arg(long = "force-include", value_name = "PATTERN")]
    force_include: Vec<String>,

    /// Selector to always drop; `/source/flags` for a regular expression
    #[arg(long = "force-exclude", value_name = "PATTERN")]
    force_exclude: Vec<String>,

    #[arg(long)]
    keep_larger_media_queries: bool,

    /// Let the page load and run its scripts
    #[arg(long)]
    allow_js: bool,

    /// Fail on stylesheet parse errors
    #[arg(long)]
    strict: bool,

    #[arg(long)]
    user_agent: Option<String>,

    /// Extra request header, `name: value`
    #[arg(long = "header", value_name = "HEADER", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Save before/after screenshots as `<base>-before.png` and `<base>-after.png`
    #[arg(long, value_name = "BASE")]
    screenshots: Option<PathBuf>,

    /// Print job counters as JSON to stderr
    #[arg(long)]
    report: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected `name: value`, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header name is empty in '{raw}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// `/^\.nav/i` is a regular expression, anything else an exact selector.
fn parse_force_pattern(raw: &str) -> ForcePattern {
    if let Some(rest) = raw.strip_prefix('/') {
        if let Some(end) = rest.rfind('/') {
            let (source, flags) = rest.split_at(end);
            return ForcePattern::regex(source, &flags[1..]);
        }
    }
    ForcePattern::Exact(raw.to_string())
}

impl GenerateArgs {
    /// Command-line flags on top of the configured defaults.
    fn apply(&self, mut settings: JobSettings) -> JobSettings {
        if let Some(width) = self.width {
            settings.width = width;
        }
        if let Some(height) = self.height {
            settings.height = height;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            settings.timeout_ms = timeout_ms;
        }
        if let Some(render_wait_ms) = self.render_wait_ms {
            settings.render_wait_ms = render_wait_ms;
        }
        if let Some(skip) = self.page_load_skip_timeout_ms {
            settings.page_load_skip_timeout_ms = skip;
        }
        settings
            .force_include
            .extend(self.force_include.iter().map(|p| parse_force_pattern(p)));
        settings
            .force_exclude
            .extend(self.force_exclude.iter().map(|p| parse_force_pattern(p)));
        if self.keep_larger_media_queries {
            settings.keep_larger_media_queries = true;
        }
        if self.allow_js {
            settings.block_js_requests = false;
        }
        if self.strict {
            settings.strict = true;
        }
        if let Some(user_agent) = &self.user_agent {
            settings.user_agent = user_agent.clone();
        }
        settings.custom_page_headers.extend(self.headers.iter().cloned());
        if let Some(base_path) = &self.screenshots {
            settings.screenshots = Some(ScreenshotOptions {
                base_path: base_path.clone(),
                format: Default::default(),
                quality: None,
            });
        }
        settings
    }

    fn page_source(&self) -> anyhow::Result<PageSource> {
        match (&self.url, &self.html) {
            (Some(url), _) => Ok(PageSource::Url(url.clone())),
            (None, Some(path)) => {
                let html = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read html file {}", path.display()))?;
                Ok(PageSource::Html(html))
            }
            (None, None) => anyhow::bail!("Either --url or --html is required"),
        }
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let mut directives = vec![if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".to_string())
    }];
    directives.extend(logging.filters.iter().cloned());

    // RUST_LOG wins unless --verbose was given.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(env) if !verbose => env,
        _ => EnvFilter::try_new(directives.join(","))
            .with_context(|| format!("Invalid log filter '{}'", directives.join(",")))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).try_init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).try_init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).try_init(),
        _ => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

fn chromium_orchestrator(browser: BrowserConfig) -> Orchestrator {
    let launcher = Arc::new(ChromiumLauncher::new(browser.clone()));
    Orchestrator::new(browser, launcher)
}

async fn generate(config: &Config, args: GenerateArgs) -> anyhow::Result<()> {
    let css = std::fs::read_to_string(&args.css)
        .with_context(|| format!("Failed to read stylesheet {}", args.css.display()))?;
    let options = JobOptions::new(css, args.page_source()?).with_settings(args.apply(config.job_defaults()));

    let orchestrator = chromium_orchestrator(config.browser());
    let result = tokio::select! {
        result = orchestrator.generate_with_report(&options) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, closing browser");
            orchestrator.close().await;
            anyhow::bail!("Interrupted");
        }
    };
    orchestrator.close().await;
    let result = result?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, &result.css)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), bytes = result.css.len(), "Wrote critical css");
        }
        None => println!("{}", result.css),
    }
    if args.report {
        eprintln!("{}", serde_json::to_string_pretty(&result.stats)?);
    }
    Ok(())
}

async fn run_batch(config: &Config, manifest_path: PathBuf, concurrency: Option<usize>) -> anyhow::Result<()> {
    let mut manifest = batch::Manifest::load(&manifest_path)?;
    if let Some(concurrency) = concurrency {
        manifest.concurrency = concurrency.max(1);
    }

    // One browser for the whole run, closed once at the end.
    let browser = BrowserConfig {
        keep_alive: true,
        ..config.browser()
    };
    let orchestrator = chromium_orchestrator(browser);
    let defaults = config.job_defaults();

    let summary = tokio::select! {
        summary = batch::run(&orchestrator, &manifest, &defaults) => summary,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, closing browser");
            orchestrator.close().await;
            anyhow::bail!("Interrupted");
        }
    };
    orchestrator.close().await;

    tracing::info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        "Batch finished"
    );
    if summary.failed > 0 {
        anyhow::bail!("{} of {} jobs failed", summary.failed, summary.total());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli.config.clone().unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    init_logging(&config.logging(), cli.verbose)?;

    match cli.command {
        Commands::Generate(args) => generate(&config, args).await?,
        Commands::Batch {
            manifest,
            concurrency,
        } => run_batch(&config, manifest, concurrency).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} has {} error(s)", config_path.display(), errors.len());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
    }

    Ok(())
}
