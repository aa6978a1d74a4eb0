//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::options::{JobSettings, compile_patterns};

/// Top-level critcss configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<BrowserConfig>,

    /// Defaults applied to every job; command-line flags override them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defaults: Option<JobSettings>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Browser process and page pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Path to Chrome/Chromium binary (auto-detected if omitted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chrome_path: Option<String>,

    /// Run in headless mode (default: true).
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Extra command-line switches passed to the browser.
    #[serde(default)]
    pub launch_args: Vec<String>,

    /// Maximum idle pages kept for reuse across jobs (default: 4).
    #[serde(default = "default_keep_open_pages")]
    pub keep_open_pages: usize,

    /// Pages opened eagerly when the browser launches (default: 0).
    #[serde(default)]
    pub prewarm_pages: usize,

    /// Never close the browser when the last job finishes.
    #[serde(default)]
    pub keep_alive: bool,

    /// Browser launch timeout in ms (default: 20000).
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_keep_open_pages() -> usize {
    4
}

fn default_launch_timeout() -> u64 {
    20_000
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            launch_args: Vec::new(),
            keep_open_pages: default_keep_open_pages(),
            prewarm_pages: 0,
            keep_alive: false,
            launch_timeout_ms: default_launch_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "critcss_browser=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::CriticalCssError::Io)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::CriticalCssError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn browser(&self) -> BrowserConfig {
        self.browser.clone().unwrap_or_default()
    }

    pub fn job_defaults(&self) -> JobSettings {
        self.defaults.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let browser = self.browser();
        if browser.prewarm_pages > browser.keep_open_pages {
            warnings.push(format!(
                "browser.prewarm_pages ({}) exceeds browser.keep_open_pages ({}); extra pages will be closed",
                browser.prewarm_pages, browser.keep_open_pages
            ));
        }
        if let Some(path) = &browser.chrome_path {
            if !Path::new(path).exists() {
                errors.push(format!("Chrome executable not found: {path}"));
            }
        }

        if let Some(defaults) = &self.defaults {
            if defaults.width == 0 || defaults.height == 0 {
                errors.push("defaults.width and defaults.height must be non-zero".to_string());
            }
            if defaults.timeout_ms == 0 {
                errors.push("defaults.timeout_ms cannot be 0".to_string());
            }
            if defaults.page_load_skip_timeout_ms >= defaults.timeout_ms {
                warnings.push(
                    "defaults.page_load_skip_timeout_ms is not below defaults.timeout_ms and will never fire"
                        .to_string(),
                );
            }
            for pattern in &defaults.properties_to_remove {
                if let Err(e) = regex::Regex::new(pattern) {
                    errors.push(format!("Invalid properties_to_remove pattern '{pattern}': {e}"));
                }
            }
            for patterns in [&defaults.force_include, &defaults.force_exclude] {
                if let Err(e) = compile_patterns(patterns) {
                    errors.push(e.to_string());
                }
            }
        }

        (warnings, errors)
    }
}

/// Base directory for critcss data: `~/.critcss/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".critcss")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ForcePattern;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_CRITCSS_UA", "my-agent") };
        let input = r#"{"ua": "${TEST_CRITCSS_UA}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("my-agent"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_CRITCSS_UA") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_CRITCSS_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#)); // empty string
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/critcss/config.json")).unwrap();
        assert!(config.browser.is_none());
        assert_eq!(config.job_defaults().width, 1300);
        assert_eq!(config.browser().keep_open_pages, 4);
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are fine in JSON5
                browser: { keep_open_pages: 2, keep_alive: true },
                defaults: {
                    width: 375,
                    height: 667,
                    force_include: [".hero", { source: "^\\.nav", flags: "i" }],
                },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        let browser = config.browser();
        assert_eq!(browser.keep_open_pages, 2);
        assert!(browser.keep_alive);
        assert!(browser.headless);

        let defaults = config.job_defaults();
        assert_eq!(defaults.width, 375);
        assert_eq!(defaults.timeout_ms, 30_000);
        assert_eq!(defaults.force_include[0], ForcePattern::Exact(".hero".into()));
    }

    #[test]
    fn test_load_invalid_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ browser: ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, crate::error::CriticalCssError::Config(_)));
    }

    #[test]
    fn test_logging_config_defaults() {
        let json_str = r#"{ "logging": {} }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_bad_patterns_errors() {
        let config = Config {
            defaults: Some(JobSettings {
                properties_to_remove: vec!["(unclosed".into()],
                force_include: vec![ForcePattern::regex("[", "")],
                ..JobSettings::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert_eq!(errors.len(), 2, "got: {errors:?}");
    }

    #[test]
    fn test_validate_prewarm_warns() {
        let config = Config {
            browser: Some(BrowserConfig {
                prewarm_pages: 8,
                keep_open_pages: 2,
                ..BrowserConfig::default()
            }),
            ..Config::default()
        };
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty());
        assert!(
            warnings.iter().any(|w| w.contains("prewarm_pages")),
            "Expected prewarm warning, got: {warnings:?}"
        );
    }
}
