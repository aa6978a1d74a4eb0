//! Per-job options and the pattern type used by force-include/force-exclude.

use std::collections::BTreeMap;
use std::path::PathBuf;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{CriticalCssError, Result};

/// Where the page to inspect comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSource {
    Url(String),
    Html(String),
}

/// A selector pattern that overrides DOM matching.
///
/// Deserializes from a plain string (exact selector match) or from
/// `{ "source": "...", "flags": "i" }` (regular expression). The pattern is
/// always carried as source + flags, never as a compiled object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ForcePattern {
    Exact(String),
    Regex {
        source: String,
        #[serde(default)]
        flags: String,
    },
}

/// A [`ForcePattern`] ready for matching.
#[derive(Debug, Clone)]
pub enum CompiledPattern {
    Exact(String),
    Regex(Regex),
}

impl ForcePattern {
    pub fn regex(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Self::Regex {
            source: source.into(),
            flags: flags.into(),
        }
    }

    pub fn compile(&self) -> Result<CompiledPattern> {
        match self {
            Self::Exact(s) => Ok(CompiledPattern::Exact(s.clone())),
            Self::Regex { source, flags } => {
                let mut builder = RegexBuilder::new(source);
                for flag in flags.chars() {
                    match flag {
                        'i' => {
                            builder.case_insensitive(true);
                        }
                        'm' => {
                            builder.multi_line(true);
                        }
                        's' => {
                            builder.dot_matches_new_line(true);
                        }
                        'x' => {
                            builder.ignore_whitespace(true);
                        }
                        // Stateful/encoding flags have no meaning for a single test.
                        'g' | 'u' | 'y' | 'd' => {}
                        other => {
                            return Err(CriticalCssError::Input(format!(
                                "Unsupported regular expression flag '{other}' in /{source}/{flags}"
                            )));
                        }
                    }
                }
                builder.build().map(CompiledPattern::Regex).map_err(|e| {
                    CriticalCssError::Input(format!("Invalid regular expression /{source}/: {e}"))
                })
            }
        }
    }
}

impl From<&str> for ForcePattern {
    fn from(s: &str) -> Self {
        Self::Exact(s.to_string())
    }
}

impl CompiledPattern {
    pub fn matches(&self, selector: &str) -> bool {
        match self {
            Self::Exact(s) => s == selector,
            Self::Regex(re) => re.is_match(selector),
        }
    }
}

/// Compile a whole pattern list, failing on the first bad entry.
pub fn compile_patterns(patterns: &[ForcePattern]) -> Result<Vec<CompiledPattern>> {
    patterns.iter().map(ForcePattern::compile).collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenshotFormat {
    #[default]
    Png,
    Jpeg,
}

impl ScreenshotFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }
}

/// Before/after screenshots of the page, written next to `base_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotOptions {
    pub base_path: PathBuf,

    #[serde(default)]
    pub format: ScreenshotFormat,

    /// JPEG quality 0-100, ignored for PNG.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
}

impl ScreenshotOptions {
    pub fn path_for(&self, suffix: &str) -> PathBuf {
        let mut name = self.base_path.as_os_str().to_owned();
        name.push(format!("-{suffix}.{}", self.format.extension()));
        PathBuf::from(name)
    }
}

/// Every tunable of a job except its inputs. Also the shape of the config
/// file's `defaults` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Global per-job timeout in ms.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Pause before DOM matching so script-built pages can finish.
    #[serde(default = "default_render_wait")]
    pub render_wait_ms: u64,

    #[serde(default)]
    pub force_include: Vec<ForcePattern>,

    #[serde(default)]
    pub force_exclude: Vec<ForcePattern>,

    /// Regular expressions matched (unanchored) against property names.
    #[serde(default = "default_properties_to_remove")]
    pub properties_to_remove: Vec<String>,

    #[serde(default = "default_max_embedded_base64_length")]
    pub max_embedded_base64_length: usize,

    #[serde(default)]
    pub keep_larger_media_queries: bool,

    /// Stop waiting for the page load after this many ms (0 = wait for load).
    #[serde(default)]
    pub page_load_skip_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub block_js_requests: bool,

    #[serde(default)]
    pub custom_page_headers: BTreeMap<String, String>,

    /// Fail on the first stylesheet parse error instead of recovering.
    #[serde(default)]
    pub strict: bool,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_elements_to_check_per_selector: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshots: Option<ScreenshotOptions>,
}

fn default_true() -> bool {
    true
}

fn default_width() -> u32 {
    1300
}

fn default_height() -> u32 {
    900
}

fn default_timeout() -> u64 {
    30_000
}

fn default_render_wait() -> u64 {
    100
}

fn default_max_embedded_base64_length() -> usize {
    1000
}

fn default_user_agent() -> String {
    "critcss Critical Path CSS Generator".into()
}

fn default_properties_to_remove() -> Vec<String> {
    vec![
        "(.*)transition(.*)".into(),
        "cursor".into(),
        "pointer-events".into(),
        "(-webkit-)?tap-highlight-color".into(),
        "(.*)user-select".into(),
    ]
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            timeout_ms: default_timeout(),
            render_wait_ms: default_render_wait(),
            force_include: Vec::new(),
            force_exclude: Vec::new(),
            properties_to_remove: default_properties_to_remove(),
            max_embedded_base64_length: default_max_embedded_base64_length(),
            keep_larger_media_queries: false,
            page_load_skip_timeout_ms: 0,
            block_js_requests: true,
            custom_page_headers: BTreeMap::new(),
            strict: false,
            user_agent: default_user_agent(),
            max_elements_to_check_per_selector: None,
            screenshots: None,
        }
    }
}

/// A complete request for one critical css computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub css: String,
    pub page: PageSource,
    #[serde(flatten)]
    pub settings: JobSettings,
}

impl JobOptions {
    pub fn new(css: impl Into<String>, page: PageSource) -> Self {
        Self {
            css: css.into(),
            page,
            settings: JobSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Reject inputs that can never produce a result. No retry applies to these.
    pub fn validate(&self) -> Result<()> {
        if self.css.trim().is_empty() {
            return Err(CriticalCssError::Input("Stylesheet is missing or empty".into()));
        }
        match &self.page {
            PageSource::Url(u) => {
                url::Url::parse(u)
                    .map_err(|e| CriticalCssError::Input(format!("Invalid url '{u}': {e}")))?;
            }
            PageSource::Html(html) => {
                if html.trim().is_empty() {
                    return Err(CriticalCssError::Input("Page html is empty".into()));
                }
            }
        }
        if self.settings.width == 0 || self.settings.height == 0 {
            return Err(CriticalCssError::Input(format!(
                "Viewport must be non-zero, got {}x{}",
                self.settings.width, self.settings.height
            )));
        }
        if self.settings.timeout_ms == 0 {
            return Err(CriticalCssError::Input("Timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Short label for logs.
    pub fn page_label(&self) -> &str {
        match &self.page {
            PageSource::Url(u) => u,
            PageSource::Html(_) => "<inline html>",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_pattern_deser_forms() {
        let patterns: Vec<ForcePattern> =
            serde_json::from_str(r#"[".hero", {"source": "^\\.btn", "flags": "i"}]"#).unwrap();
        assert_eq!(patterns[0], ForcePattern::Exact(".hero".into()));
        assert_eq!(patterns[1], ForcePattern::regex("^\\.btn", "i"));
    }

    #[test]
    fn test_force_pattern_matching() {
        let exact = ForcePattern::from(".hero").compile().unwrap();
        assert!(exact.matches(".hero"));
        assert!(!exact.matches(".hero .title"));

        let re = ForcePattern::regex("^\\.BTN", "gi").compile().unwrap();
        assert!(re.matches(".btn-primary"));
        assert!(!re.matches("a .btn"));
    }

    #[test]
    fn test_force_pattern_bad_flag() {
        let err = ForcePattern::regex("a", "q").compile().unwrap_err();
        assert!(err.to_string().contains("'q'"), "got: {err}");
    }

    #[test]
    fn test_settings_defaults_from_empty_object() {
        let settings: JobSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, JobSettings::default());
        assert_eq!(settings.width, 1300);
        assert_eq!(settings.height, 900);
        assert!(settings.block_js_requests);
        assert_eq!(settings.properties_to_remove.len(), 5);
    }

    #[test]
    fn test_validate_inputs() {
        let ok = JobOptions::new("a{color:red}", PageSource::Url("https://example.com".into()));
        assert!(ok.validate().is_ok());

        let empty = JobOptions::new("   ", PageSource::Url("https://example.com".into()));
        assert!(matches!(empty.validate(), Err(CriticalCssError::Input(_))));

        let bad_url = JobOptions::new("a{}", PageSource::Url("not a url".into()));
        let err = bad_url.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid url"), "got: {err}");
    }

    #[test]
    fn test_screenshot_paths() {
        let shots = ScreenshotOptions {
            base_path: PathBuf::from("/tmp/home"),
            format: ScreenshotFormat::Jpeg,
            quality: Some(80),
        };
        assert_eq!(shots.path_for("before"), PathBuf::from("/tmp/home-before.jpg"));
    }
}
