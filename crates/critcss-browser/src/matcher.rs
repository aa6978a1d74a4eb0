//! In-page critical selector matching.
//!
//! The page side is a self-contained script; the only thing crossing the
//! boundary is a JSON request going in and a JSON response coming out.

use std::collections::HashSet;

use critcss_core::{CriticalCssError, JobSettings, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::RenderPage;

const FIND_CRITICAL_SELECTORS: &str = include_str!("js/find_critical_selectors.js");
const REPLACE_PAGE_STYLES: &str = include_str!("js/replace_page_styles.js");

/// How the page waits out the render delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    Timer,
    /// Animation-frame polling; used when page scripts are disabled.
    Frame,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    pub selectors: Vec<String>,
    pub render_wait_time: u64,
    pub max_elements_to_check_per_selector: Option<usize>,
    pub viewport_height: u32,
    pub wait_strategy: WaitStrategy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResponse {
    pub critical_selectors: Vec<String>,
    /// Selectors the page's selector engine refused; treated as non-critical.
    #[serde(default)]
    pub invalid_selectors: Vec<String>,
}

impl MatchRequest {
    pub fn new(selectors: Vec<String>, settings: &JobSettings) -> Self {
        Self {
            selectors,
            render_wait_time: settings.render_wait_ms,
            max_elements_to_check_per_selector: settings.max_elements_to_check_per_selector,
            viewport_height: settings.height,
            wait_strategy: if settings.block_js_requests {
                WaitStrategy::Frame
            } else {
                WaitStrategy::Timer
            },
        }
    }

    /// The expression evaluated in the page.
    pub fn to_expression(&self) -> Result<String> {
        let request = serde_json::to_string(self)?;
        Ok(format!("({FIND_CRITICAL_SELECTORS})({request})"))
    }
}

/// Ask the page which of `request.selectors` match an element above the fold.
///
/// Whatever the page returns is restricted to the selectors that were asked
/// about.
pub async fn find_critical_selectors(
    page: &dyn RenderPage,
    request: &MatchRequest,
) -> Result<MatchResponse> {
    if request.selectors.is_empty() {
        return Ok(MatchResponse::default());
    }
    let value = page.evaluate(&request.to_expression()?).await?;
    let mut response: MatchResponse = serde_json::from_value(value).map_err(|e| {
        CriticalCssError::Browser(format!("Unexpected response from selector matching: {e}"))
    })?;

    let asked: HashSet<&str> = request.selectors.iter().map(String::as_str).collect();
    response.critical_selectors.retain(|s| asked.contains(s.as_str()));
    if !response.invalid_selectors.is_empty() {
        debug!(
            count = response.invalid_selectors.len(),
            selectors = ?response.invalid_selectors,
            "Page rejected selectors, treating them as non-critical"
        );
    }
    debug!(
        tested = request.selectors.len(),
        critical = response.critical_selectors.len(),
        "Selector matching finished"
    );
    Ok(response)
}

/// Expression replacing every stylesheet in the page with `css`.
pub fn replace_styles_expression(css: &str) -> Result<String> {
    let css = serde_json::to_string(css)?;
    Ok(format!("({REPLACE_PAGE_STYLES})({css})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let settings = JobSettings {
            height: 700,
            render_wait_ms: 250,
            max_elements_to_check_per_selector: Some(20),
            ..JobSettings::default()
        };
        let request = MatchRequest::new(vec![".a".into(), "#b".into()], &settings);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "selectors": [".a", "#b"],
                "renderWaitTime": 250,
                "maxElementsToCheckPerSelector": 20,
                "viewportHeight": 700,
                "waitStrategy": "frame",
            })
        );
    }

    #[test]
    fn test_wait_strategy_follows_js_blocking() {
        let settings = JobSettings {
            block_js_requests: false,
            ..JobSettings::default()
        };
        let request = MatchRequest::new(vec![], &settings);
        assert_eq!(request.wait_strategy, WaitStrategy::Timer);
        assert_eq!(request.max_elements_to_check_per_selector, None);
    }

    #[test]
    fn test_expression_invokes_script_with_request() {
        let request = MatchRequest::new(vec!["a[href=\"x\"]".into()], &JobSettings::default());
        let expression = request.to_expression().unwrap();
        assert!(expression.starts_with("(// Runs inside the page."));
        assert!(expression.contains("async function findCriticalSelectors"));
        assert!(expression.ends_with(r#"({"selectors":["a[href=\"x\"]"],"renderWaitTime":100,"maxElementsToCheckPerSelector":null,"viewportHeight":900,"waitStrategy":"frame"})"#));
    }

    #[test]
    fn test_response_parsing_defaults() {
        let response: MatchResponse =
            serde_json::from_str(r#"{"criticalSelectors": ["a"]}"#).unwrap();
        assert_eq!(response.critical_selectors, vec!["a".to_string()]);
        assert!(response.invalid_selectors.is_empty());
    }

    #[test]
    fn test_replace_styles_escapes_css() {
        let expression = replace_styles_expression("a{content:\"</style>\"}").unwrap();
        assert!(expression.ends_with(r#"("a{content:\"</style>\"}")"#));
    }
}
