//! The CSS half of critical css generation.
//!
//! [`prepare`] does everything that needs no browser (parse, media filter,
//! selector profile). The selectors it yields are tested in a rendered page,
//! and [`PreparedStylesheet::finalize`] turns the surviving set into CSS text.

pub mod media_query;
pub mod parser;
pub mod postformat;
pub mod profile;
pub mod prune;
pub mod stylesheet;

use std::collections::HashSet;

use critcss_core::options::compile_patterns;
use critcss_core::{CriticalCssError, JobSettings, Result};
use regex::Regex;
use tracing::{debug, warn};

pub use media_query::{MatchConfig, filter_media_queries};
pub use parser::{ParseIssue, ParsedStylesheet, parse};
pub use postformat::{PostFormatStats, post_format};
pub use profile::{Decision, DecisionMap, SelectorProfile, build_selector_profile};
pub use prune::{prune_non_critical, remove_empty};
pub use stylesheet::{Stylesheet, generate};

/// A parsed, media-filtered stylesheet and its selector profile.
#[derive(Debug, Clone)]
pub struct PreparedStylesheet {
    pub stylesheet: Stylesheet,
    pub profile: SelectorProfile,
    pub issues: Vec<ParseIssue>,
    /// Style rules in the stylesheet as parsed.
    pub input_rules: usize,
    pub removed_media_rules: usize,
    properties_to_remove: Vec<Regex>,
    max_embedded_base64_length: usize,
}

#[derive(Debug, Clone)]
pub struct FinalizedCss {
    pub css: String,
    pub output_rules: usize,
    pub post_format: PostFormatStats,
}

/// Parse `css` and run every stage that can happen before the page is ready.
///
/// In strict mode the first parse issue fails the job; otherwise the
/// recovered tree is used.
pub fn prepare(css: &str, settings: &JobSettings) -> Result<PreparedStylesheet> {
    let ParsedStylesheet {
        mut stylesheet,
        issues,
    } = parse(css);
    if let Some(first) = issues.first() {
        if settings.strict {
            return Err(CriticalCssError::Parse(first.to_string()));
        }
        warn!(
            count = issues.len(),
            first = %first,
            "Stylesheet had parse errors, continuing with the recovered rules"
        );
    }

    let force_include = compile_patterns(&settings.force_include)?;
    let force_exclude = compile_patterns(&settings.force_exclude)?;
    let properties_to_remove = postformat::compile_property_patterns(&settings.properties_to_remove)?;

    let input_rules = stylesheet.style_rule_count();
    let config = MatchConfig::new(
        settings.width,
        settings.height,
        settings.keep_larger_media_queries,
    );
    let removed_media_rules = filter_media_queries(&mut stylesheet, &config);
    let profile = build_selector_profile(&stylesheet, &force_include, &force_exclude);
    debug!(
        input_rules,
        removed_media_rules,
        selectors = profile.selectors.len(),
        "Prepared stylesheet"
    );

    Ok(PreparedStylesheet {
        stylesheet,
        profile,
        issues,
        input_rules,
        removed_media_rules,
        properties_to_remove,
        max_embedded_base64_length: settings.max_embedded_base64_length,
    })
}

impl PreparedStylesheet {
    /// Selectors that need a DOM answer.
    pub fn selectors(&self) -> &[String] {
        &self.profile.selectors
    }

    /// Prune with the selectors found critical, post-format and serialize.
    pub fn finalize<I, S>(self, critical: I) -> FinalizedCss
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let critical: HashSet<String> = critical.into_iter().map(Into::into).collect();
        let mut stylesheet = self.stylesheet;
        prune_non_critical(&mut stylesheet, &self.profile.decisions, &critical);
        let post_format = post_format(
            &mut stylesheet,
            self.max_embedded_base64_length,
            &self.properties_to_remove,
        );
        FinalizedCss {
            output_rules: stylesheet.style_rule_count(),
            css: generate(&stylesheet),
            post_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_mode_fails_on_first_issue() {
        let settings = JobSettings {
            strict: true,
            ..JobSettings::default()
        };
        let err = prepare("a{color:red}}b{top:0}", &settings).unwrap_err();
        assert!(matches!(err, CriticalCssError::Parse(_)), "got: {err}");
        assert!(err.to_string().contains("line 1"), "got: {err}");
    }

    #[test]
    fn test_lenient_mode_recovers() {
        let prepared = prepare("a{color:red}}b{top:0}", &JobSettings::default()).unwrap();
        assert_eq!(prepared.issues.len(), 1);
        assert_eq!(prepared.selectors(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_bad_force_pattern_is_input_error() {
        let settings = JobSettings {
            force_include: vec![critcss_core::ForcePattern::regex("(", "")],
            ..JobSettings::default()
        };
        let err = prepare("a{top:0}", &settings).unwrap_err();
        assert!(matches!(err, CriticalCssError::Input(_)));
    }

    #[test]
    fn test_prepare_then_finalize() {
        let css = "@media print{a{color:black}}a{color:red;cursor:pointer}b{top:0}";
        let prepared = prepare(css, &JobSettings::default()).unwrap();
        assert_eq!(prepared.input_rules, 3);
        assert_eq!(prepared.removed_media_rules, 1);
        assert_eq!(prepared.selectors(), ["a".to_string(), "b".to_string()]);

        let finalized = prepared.finalize(["a"]);
        assert_eq!(finalized.css, "a{color:red}");
        assert_eq!(finalized.output_rules, 1);
        assert_eq!(finalized.post_format.removed_declarations, 1);
    }
}
