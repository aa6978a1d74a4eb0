//! Selector profile: which selectors must be tested in the page, and what
//! to do with every selector node once the results come back.

use std::collections::HashSet;
use std::sync::LazyLock;

use critcss_core::options::CompiledPattern;
use regex::Regex;
use tracing::debug;

use crate::stylesheet::{SelectorId, SelectorList, StyleRule, Stylesheet};

static SELECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":?:(-moz-)?selection").expect("static regex"));

/// Pseudo-elements/classes whose presence doesn't change whether the base
/// element is on screen.
static ALLOWED_PSEUDOS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r":?:(?:before|after|visited|first-letter|first-line)").expect("static regex")
});

static ANY_PSEUDO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":{1,2}[a-zA-Z0-9\-_]*").expect("static regex"));

static VENDOR_PSEUDO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":?:-[a-z-]*").expect("static regex"));

/// What happens to one selector node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Drop,
    /// Keep iff this normalized selector is found critical in the page.
    Test(String),
}

impl Decision {
    pub fn keeps(&self, critical: &HashSet<String>) -> bool {
        match self {
            Self::Keep => true,
            Self::Drop => false,
            Self::Test(selector) => critical.contains(selector),
        }
    }
}

/// Decisions indexed by [`SelectorId`].
#[derive(Debug, Clone, Default)]
pub struct DecisionMap {
    slots: Vec<Option<Decision>>,
}

impl DecisionMap {
    pub fn with_slots(slots: usize) -> Self {
        Self {
            slots: vec![None; slots],
        }
    }

    pub fn insert(&mut self, id: SelectorId, decision: Decision) {
        let index = id.index();
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(decision);
    }

    pub fn get(&self, id: SelectorId) -> Option<&Decision> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    /// Number of nodes with a recorded decision.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|d| d.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectorProfile {
    /// Deduplicated, in first-seen order.
    pub selectors: Vec<String>,
    pub decisions: DecisionMap,
}

/// Classify one selector's text. Force lists are not consulted here.
pub fn normalize_selector(text: &str) -> Decision {
    let selector = text.trim();
    if !selector.contains(':') {
        return Decision::Test(selector.to_string());
    }
    if SELECTION.is_match(selector) {
        return Decision::Drop;
    }
    let stripped = ALLOWED_PSEUDOS.replace_all(selector, "");
    // Purely pseudo (`::-moz-placeholder`): nothing to look for in the DOM.
    if ANY_PSEUDO.replace_all(&stripped, "").trim().is_empty() {
        return Decision::Keep;
    }
    // `button::-moz-focus-inner` -> test for `button`.
    let stripped = VENDOR_PSEUDO.replace_all(&stripped, "");
    Decision::Test(stripped.trim().to_string())
}

/// Walk every style rule outside `@keyframes` and decide per selector node.
pub fn build_selector_profile(
    sheet: &Stylesheet,
    force_include: &[CompiledPattern],
    force_exclude: &[CompiledPattern],
) -> SelectorProfile {
    let mut decisions = DecisionMap::with_slots(sheet.selector_slots());
    let mut selectors = Vec::new();
    let mut seen = HashSet::new();

    sheet.for_each_style_rule(&mut |rule: &StyleRule| {
        let SelectorList::Parsed(list) = &rule.selectors else {
            return;
        };
        for selector in list {
            let text = selector.text.trim();
            let decision = if force_include.iter().any(|p| p.matches(text)) {
                Decision::Keep
            } else if force_exclude.iter().any(|p| p.matches(text)) {
                Decision::Drop
            } else {
                normalize_selector(text)
            };
            if let Decision::Test(normalized) = &decision {
                if seen.insert(normalized.clone()) {
                    selectors.push(normalized.clone());
                }
            }
            decisions.insert(selector.id, decision);
        }
    });

    debug!(
        nodes = decisions.len(),
        unique_selectors = selectors.len(),
        "Built selector profile"
    );
    SelectorProfile {
        selectors,
        decisions,
    }
}
