//! Cleanup passes run on the pruned tree.

use std::collections::HashSet;
use std::sync::LazyLock;

use critcss_core::{CriticalCssError, Result};
use regex::Regex;
use tracing::debug;

use crate::parser::split_top_level_commas;
use crate::prune::remove_empty;
use crate::stylesheet::{AtRule, Declaration, Node, StyleRule, Stylesheet};

static EMBEDDED_BASE64: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"data:[^,]*;base64,").expect("static regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostFormatStats {
    pub removed_keyframes: usize,
    pub removed_font_faces: usize,
    pub removed_declarations: usize,
}

/// Compile `properties_to_remove` entries.
pub fn compile_property_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| {
                CriticalCssError::Input(format!("Invalid property pattern '{p}': {e}"))
            })
        })
        .collect()
}

/// Run all passes, then drop containers the passes emptied.
pub fn post_format(
    sheet: &mut Stylesheet,
    max_embedded_base64_length: usize,
    properties_to_remove: &[Regex],
) -> PostFormatStats {
    let mut stats = PostFormatStats {
        removed_keyframes: remove_unused_keyframes(sheet),
        ..PostFormatStats::default()
    };
    stats.removed_font_faces = remove_unused_font_faces(sheet);
    let (declarations, font_faces) = remove_embedded_base64(sheet, max_embedded_base64_length);
    stats.removed_declarations = declarations;
    stats.removed_font_faces += font_faces;
    stats.removed_declarations += remove_properties(sheet, properties_to_remove);
    remove_empty(sheet);
    debug!(?stats, "Post-formatted stylesheet");
    stats
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value)
}

fn style_declarations(sheet: &Stylesheet) -> Vec<&Declaration> {
    let mut out = Vec::new();
    collect_declarations(&sheet.rules, &mut out);
    out
}

fn collect_declarations<'a>(nodes: &'a [Node], out: &mut Vec<&'a Declaration>) {
    for node in nodes {
        match node {
            Node::Style(rule) => out.extend(rule.declarations.iter()),
            Node::At(at) if at.is_keyframes() => {}
            Node::At(at) => {
                if let Some(children) = at.children() {
                    collect_declarations(children, out);
                }
            }
        }
    }
}

/// Drop at-rules anywhere in the tree for which `keep` is false.
fn retain_at_rules(nodes: &mut Vec<Node>, keep: &mut impl FnMut(&mut AtRule) -> bool) -> usize {
    let before = nodes.len();
    nodes.retain_mut(|node| match node {
        Node::At(at) => keep(at),
        Node::Style(_) => true,
    });
    let mut removed = before - nodes.len();
    for node in nodes.iter_mut() {
        if let Node::At(at) = node {
            if at.is_keyframes() {
                continue;
            }
            if let Some(children) = at.children_mut() {
                removed += retain_at_rules(children, keep);
            }
        }
    }
    removed
}

/// Visit every style rule at any depth, keyframe steps included.
fn for_each_style_rule_mut(nodes: &mut [Node], f: &mut impl FnMut(&mut StyleRule)) {
    for node in nodes {
        match node {
            Node::Style(rule) => f(rule),
            Node::At(at) => {
                if let Some(children) = at.children_mut() {
                    for_each_style_rule_mut(children, f);
                }
            }
        }
    }
}

/// Animation names referenced by `animation` and `animation-name`.
///
/// Every token of an `animation` layer counts, since the name need not come
/// first (`animation: 1s ease-in spin`).
fn used_animation_names(sheet: &Stylesheet) -> HashSet<String> {
    let mut used = HashSet::new();
    for declaration in style_declarations(sheet) {
        match declaration.base_property().as_str() {
            "animation-name" => {
                for name in split_top_level_commas(&declaration.value) {
                    used.insert(unquote(name).to_string());
                }
            }
            "animation" => {
                for layer in split_top_level_commas(&declaration.value) {
                    for token in layer.split_whitespace() {
                        used.insert(unquote(token).to_string());
                    }
                }
            }
            _ => {}
        }
    }
    used
}

pub fn remove_unused_keyframes(sheet: &mut Stylesheet) -> usize {
    let used = used_animation_names(sheet);
    retain_at_rules(&mut sheet.rules, &mut |at: &mut AtRule| {
        if !at.is_keyframes() {
            return true;
        }
        let name = unquote(&at.prelude);
        let keep = used.contains(name);
        if !keep {
            debug!(keyframes = name, "Removing unused keyframes");
        }
        keep
    })
}

pub fn remove_unused_font_faces(sheet: &mut Stylesheet) -> usize {
    let referenced: Vec<String> = style_declarations(sheet)
        .into_iter()
        .filter(|d| matches!(d.base_property().as_str(), "font-family" | "font"))
        .map(|d| d.value.clone())
        .collect();
    retain_at_rules(&mut sheet.rules, &mut |at: &mut AtRule| {
        if at.base_name() != "font-face" {
            return true;
        }
        let Some(family) = at.descriptor("font-family").map(unquote) else {
            return false;
        };
        let keep = referenced.iter().any(|value| value.contains(family));
        if !keep {
            debug!(family, "Removing unused font-face");
        }
        keep
    })
}

fn is_oversized(declaration: &Declaration, max_length: usize) -> bool {
    declaration.value.len() > max_length && EMBEDDED_BASE64.is_match(&declaration.value)
}

/// Returns (declarations removed from style rules, font-face rules removed).
pub fn remove_embedded_base64(sheet: &mut Stylesheet, max_length: usize) -> (usize, usize) {
    let mut removed = 0;
    for_each_style_rule_mut(&mut sheet.rules, &mut |rule: &mut StyleRule| {
        let before = rule.declarations.len();
        rule.declarations.retain(|d| !is_oversized(d, max_length));
        removed += before - rule.declarations.len();
    });

    let font_faces = retain_at_rules(&mut sheet.rules, &mut |at: &mut AtRule| {
        if at.base_name() != "font-face" {
            return true;
        }
        let Some(declarations) = at.declarations_mut() else {
            return true;
        };
        let had_src = declarations.iter().any(|d| d.property.eq_ignore_ascii_case("src"));
        declarations.retain(|d| !is_oversized(d, max_length));
        let has_src = declarations.iter().any(|d| d.property.eq_ignore_ascii_case("src"));
        !had_src || has_src
    });
    (removed, font_faces)
}

pub fn remove_properties(sheet: &mut Stylesheet, patterns: &[Regex]) -> usize {
    if patterns.is_empty() {
        return 0;
    }
    let mut removed = 0;
    for_each_style_rule_mut(&mut sheet.rules, &mut |rule: &mut StyleRule| {
        let before = rule.declarations.len();
        rule.declarations
            .retain(|d| !patterns.iter().any(|re| re.is_match(&d.property)));
        removed += before - rule.declarations.len();
    });
    removed
}
