//! Apply selector decisions to the tree and drop what becomes empty.

use std::collections::HashSet;

use tracing::debug;

use crate::profile::DecisionMap;
use crate::stylesheet::{Node, SelectorList, Stylesheet};

/// Remove every selector whose decision does not keep it, then every rule
/// left without selectors, then apply [`remove_empty`]. Returns the number
/// of selector nodes removed.
///
/// Selector nodes without a recorded decision are kept.
pub fn prune_non_critical(
    sheet: &mut Stylesheet,
    decisions: &DecisionMap,
    critical: &HashSet<String>,
) -> usize {
    let removed = prune_nodes(&mut sheet.rules, decisions, critical);
    remove_empty(sheet);
    debug!(removed_selectors = removed, "Pruned non-critical selectors");
    removed
}

fn prune_nodes(nodes: &mut Vec<Node>, decisions: &DecisionMap, critical: &HashSet<String>) -> usize {
    let mut removed = 0;
    nodes.retain_mut(|node| match node {
        Node::Style(rule) => match &mut rule.selectors {
            SelectorList::Malformed(raw) => {
                debug!(selector = %raw, "Dropping rule with malformed selector list");
                false
            }
            SelectorList::Parsed(list) => {
                let before = list.len();
                list.retain(|selector| {
                    decisions
                        .get(selector.id)
                        .is_none_or(|decision| decision.keeps(critical))
                });
                removed += before - list.len();
                !list.is_empty()
            }
        },
        Node::At(at) if at.is_keyframes() => true,
        Node::At(at) => {
            if let Some(children) = at.children_mut() {
                removed += prune_nodes(children, decisions, critical);
            }
            true
        }
    });
    removed
}

/// Enforce the at-rule keep policy at every depth:
/// `charset`/`import`/`namespace` and `font-face`/`keyframes`/`viewport`
/// stay, `media`/`document`/`supports` stay while they have children,
/// everything else goes. Style rules without declarations go too.
pub fn remove_empty(sheet: &mut Stylesheet) {
    cleanup_nodes(&mut sheet.rules);
}

fn cleanup_nodes(nodes: &mut Vec<Node>) {
    nodes.retain_mut(|node| match node {
        Node::Style(rule) => !rule.declarations.is_empty(),
        Node::At(at) => match at.base_name().as_str() {
            "charset" | "import" | "namespace" => true,
            "font-face" | "keyframes" | "viewport" => true,
            "media" | "document" | "supports" => match at.children_mut() {
                Some(children) => {
                    cleanup_nodes(children);
                    !children.is_empty()
                }
                None => false,
            },
            _ => false,
        },
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::profile::build_selector_profile;
    use crate::stylesheet::generate;

    fn critical(selectors: &[&str]) -> HashSet<String> {
        selectors.iter().map(|s| s.to_string()).collect()
    }

    fn prune_css(css: &str, keep: &[&str]) -> String {
        let mut sheet = parse(css).stylesheet;
        let profile = build_selector_profile(&sheet, &[], &[]);
        prune_non_critical(&mut sheet, &profile.decisions, &critical(keep));
        generate(&sheet)
    }

    #[test]
    fn test_drops_non_critical_selectors_and_empty_rules() {
        assert_eq!(
            prune_css("a,b{color:red}c{top:0}", &["a"]),
            "a{color:red}"
        );
    }

    #[test]
    fn test_containers_follow_children() {
        let css = "@charset \"utf-8\";@import url(x.css);\
                   @media screen{a{top:0}}@supports (display:grid){b{top:0}}\
                   @font-face{font-family:X;src:url(x.woff)}@keyframes k{from{top:0}}\
                   @page{margin:0}@layer base{a{top:0}}";
        assert_eq!(
            prune_css(css, &["a"]),
            "@charset \"utf-8\";@import url(x.css);@media screen{a{top:0}}\
             @font-face{font-family:X;src:url(x.woff)}@keyframes k{from{top:0}}"
        );
    }

    #[test]
    fn test_nested_containers_collapse() {
        assert_eq!(
            prune_css("@supports (display:grid){@media screen{b{top:0}}}a{top:0}", &["a"]),
            "a{top:0}"
        );
    }

    #[test]
    fn test_malformed_selector_list_drops_rule() {
        assert_eq!(prune_css("a,,b{top:0}c{top:0}", &["a", "b", "c"]), "c{top:0}");
    }

    #[test]
    fn test_undecided_selector_is_kept() {
        let mut sheet = parse("a{top:0}").stylesheet;
        prune_non_critical(&mut sheet, &DecisionMap::default(), &HashSet::new());
        assert_eq!(generate(&sheet), "a{top:0}");
    }

    #[test]
    fn test_pruning_is_idempotent() {
        let css = "a,b{color:red}@media screen{c,d{top:0}e{top:1px}}f::selection{color:blue}\
                   g:before{content:''}";
        let mut sheet = parse(css).stylesheet;
        let profile = build_selector_profile(&sheet, &[], &[]);
        let keep = critical(&["a", "d", "g"]);

        prune_non_critical(&mut sheet, &profile.decisions, &keep);
        let once = sheet.clone();
        let removed = prune_non_critical(&mut sheet, &profile.decisions, &keep);

        assert_eq!(removed, 0);
        assert_eq!(sheet, once);
        assert_eq!(generate(&sheet), "a{color:red}@media screen{d{top:0}}g:before{content:''}");
    }
}
