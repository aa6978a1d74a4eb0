//! Owned stylesheet tree and its serializer.
//!
//! Selector nodes carry a [`SelectorId`] handed out at parse time. Two
//! textually identical selectors in different rules get different ids, which
//! is what lets per-selector decisions live in a plain index table.

use std::fmt::Write as _;

/// Stable handle of one selector node within a [`Stylesheet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SelectorId(pub(crate) u32);

impl SelectorId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stylesheet {
    pub rules: Vec<Node>,
    selector_slots: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Style(StyleRule),
    At(AtRule),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StyleRule {
    pub selectors: SelectorList,
    pub declarations: Vec<Declaration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectorList {
    Parsed(Vec<Selector>),
    /// A prelude that could not be split into a proper selector list; kept
    /// verbatim so the pruner can decide what to do with it.
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub id: SelectorId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AtRule {
    /// Name as authored, without the `@`.
    pub name: String,
    pub prelude: String,
    pub block: Option<AtRuleBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AtRuleBlock {
    Rules(Vec<Node>),
    Declarations(Vec<Declaration>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub property: String,
    pub value: String,
    pub important: bool,
}

impl Declaration {
    pub fn new(property: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            value: value.into(),
            important: false,
        }
    }

    /// Lowercased property name with any vendor prefix removed.
    pub fn base_property(&self) -> String {
        unprefixed(&self.property)
    }
}

impl AtRule {
    /// Lowercased at-rule name with any vendor prefix removed
    /// (`-webkit-keyframes` -> `keyframes`).
    pub fn base_name(&self) -> String {
        unprefixed(&self.name)
    }

    pub fn is_keyframes(&self) -> bool {
        self.base_name() == "keyframes"
    }

    pub fn children(&self) -> Option<&Vec<Node>> {
        match &self.block {
            Some(AtRuleBlock::Rules(children)) => Some(children),
            _ => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Node>> {
        match &mut self.block {
            Some(AtRuleBlock::Rules(children)) => Some(children),
            _ => None,
        }
    }

    pub fn declarations(&self) -> Option<&Vec<Declaration>> {
        match &self.block {
            Some(AtRuleBlock::Declarations(declarations)) => Some(declarations),
            _ => None,
        }
    }

    pub fn declarations_mut(&mut self) -> Option<&mut Vec<Declaration>> {
        match &mut self.block {
            Some(AtRuleBlock::Declarations(declarations)) => Some(declarations),
            _ => None,
        }
    }

    /// Last value declared for `property` in a descriptor block.
    pub fn descriptor(&self, property: &str) -> Option<&str> {
        self.declarations()?
            .iter()
            .rev()
            .find(|d| d.property.eq_ignore_ascii_case(property))
            .map(|d| d.value.as_str())
    }
}

fn unprefixed(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if let Some(rest) = lower.strip_prefix('-') {
        if let Some((vendor, base)) = rest.split_once('-') {
            if !vendor.is_empty() {
                return base.to_string();
            }
        }
    }
    lower
}

impl Stylesheet {
    pub(crate) fn from_parts(rules: Vec<Node>, selector_slots: u32) -> Self {
        Self {
            rules,
            selector_slots,
        }
    }

    /// Upper bound (exclusive) of the selector ids in this tree.
    pub fn selector_slots(&self) -> usize {
        self.selector_slots as usize
    }

    /// Number of style rules, not counting keyframe steps.
    pub fn style_rule_count(&self) -> usize {
        fn count(nodes: &[Node]) -> usize {
            nodes
                .iter()
                .map(|node| match node {
                    Node::Style(_) => 1,
                    Node::At(at) if at.is_keyframes() => 0,
                    Node::At(at) => at.children().map_or(0, |c| count(c)),
                })
                .sum()
        }
        count(&self.rules)
    }

    /// Visit every style rule outside `@keyframes`, at any nesting depth.
    pub fn for_each_style_rule(&self, f: &mut impl FnMut(&StyleRule)) {
        fn walk(nodes: &[Node], f: &mut impl FnMut(&StyleRule)) {
            for node in nodes {
                match node {
                    Node::Style(rule) => f(rule),
                    Node::At(at) if at.is_keyframes() => {}
                    Node::At(at) => {
                        if let Some(children) = at.children() {
                            walk(children, f);
                        }
                    }
                }
            }
        }
        walk(&self.rules, f);
    }

    /// Visit every at-rule (including nested ones) mutably, parents first.
    pub fn for_each_at_rule_mut(&mut self, f: &mut impl FnMut(&mut AtRule)) {
        fn walk(nodes: &mut [Node], f: &mut impl FnMut(&mut AtRule)) {
            for node in nodes {
                if let Node::At(at) = node {
                    f(at);
                    if let Some(children) = at.children_mut() {
                        walk(children, f);
                    }
                }
            }
        }
        walk(&mut self.rules, f);
    }
}

/// Serialize the tree to compact CSS text.
pub fn generate(sheet: &Stylesheet) -> String {
    let mut out = String::new();
    write_nodes(&sheet.rules, &mut out);
    out
}

fn write_nodes(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Style(rule) => write_style_rule(rule, out),
            Node::At(at) => write_at_rule(at, out),
        }
    }
}

fn write_style_rule(rule: &StyleRule, out: &mut String) {
    match &rule.selectors {
        SelectorList::Parsed(selectors) => {
            for (i, selector) in selectors.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&selector.text);
            }
        }
        SelectorList::Malformed(raw) => out.push_str(raw),
    }
    write_declaration_block(&rule.declarations, out);
}

fn write_at_rule(at: &AtRule, out: &mut String) {
    out.push('@');
    out.push_str(&at.name);
    if !at.prelude.is_empty() {
        out.push(' ');
        out.push_str(&at.prelude);
    }
    match &at.block {
        None => out.push(';'),
        Some(AtRuleBlock::Declarations(declarations)) => write_declaration_block(declarations, out),
        Some(AtRuleBlock::Rules(children)) => {
            out.push('{');
            write_nodes(children, out);
            out.push('}');
        }
    }
}

fn write_declaration_block(declarations: &[Declaration], out: &mut String) {
    out.push('{');
    for (i, declaration) in declarations.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        let _ = write!(out, "{}:{}", declaration.property, declaration.value);
        if declaration.important {
            out.push_str("!important");
        }
    }
    out.push('}');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(id: u32, text: &str) -> Selector {
        Selector {
            id: SelectorId(id),
            text: text.into(),
        }
    }

    #[test]
    fn test_generate_compact() {
        let sheet = Stylesheet::from_parts(
            vec![
                Node::At(AtRule {
                    name: "charset".into(),
                    prelude: "\"utf-8\"".into(),
                    block: None,
                }),
                Node::Style(StyleRule {
                    selectors: SelectorList::Parsed(vec![selector(0, "a"), selector(1, ".b > c")]),
                    declarations: vec![
                        Declaration::new("color", "red"),
                        Declaration {
                            property: "margin".into(),
                            value: "0".into(),
                            important: true,
                        },
                    ],
                }),
                Node::At(AtRule {
                    name: "media".into(),
                    prelude: "screen".into(),
                    block: Some(AtRuleBlock::Rules(vec![Node::Style(StyleRule {
                        selectors: SelectorList::Parsed(vec![selector(2, "p")]),
                        declarations: vec![Declaration::new("top", "0")],
                    })])),
                }),
            ],
            3,
        );
        assert_eq!(
            generate(&sheet),
            "@charset \"utf-8\";a,.b > c{color:red;margin:0!important}@media screen{p{top:0}}"
        );
        assert_eq!(sheet.style_rule_count(), 2);
    }

    #[test]
    fn test_base_names_strip_vendor_prefix() {
        let at = AtRule {
            name: "-WebKit-Keyframes".into(),
            prelude: "spin".into(),
            block: Some(AtRuleBlock::Rules(vec![])),
        };
        assert_eq!(at.base_name(), "keyframes");
        assert!(at.is_keyframes());
        assert_eq!(Declaration::new("-moz-animation", "x").base_property(), "animation");
        assert_eq!(Declaration::new("--custom", "x").base_property(), "--custom");
    }
}
