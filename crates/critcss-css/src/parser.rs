//! Stylesheet parsing on top of the `cssparser` tokenizer.
//!
//! Only the structure is parsed: selectors, preludes and values stay as
//! (whitespace-normalized) text. Errors are recovered the way CSS does it,
//! by skipping to the end of the offending declaration or rule, and are
//! reported as [`ParseIssue`]s.

use std::fmt;

use cssparser::{Parser, ParserInput, SourceLocation, Token};

use crate::stylesheet::{
    AtRule, AtRuleBlock, Declaration, Node, Selector, SelectorId, SelectorList, StyleRule,
    Stylesheet,
};

/// At-rules whose block holds descriptors rather than rules.
const DESCRIPTOR_AT_RULES: &[&str] = &[
    "font-face",
    "page",
    "viewport",
    "counter-style",
    "property",
    "font-palette-values",
    "color-profile",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIssue {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl fmt::Display for ParseIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (line {}, column {})", self.message, self.line, self.column)
    }
}

#[derive(Debug, Clone)]
pub struct ParsedStylesheet {
    pub stylesheet: Stylesheet,
    pub issues: Vec<ParseIssue>,
}

#[derive(Default)]
struct ParseContext {
    next_selector: u32,
    issues: Vec<ParseIssue>,
}

impl ParseContext {
    fn issue_at(&mut self, location: SourceLocation, message: impl Into<String>) {
        self.issues.push(ParseIssue {
            line: location.line + 1,
            column: location.column,
            message: message.into(),
        });
    }

    fn next_id(&mut self) -> SelectorId {
        let id = SelectorId(self.next_selector);
        self.next_selector += 1;
        id
    }
}

/// Parse a stylesheet, recovering from errors.
pub fn parse(css: &str) -> ParsedStylesheet {
    let mut input = ParserInput::new(css);
    let mut parser = Parser::new(&mut input);
    let mut ctx = ParseContext::default();
    let rules = parse_rule_list(&mut parser, &mut ctx, true);
    ParsedStylesheet {
        stylesheet: Stylesheet::from_parts(rules, ctx.next_selector),
        issues: ctx.issues,
    }
}

fn parse_rule_list<'i>(p: &mut Parser<'i, '_>, ctx: &mut ParseContext, top_level: bool) -> Vec<Node> {
    let mut nodes = Vec::new();
    loop {
        let state = p.state();
        let location = p.current_source_location();
        let token = match p.next_including_whitespace_and_comments() {
            Ok(token) => token.clone(),
            Err(_) => break,
        };
        match token {
            Token::WhiteSpace(_) | Token::Comment(_) => {}
            Token::CDO | Token::CDC if top_level => {}
            Token::AtKeyword(name) => {
                let name = name.to_string();
                nodes.push(parse_at_rule(p, ctx, name));
            }
            Token::CloseCurlyBracket | Token::CloseParenthesis | Token::CloseSquareBracket => {
                ctx.issue_at(location, "Unexpected closing bracket");
            }
            _ => {
                p.reset(&state);
                if let Some(node) = parse_style_rule(p, ctx) {
                    nodes.push(node);
                }
            }
        }
    }
    nodes
}

enum PreludeEnd {
    Block,
    Semicolon,
    Eof,
}

/// Consume tokens up to (and including) the `{` or `;` ending a prelude.
/// Returns the raw prelude text and whether it contained tokens that make a
/// selector list malformed.
fn consume_prelude<'i>(p: &mut Parser<'i, '_>) -> (&'i str, PreludeEnd, bool) {
    let start = p.position();
    let mut well_formed = true;
    loop {
        let before = p.position();
        let token = match p.next_including_whitespace_and_comments() {
            Ok(token) => token.clone(),
            Err(_) => return (p.slice_from(start), PreludeEnd::Eof, well_formed),
        };
        match token {
            Token::CurlyBracketBlock => return (p.slice(start..before), PreludeEnd::Block, well_formed),
            Token::Semicolon => return (p.slice(start..before), PreludeEnd::Semicolon, well_formed),
            Token::BadString(_)
            | Token::BadUrl(_)
            | Token::CloseCurlyBracket
            | Token::CloseParenthesis
            | Token::CloseSquareBracket => well_formed = false,
            _ => {}
        }
    }
}

fn parse_style_rule<'i>(p: &mut Parser<'i, '_>, ctx: &mut ParseContext) -> Option<Node> {
    let location = p.current_source_location();
    let (prelude, end, well_formed) = consume_prelude(p);
    match end {
        PreludeEnd::Block => {}
        PreludeEnd::Semicolon | PreludeEnd::Eof => {
            ctx.issue_at(
                location,
                format!("Expected '{{' after selector '{}'", normalize(prelude)),
            );
            return None;
        }
    }

    let selectors = split_selector_list(prelude, well_formed, ctx);
    if let SelectorList::Malformed(raw) = &selectors {
        ctx.issue_at(location, format!("Malformed selector list '{raw}'"));
    }
    let declarations = parse_block_declarations(p, ctx);
    Some(Node::Style(StyleRule {
        selectors,
        declarations,
    }))
}

fn split_selector_list(prelude: &str, well_formed: bool, ctx: &mut ParseContext) -> SelectorList {
    let parts: Vec<String> = split_top_level_commas(prelude)
        .into_iter()
        .map(normalize)
        .collect();
    if !well_formed || parts.iter().any(|part| part.is_empty()) {
        return SelectorList::Malformed(normalize(prelude));
    }
    SelectorList::Parsed(
        parts
            .into_iter()
            .map(|text| Selector {
                id: ctx.next_id(),
                text,
            })
            .collect(),
    )
}

fn parse_at_rule<'i>(p: &mut Parser<'i, '_>, ctx: &mut ParseContext, name: String) -> Node {
    let (prelude, end, _) = consume_prelude(p);
    let prelude = normalize(prelude);
    let block = match end {
        PreludeEnd::Semicolon | PreludeEnd::Eof => None,
        PreludeEnd::Block => {
            let base = name.to_ascii_lowercase();
            if DESCRIPTOR_AT_RULES.iter().any(|d| base.ends_with(d)) {
                Some(AtRuleBlock::Declarations(parse_block_declarations(p, ctx)))
            } else {
                Some(AtRuleBlock::Rules(parse_block_rules(p, ctx)))
            }
        }
    };
    Node::At(AtRule {
        name,
        prelude,
        block,
    })
}

/// Must be called right after a `{` token.
fn parse_block_rules<'i>(p: &mut Parser<'i, '_>, ctx: &mut ParseContext) -> Vec<Node> {
    p.parse_nested_block(|inner| {
        Ok::<_, cssparser::ParseError<'i, ()>>(parse_rule_list(inner, ctx, false))
    })
    .unwrap_or_default()
}

/// Must be called right after a `{` token.
fn parse_block_declarations<'i>(p: &mut Parser<'i, '_>, ctx: &mut ParseContext) -> Vec<Declaration> {
    p.parse_nested_block(|inner| {
        Ok::<_, cssparser::ParseError<'i, ()>>(parse_declaration_list(inner, ctx))
    })
    .unwrap_or_default()
}

fn parse_declaration_list<'i>(p: &mut Parser<'i, '_>, ctx: &mut ParseContext) -> Vec<Declaration> {
    let mut declarations = Vec::new();
    loop {
        let location = p.current_source_location();
        let token = match p.next_including_whitespace_and_comments() {
            Ok(token) => token.clone(),
            Err(_) => break,
        };
        match token {
            Token::WhiteSpace(_) | Token::Comment(_) | Token::Semicolon => {}
            Token::Ident(name) => {
                let property = name.to_string();
                match parse_declaration_value(p) {
                    Some((value, important)) => declarations.push(Declaration {
                        property,
                        value,
                        important,
                    }),
                    None => ctx.issue_at(location, format!("Invalid declaration for '{property}'")),
                }
            }
            Token::AtKeyword(name) => {
                ctx.issue_at(location, format!("Unexpected @{} inside a declaration block", &*name));
                skip_declaration(p);
            }
            _ => {
                ctx.issue_at(location, "Unexpected token in declaration block");
                skip_declaration(p);
            }
        }
    }
    declarations
}

/// Parse `: value [!important]` up to the next `;` or the end of the block.
fn parse_declaration_value<'i>(p: &mut Parser<'i, '_>) -> Option<(String, bool)> {
    loop {
        let token = match p.next_including_whitespace_and_comments() {
            Ok(token) => token.clone(),
            Err(_) => return None,
        };
        match token {
            Token::WhiteSpace(_) | Token::Comment(_) => {}
            Token::Colon => break,
            Token::Semicolon => return None,
            _ => {
                skip_declaration(p);
                return None;
            }
        }
    }

    let start = p.position();
    let mut end = None;
    loop {
        let before = p.position();
        let token = match p.next_including_whitespace_and_comments() {
            Ok(token) => token.clone(),
            Err(_) => break,
        };
        if let Token::Semicolon = token {
            end = Some(before);
            break;
        }
    }
    let raw = match end {
        Some(end) => p.slice(start..end),
        None => p.slice_from(start),
    };
    let (value, important) = split_important(raw.trim());
    if value.is_empty() {
        return None;
    }
    Some((value.to_string(), important))
}

fn skip_declaration(p: &mut Parser<'_, '_>) {
    loop {
        match p.next_including_whitespace_and_comments() {
            Ok(&Token::Semicolon) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

fn split_important(raw: &str) -> (&str, bool) {
    const IMPORTANT: &str = "important";
    let trimmed = raw.trim_end();
    if trimmed.len() >= IMPORTANT.len()
        && trimmed.is_char_boundary(trimmed.len() - IMPORTANT.len())
        && trimmed[trimmed.len() - IMPORTANT.len()..].eq_ignore_ascii_case(IMPORTANT)
    {
        let head = trimmed[..trimmed.len() - IMPORTANT.len()].trim_end();
        if let Some(value) = head.strip_suffix('!') {
            return (value.trim_end(), true);
        }
    }
    (trimmed, false)
}

/// Split on commas that are not nested inside any bracket or function.
pub(crate) fn split_top_level_commas(text: &str) -> Vec<&str> {
    let mut input = ParserInput::new(text);
    let mut p = Parser::new(&mut input);
    let mut parts = Vec::new();
    let mut start = p.position();
    loop {
        let before = p.position();
        let is_comma = match p.next_including_whitespace_and_comments() {
            Ok(token) => matches!(token, Token::Comma),
            Err(_) => break,
        };
        if is_comma {
            parts.push(p.slice(start..before));
            start = p.position();
        }
    }
    parts.push(p.slice_from(start));
    parts
}

/// Drop comments and collapse whitespace runs to one space.
pub(crate) fn normalize(text: &str) -> String {
    let mut input = ParserInput::new(text);
    let mut p = Parser::new(&mut input);
    let mut out = String::new();
    write_normalized(&mut p, &mut out);
    out.trim().to_string()
}

fn write_normalized<'i>(p: &mut Parser<'i, '_>, out: &mut String) {
    loop {
        let start = p.position();
        let token = match p.next_including_whitespace_and_comments() {
            Ok(token) => token.clone(),
            Err(_) => break,
        };
        match token {
            Token::Comment(_) => {}
            Token::WhiteSpace(_) => {
                if !out.is_empty() && !out.ends_with([' ', '(', '[']) {
                    out.push(' ');
                }
            }
            Token::Function(_)
            | Token::ParenthesisBlock
            | Token::SquareBracketBlock
            | Token::CurlyBracketBlock => {
                out.push_str(p.slice_from(start));
                let closing = match token {
                    Token::SquareBracketBlock => ']',
                    Token::CurlyBracketBlock => '}',
                    _ => ')',
                };
                let _ = p.parse_nested_block(|inner| {
                    write_normalized(inner, out);
                    Ok::<_, cssparser::ParseError<'i, ()>>(())
                });
                while out.ends_with(' ') {
                    out.pop();
                }
                out.push(closing);
            }
            _ => out.push_str(p.slice_from(start)),
        }
    }
}
