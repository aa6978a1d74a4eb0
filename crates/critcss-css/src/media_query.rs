//! Drop `@media` rules that cannot apply at the target viewport.
//!
//! Only `print`-only queries and queries whose every `min-width`/`min-height`
//! exceeds the viewport are dropped. `max-*` and other features never reject.

use cssparser::{Parser, ParserInput, Token};
use tracing::debug;

use crate::parser::{normalize, split_top_level_commas};
use crate::stylesheet::{Node, Stylesheet};

/// Pixels per unit for absolute lengths; `em`/`rem` assume a 16px root font.
fn px_per_unit(unit: &str) -> Option<f64> {
    let factor = match unit.to_ascii_lowercase().as_str() {
        "px" => 1.0,
        "em" | "rem" => 16.0,
        "in" => 96.0,
        "cm" => 96.0 / 2.54,
        "mm" => 96.0 / 25.4,
        "pt" => 96.0 / 72.0,
        "pc" => 16.0,
        _ => return None,
    };
    Some(factor)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    All,
    Screen,
    Print,
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaExpression {
    pub modifier: Option<Modifier>,
    pub feature: String,
    /// Raw value text, `None` for boolean features like `(color)`.
    pub value: Option<String>,
    /// The value in CSS pixels when it is a length we know how to convert.
    pub px: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaQuery {
    pub inverse: bool,
    pub media_type: MediaType,
    pub expressions: Vec<MediaExpression>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchConfig {
    pub width: f64,
    pub height: f64,
}

impl MatchConfig {
    pub fn new(width: u32, height: u32, keep_larger_media_queries: bool) -> Self {
        if keep_larger_media_queries {
            Self {
                width: f64::INFINITY,
                height: f64::INFINITY,
            }
        } else {
            Self {
                width: f64::from(width),
                height: f64::from(height),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaQueryError(pub String);

impl MediaQuery {
    /// Whether a screen of the configured size could match this alternative.
    pub fn could_match(&self, config: &MatchConfig) -> bool {
        let print_only = matches!(
            (&self.media_type, self.inverse),
            (MediaType::Print, false) | (MediaType::Screen, true)
        );
        if print_only {
            return false;
        }
        // `@media all`, `@media whatever`: favor false positives.
        if self.expressions.is_empty() {
            return true;
        }
        self.expressions.iter().any(|e| e.could_match(config))
    }
}

impl MediaExpression {
    fn could_match(&self, config: &MatchConfig) -> bool {
        match (self.modifier, self.feature.as_str(), self.px) {
            (Some(Modifier::Min), "width", Some(px)) => px <= config.width,
            (Some(Modifier::Min), "height", Some(px)) => px <= config.height,
            _ => true,
        }
    }
}

/// Parse a media query list (`screen and (min-width: 600px), print`).
pub fn parse_media_query_list(text: &str) -> Result<Vec<MediaQuery>, MediaQueryError> {
    if text.trim().is_empty() {
        return Ok(vec![MediaQuery {
            inverse: false,
            media_type: MediaType::All,
            expressions: Vec::new(),
        }]);
    }
    split_top_level_commas(text)
        .into_iter()
        .map(parse_media_query)
        .collect()
}

fn parse_media_query(text: &str) -> Result<MediaQuery, MediaQueryError> {
    let mut input = ParserInput::new(text);
    let mut p = Parser::new(&mut input);
    let mut query = MediaQuery {
        inverse: false,
        media_type: MediaType::All,
        expressions: Vec::new(),
    };
    let err = |msg: &str| MediaQueryError(format!("{msg} in media query '{}'", text.trim()));

    // [only | not]? <type>? | <expression>
    let mut expect_type = true;
    let mut first = true;
    loop {
        let token = match p.next() {
            Ok(token) => token.clone(),
            Err(_) => break,
        };
        match token {
            Token::Ident(ident) if first && ident.eq_ignore_ascii_case("only") => {
                expect_type = true;
            }
            Token::Ident(ident) if first && ident.eq_ignore_ascii_case("not") => {
                query.inverse = true;
            }
            Token::Ident(ident) if expect_type => {
                query.media_type = match ident.to_ascii_lowercase().as_str() {
                    "all" => MediaType::All,
                    "screen" => MediaType::Screen,
                    "print" => MediaType::Print,
                    other => MediaType::Other(other.to_string()),
                };
                expect_type = false;
            }
            Token::Ident(ident)
                if !first && (ident.eq_ignore_ascii_case("and") || ident.eq_ignore_ascii_case("or")) =>
            {
                expect_type = false;
                match p.next() {
                    Ok(Token::ParenthesisBlock) => {}
                    _ => return Err(err("Expected '(' after combinator")),
                }
                query.expressions.extend(parse_expression_block(&mut p).map_err(|m| err(&m))?);
            }
            Token::ParenthesisBlock if expect_type => {
                expect_type = false;
                query.expressions.extend(parse_expression_block(&mut p).map_err(|m| err(&m))?);
            }
            _ => return Err(err("Unexpected token")),
        }
        first = false;
    }
    if first {
        return Err(err("Empty query"));
    }
    Ok(query)
}

/// Must be called right after a `(` token.
fn parse_expression_block<'i>(p: &mut Parser<'i, '_>) -> Result<Vec<MediaExpression>, String> {
    p.parse_nested_block(|inner| {
        let parsed = parse_expression(inner);
        while inner.next().is_ok() {}
        Ok::<_, cssparser::ParseError<'i, ()>>(parsed)
    })
    .unwrap_or_else(|_| Err("Unterminated media feature".to_string()))
}

#[derive(Debug, Clone, Copy)]
enum Comparison {
    Less,
    Greater,
    Equal,
}

impl Comparison {
    /// Modifier for `feature <cmp> value`.
    fn feature_first(self) -> Option<Modifier> {
        match self {
            Self::Greater => Some(Modifier::Min),
            Self::Less => Some(Modifier::Max),
            Self::Equal => None,
        }
    }

    /// Modifier for `value <cmp> feature`.
    fn value_first(self) -> Option<Modifier> {
        match self {
            Self::Less => Some(Modifier::Min),
            Self::Greater => Some(Modifier::Max),
            Self::Equal => None,
        }
    }
}

fn parse_expression(p: &mut Parser<'_, '_>) -> Result<Vec<MediaExpression>, String> {
    let start = p.position();
    let start_state = p.state();
    let token = p.next().map(|t| t.clone()).map_err(|_| "Empty media feature".to_string())?;
    match token {
        Token::Ident(name) => {
            let name = name.to_ascii_lowercase();
            let token = match p.next() {
                Ok(token) => token.clone(),
                Err(_) => {
                    return Ok(vec![MediaExpression {
                        modifier: None,
                        feature: name,
                        value: None,
                        px: None,
                    }]);
                }
            };
            match token {
                Token::Colon => {
                    let (value, px) = read_value(p, true);
                    if value.is_empty() {
                        return Err(format!("Missing value for '{name}'"));
                    }
                    let (modifier, feature) = split_modifier(&name);
                    Ok(vec![MediaExpression {
                        modifier,
                        feature,
                        value: Some(value),
                        px,
                    }])
                }
                Token::Delim(c) if matches!(c, '<' | '>' | '=') => {
                    let comparison = comparison_rest(p, c);
                    let (value, px) = read_value(p, true);
                    if value.is_empty() {
                        return Err(format!("Missing value for '{name}'"));
                    }
                    Ok(vec![MediaExpression {
                        modifier: comparison.feature_first(),
                        feature: name,
                        value: Some(value),
                        px,
                    }])
                }
                _ => Err(format!("Unexpected token after '{name}'")),
            }
        }
        Token::Number { .. } | Token::Dimension { .. } => {
            // `600px <= width [< 900px]`
            p.reset(&start_state);
            let (low, low_px) = read_value(p, false);
            let first = match p.next() {
                Ok(Token::Delim(c)) if matches!(*c, '<' | '>' | '=') => *c,
                _ => return Err("Expected a comparison in range".to_string()),
            };
            let comparison = comparison_rest(p, first);
            let feature = match p.next() {
                Ok(Token::Ident(name)) => name.to_ascii_lowercase(),
                _ => return Err("Expected a feature name in range".to_string()),
            };
            let mut expressions = vec![MediaExpression {
                modifier: comparison.value_first(),
                feature: feature.clone(),
                value: Some(low),
                px: low_px,
            }];
            let second = match p.next() {
                Ok(Token::Delim(c)) if matches!(*c, '<' | '>' | '=') => Some(*c),
                Ok(_) => return Err(format!("Unexpected token after '{feature}'")),
                Err(_) => None,
            };
            if let Some(c) = second {
                let comparison = comparison_rest(p, c);
                let (high, high_px) = read_value(p, true);
                if high.is_empty() {
                    return Err(format!("Missing upper bound for '{feature}'"));
                }
                expressions.push(MediaExpression {
                    modifier: comparison.feature_first(),
                    feature,
                    value: Some(high),
                    px: high_px,
                });
            }
            Ok(expressions)
        }
        Token::ParenthesisBlock => {
            // Nested conditions (`((a) and (b))`, `(not (a))`) are kept as-is.
            while p.next().is_ok() {}
            Ok(vec![MediaExpression {
                modifier: None,
                feature: normalize(p.slice_from(start)),
                value: None,
                px: None,
            }])
        }
        _ => Err("Unexpected token in media feature".to_string()),
    }
}

fn comparison_rest(p: &mut Parser<'_, '_>, first: char) -> Comparison {
    // `<=`/`>=` arrive as two delimiter tokens.
    let state = p.state();
    match p.next() {
        Ok(Token::Delim('=')) => {}
        _ => p.reset(&state),
    }
    match first {
        '<' => Comparison::Less,
        '>' => Comparison::Greater,
        _ => Comparison::Equal,
    }
}

/// Read a value (everything to the end when `to_end`, otherwise a single
/// token) and its px equivalent.
fn read_value(p: &mut Parser<'_, '_>, to_end: bool) -> (String, Option<f64>) {
    let value_start = p.position();
    let px = value_px(p);
    if to_end {
        while p.next().is_ok() {}
    } else {
        let _ = p.next();
    }
    (normalize(p.slice_from(value_start)), px)
}

/// Read one value token and convert it to px when possible.
fn value_px(p: &mut Parser<'_, '_>) -> Option<f64> {
    let state = p.state();
    let px = match p.next() {
        Ok(Token::Dimension { value, unit, .. }) => {
            let value = f64::from(*value);
            px_per_unit(unit).map(|factor| value * factor)
        }
        Ok(Token::Number { value, .. }) => Some(f64::from(*value)),
        _ => None,
    };
    p.reset(&state);
    px
}

fn split_modifier(name: &str) -> (Option<Modifier>, String) {
    if let Some(feature) = name.strip_prefix("min-") {
        (Some(Modifier::Min), feature.to_string())
    } else if let Some(feature) = name.strip_prefix("max-") {
        (Some(Modifier::Max), feature.to_string())
    } else {
        (None, name.to_string())
    }
}

/// Whether an `@media` prelude could match the configured viewport.
/// A prelude that fails to parse is treated as unmatchable.
pub fn is_matching_media_query(prelude: &str, config: &MatchConfig) -> bool {
    match parse_media_query_list(prelude) {
        Ok(queries) => queries.iter().any(|q| q.could_match(config)),
        Err(MediaQueryError(reason)) => {
            debug!(%reason, "Dropping unparseable media query");
            false
        }
    }
}

/// Remove every `@media` rule (at any depth) that cannot match.
/// Returns the number of rules removed.
pub fn filter_media_queries(sheet: &mut Stylesheet, config: &MatchConfig) -> usize {
    fn filter(nodes: &mut Vec<Node>, config: &MatchConfig) -> usize {
        let before = nodes.len();
        nodes.retain(|node| match node {
            Node::At(at) if at.base_name() == "media" => is_matching_media_query(&at.prelude, config),
            _ => true,
        });
        let mut removed = before - nodes.len();
        for node in nodes.iter_mut() {
            if let Node::At(at) = node {
                if let Some(children) = at.children_mut() {
                    removed += filter(children, config);
                }
            }
        }
        removed
    }
    filter(&mut sheet.rules, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::stylesheet::generate;

    fn desktop() -> MatchConfig {
        MatchConfig::new(1300, 900, false)
    }

    #[test]
    fn test_parse_type_and_features() {
        let queries = parse_media_query_list("only screen and (min-width: 600px), print").unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].media_type, MediaType::Screen);
        assert!(!queries[0].inverse);
        let expr = &queries[0].expressions[0];
        assert_eq!(expr.modifier, Some(Modifier::Min));
        assert_eq!(expr.feature, "width");
        assert_eq!(expr.value.as_deref(), Some("600px"));
        assert_eq!(expr.px, Some(600.0));
        assert_eq!(queries[1].media_type, MediaType::Print);
    }

    #[test]
    fn test_unit_conversion() {
        let px = |q: &str| parse_media_query_list(q).unwrap()[0].expressions[0].px;
        assert_eq!(px("(min-width: 40em)"), Some(640.0));
        assert_eq!(px("(min-width: 2in)"), Some(192.0));
        assert_eq!(px("(min-width: 30vw)"), None);
    }

    #[test]
    fn test_print_only_never_matches() {
        let config = desktop();
        assert!(!is_matching_media_query("print", &config));
        assert!(!is_matching_media_query("not screen", &config));
        assert!(is_matching_media_query("not print", &config));
        assert!(is_matching_media_query("print, screen", &config));
    }

    #[test]
    fn test_min_width_against_viewport() {
        let config = desktop();
        assert!(is_matching_media_query("(min-width: 1300px)", &config));
        assert!(!is_matching_media_query("(min-width: 1301px)", &config));
        assert!(!is_matching_media_query("screen and (min-height: 1000px)", &config));
        // max-* is never used to reject.
        assert!(is_matching_media_query("(max-width: 300px)", &config));
        assert!(is_matching_media_query("(orientation: portrait)", &config));
    }

    #[test]
    fn test_any_expression_may_match() {
        let config = desktop();
        assert!(is_matching_media_query(
            "(min-width: 2000px) and (max-width: 3000px)",
            &config
        ));
        assert!(!is_matching_media_query(
            "(min-width: 2000px) and (min-height: 2000px)",
            &config
        ));
    }

    #[test]
    fn test_keep_larger_matches_any_min_width() {
        let config = MatchConfig::new(320, 480, true);
        assert!(is_matching_media_query("(min-width: 5000px)", &config));
        assert!(!is_matching_media_query("print", &config));
    }

    #[test]
    fn test_range_syntax() {
        let config = desktop();
        assert!(!is_matching_media_query("(width >= 1400px)", &config));
        assert!(is_matching_media_query("(width >= 1200px)", &config));
        assert!(!is_matching_media_query("(1400px <= width)", &config));
        assert!(is_matching_media_query("(1400px < width < 2000px)", &config));

        let queries = parse_media_query_list("(600px <= width < 900px)").unwrap();
        let modifiers: Vec<_> = queries[0].expressions.iter().map(|e| e.modifier).collect();
        assert_eq!(modifiers, vec![Some(Modifier::Min), Some(Modifier::Max)]);
    }

    #[test]
    fn test_unparseable_is_dropped() {
        let config = desktop();
        assert!(parse_media_query_list("screen and").is_err());
        assert!(parse_media_query_list("(min-width:)").is_err());
        assert!(!is_matching_media_query("screen {}", &config));
        assert!(!is_matching_media_query("(min-width:)", &config));
    }

    #[test]
    fn test_filter_recurses_into_containers() {
        let css = "a{color:red}\
            @media print{a{color:black}}\
            @supports (display:grid){@media (min-width: 2000px){b{top:0}}c{top:1px}}\
            @media screen and (min-width: 800px){d{top:2px}}";
        let mut sheet = parse(css).stylesheet;
        let removed = filter_media_queries(&mut sheet, &desktop());
        assert_eq!(removed, 2);
        assert_eq!(
            generate(&sheet),
            "a{color:red}@supports (display:grid){c{top:1px}}@media screen and (min-width: 800px){d{top:2px}}"
        );
    }

    #[test]
    fn test_larger_viewport_keeps_superset() {
        let css = "@media (min-width: 500px){a{top:0}}@media (min-width: 1000px){b{top:0}}\
                   @media (min-height: 700px){c{top:0}}";
        let small = {
            let mut sheet = parse(css).stylesheet;
            filter_media_queries(&mut sheet, &MatchConfig::new(600, 600, false));
            generate(&sheet)
        };
        let large = {
            let mut sheet = parse(css).stylesheet;
            filter_media_queries(&mut sheet, &MatchConfig::new(1200, 800, false));
            generate(&sheet)
        };
        assert_eq!(small, "@media (min-width: 500px){a{top:0}}");
        assert!(large.contains(&small));
        assert!(large.contains("c{top:0}"));
    }
}
