//! Boolean + numeric query expressions shared by the matchmaker's ticket
//! queries and the match registry's label search. Compiled once to an AST at
//! insert time; the pass never reparses.

use std::collections::BTreeMap;
use std::fmt;

use crate::envelope::PropertyValue;

#[derive(Clone, Debug, PartialEq)]
pub enum QueryExpr {
    And(Box<QueryExpr>, Box<QueryExpr>),
    Or(Box<QueryExpr>, Box<QueryExpr>),
    Not(Box<QueryExpr>),
    Leaf(Predicate),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Equals { prop: String, value: PropertyValue },
    GreaterThan { prop: String, value: f64 },
    LessThan { prop: String, value: f64 },
    Range { prop: String, low: f64, high: f64 },
    Regex { prop: String, pattern: String },
    Prefix { prop: String, prefix: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryParseError(pub String);

impl fmt::Display for QueryParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid query: {}", self.0)
    }
}

impl std::error::Error for QueryParseError {}

/// Every leaf kind the grammar accepts. Call sites that don't support a
/// given leaf kind (the label dialect rejects `Regex`) check after parsing
/// and surface `invalid-query` themselves.
pub fn parse(input: &str) -> Result<QueryExpr, QueryParseError> {
    let tokens = tokenize(input)?;
    let mut pos = 0;
    let expr = parse_or(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(QueryParseError(format!(
            "trailing input at token {pos}"
        )));
    }
    Ok(expr)
}

/// Leaf predicate kinds this use site accepts; used to reject e.g. regex
/// leaves in the match-label dialect with `invalid-query` rather than
/// silently matching.
pub fn only_supports(expr: &QueryExpr, allow_regex: bool) -> bool {
    match expr {
        QueryExpr::And(l, r) | QueryExpr::Or(l, r) => {
            only_supports(l, allow_regex) && only_supports(r, allow_regex)
        }
        QueryExpr::Not(inner) => only_supports(inner, allow_regex),
        QueryExpr::Leaf(Predicate::Regex { .. }) => allow_regex,
        QueryExpr::Leaf(_) => true,
    }
}

pub fn eval(expr: &QueryExpr, properties: &BTreeMap<String, PropertyValue>) -> bool {
    match expr {
        QueryExpr::And(l, r) => eval(l, properties) && eval(r, properties),
        QueryExpr::Or(l, r) => eval(l, properties) || eval(r, properties),
        QueryExpr::Not(inner) => !eval(inner, properties),
        QueryExpr::Leaf(pred) => eval_predicate(pred, properties),
    }
}

fn eval_predicate(pred: &Predicate, properties: &BTreeMap<String, PropertyValue>) -> bool {
    match pred {
        Predicate::Equals { prop, value } => properties.get(prop) == Some(value),
        Predicate::GreaterThan { prop, value } => numeric(properties, prop)
            .map(|n| n > *value)
            .unwrap_or(false),
        Predicate::LessThan { prop, value } => numeric(properties, prop)
            .map(|n| n < *value)
            .unwrap_or(false),
        Predicate::Range { prop, low, high } => numeric(properties, prop)
            .map(|n| n >= *low && n <= *high)
            .unwrap_or(false),
        Predicate::Regex { prop, pattern } => text(properties, prop)
            .map(|s| regex_lite_match(pattern, s))
            .unwrap_or(false),
        Predicate::Prefix { prop, prefix } => text(properties, prop)
            .map(|s| s.starts_with(prefix.as_str()))
            .unwrap_or(false),
    }
}

fn numeric(properties: &BTreeMap<String, PropertyValue>, prop: &str) -> Option<f64> {
    match properties.get(prop)? {
        PropertyValue::Number(n) => Some(*n),
        PropertyValue::Text(_) => None,
    }
}

fn text<'a>(properties: &'a BTreeMap<String, PropertyValue>, prop: &str) -> Option<&'a str> {
    match properties.get(prop)? {
        PropertyValue::Text(s) => Some(s.as_str()),
        PropertyValue::Number(_) => None,
    }
}

/// A deliberately small regex subset (literal text, `*` wildcard, `.`
/// any-char) so this crate does not need a full regex engine dependency for
/// the handful of matchmaker properties that use `/pattern/` predicates.
/// Anything beyond that subset is a parse-time `invalid-query`, checked by
/// the caller before this is reached in production paths.
fn regex_lite_match(pattern: &str, text: &str) -> bool {
    fn matches(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => {
                matches(&p[1..], t) || (!t.is_empty() && matches(p, &t[1..]))
            }
            Some(b'.') => !t.is_empty() && matches(&p[1..], &t[1..]),
            Some(&c) => !t.is_empty() && t[0] == c && matches(&p[1..], &t[1..]),
        }
    }
    matches(pattern.as_bytes(), text.as_bytes())
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    And,
    Or,
    Not,
    LParen,
    RParen,
    Term(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>, QueryParseError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            _ => {
                let start = i;
                loop {
                    if i >= chars.len() || chars[i].is_whitespace() || chars[i] == '(' || chars[i] == ')' {
                        break;
                    }
                    match chars[i] {
                        '/' => {
                            // A /regex/ literal: consume through the closing slash, slashes included.
                            i += 1;
                            while i < chars.len() && chars[i] != '/' {
                                i += 1;
                            }
                            if i >= chars.len() {
                                return Err(QueryParseError("unterminated regex literal".into()));
                            }
                            i += 1;
                        }
                        '[' => {
                            while i < chars.len() && chars[i] != ']' {
                                i += 1;
                            }
                            if i >= chars.len() {
                                return Err(QueryParseError("unterminated range literal".into()));
                            }
                            i += 1;
                        }
                        _ => i += 1,
                    }
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    _ => Token::Term(word),
                });
            }
        }
    }
    Ok(tokens)
}

fn parse_or(tokens: &[Token], pos: &mut usize) -> Result<QueryExpr, QueryParseError> {
    let mut lhs = parse_and(tokens, pos)?;
    while matches!(tokens.get(*pos), Some(Token::Or)) {
        *pos += 1;
        let rhs = parse_and(tokens, pos)?;
        lhs = QueryExpr::Or(Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_and(tokens: &[Token], pos: &mut usize) -> Result<QueryExpr, QueryParseError> {
    let mut lhs = parse_unary(tokens, pos)?;
    while matches!(tokens.get(*pos), Some(Token::And)) {
        *pos += 1;
        let rhs = parse_unary(tokens, pos)?;
        lhs = QueryExpr::And(Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_unary(tokens: &[Token], pos: &mut usize) -> Result<QueryExpr, QueryParseError> {
    if matches!(tokens.get(*pos), Some(Token::Not)) {
        *pos += 1;
        let inner = parse_unary(tokens, pos)?;
        return Ok(QueryExpr::Not(Box::new(inner)));
    }
    parse_atom(tokens, pos)
}

fn parse_atom(tokens: &[Token], pos: &mut usize) -> Result<QueryExpr, QueryParseError> {
    match tokens.get(*pos) {
        Some(Token::LParen) => {
            *pos += 1;
            let expr = parse_or(tokens, pos)?;
            match tokens.get(*pos) {
                Some(Token::RParen) => {
                    *pos += 1;
                    Ok(expr)
                }
                _ => Err(QueryParseError("expected ')'".into())),
            }
        }
        Some(Token::Term(term)) => {
            let term = term.clone();
            *pos += 1;
            parse_leaf(&term)
        }
        other => Err(QueryParseError(format!("unexpected token: {other:?}"))),
    }
}

fn parse_leaf(term: &str) -> Result<QueryExpr, QueryParseError> {
    let (prop, rest) = term
        .split_once(':')
        .ok_or_else(|| QueryParseError(format!("expected 'prop:value' in '{term}'")))?;
    let prop = prop.to_string();

    if let Some(range) = rest.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        let mut parts = range.split_whitespace();
        let low = parts
            .next()
            .ok_or_else(|| QueryParseError("empty range".into()))?;
        let to = parts.next();
        let high = parts.next();
        if to.map(|s| s.eq_ignore_ascii_case("TO")) != Some(true) {
            return Err(QueryParseError("range must be '[a TO b]'".into()));
        }
        let high = high.ok_or_else(|| QueryParseError("range missing upper bound".into()))?;
        let low: f64 = low
            .parse()
            .map_err(|_| QueryParseError(format!("bad range lower bound '{low}'")))?;
        let high: f64 = high
            .parse()
            .map_err(|_| QueryParseError(format!("bad range upper bound '{high}'")))?;
        return Ok(QueryExpr::Leaf(Predicate::Range { prop, low, high }));
    }

    if let Some(pattern) = rest.strip_prefix('/').and_then(|r| r.strip_suffix('/')) {
        return Ok(QueryExpr::Leaf(Predicate::Regex {
            prop,
            pattern: pattern.to_string(),
        }));
    }

    if let Some(num) = rest.strip_prefix('>') {
        let value: f64 = num
            .parse()
            .map_err(|_| QueryParseError(format!("bad number '{num}'")))?;
        return Ok(QueryExpr::Leaf(Predicate::GreaterThan { prop, value }));
    }

    if let Some(num) = rest.strip_prefix('<') {
        let value: f64 = num
            .parse()
            .map_err(|_| QueryParseError(format!("bad number '{num}'")))?;
        return Ok(QueryExpr::Leaf(Predicate::LessThan { prop, value }));
    }

    if let Some(prefix) = rest.strip_suffix('*') {
        return Ok(QueryExpr::Leaf(Predicate::Prefix {
            prop,
            prefix: prefix.to_string(),
        }));
    }

    let value = match rest.parse::<f64>() {
        Ok(n) => PropertyValue::Number(n),
        Err(_) => PropertyValue::Text(rest.to_string()),
    };
    Ok(QueryExpr::Leaf(Predicate::Equals { prop, value }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, PropertyValue)]) -> BTreeMap<String, PropertyValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn parses_and_evaluates_range() {
        let expr = parse("rank:[5 TO 15]").unwrap();
        let p = props(&[("rank", PropertyValue::Number(10.0))]);
        assert!(eval(&expr, &p));
        let p = props(&[("rank", PropertyValue::Number(20.0))]);
        assert!(!eval(&expr, &p));
    }

    #[test]
    fn parses_and_or_not_composition() {
        let expr = parse("(rank:[5 TO 15] AND NOT region:eu) OR region:na").unwrap();
        let p = props(&[
            ("rank", PropertyValue::Number(10.0)),
            ("region", PropertyValue::Text("na".into())),
        ]);
        assert!(eval(&expr, &p));
    }

    #[test]
    fn missing_property_fails_predicate() {
        let expr = parse("rank:[5 TO 15]").unwrap();
        let p = props(&[]);
        assert!(!eval(&expr, &p));
    }

    #[test]
    fn label_dialect_rejects_regex_leaves() {
        let expr = parse("name:/abc.*/").unwrap();
        assert!(!only_supports(&expr, false));
        assert!(only_supports(&expr, true));
    }

    #[test]
    fn prefix_predicate() {
        let expr = parse("name:foo*").unwrap();
        let p = props(&[("name", PropertyValue::Text("foobar".into()))]);
        assert!(eval(&expr, &p));
        let p = props(&[("name", PropertyValue::Text("barfoo".into()))]);
        assert!(!eval(&expr, &p));
    }
}
