//! Parameter template resolution.
//!
//! Parameter values may reference other parameters:
//!
//! - `{name}` is replaced by the value of `name`, or by nothing if unset
//! - `{name=default}` is replaced by the value of `name`, or by `default`
//!
//! A substituted value may itself contain tokens, so resolution runs in
//! passes, up to a caller-supplied cycle budget. Tokens still present after
//! the last pass stay in the output verbatim, which keeps self-referencing
//! templates visible instead of silently emptying them.
//!
//! Braces that do not form a token (`{`, `{}`, `{a{b}`) are plain text.

use std::collections::HashMap;

/// Default number of resolution passes.
pub const DEFAULT_MAX_CYCLES: usize = 2;

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Token {
        name: String,
        default: Option<String>,
    },
}

/// A string split into literal text and `{token}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterTemplate {
    segments: Vec<Segment>,
}

impl ParameterTemplate {
    /// Parse a template. Never fails: anything that is not a token is text.
    pub fn parse(raw: &str) -> Self {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut rest = raw;

        while let Some(open) = rest.find('{') {
            text.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match parse_token(after) {
                Some((segment, consumed)) => {
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(segment);
                    rest = &after[consumed..];
                }
                None => {
                    text.push('{');
                    rest = after;
                }
            }
        }
        text.push_str(rest);
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether the template contains at least one token.
    pub fn has_tokens(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Token { .. }))
    }

    /// Names of every token, in order of appearance.
    pub fn token_names(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Token { name, .. } => Some(name.as_str()),
                Segment::Text(_) => None,
            })
            .collect()
    }

    /// Substitute every token once.
    pub fn render(&self, values: &HashMap<String, String>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Token { name, default } => {
                    if let Some(value) = values.get(name) {
                        out.push_str(value);
                    } else if let Some(default) = default {
                        out.push_str(default);
                    }
                }
            }
        }
        out
    }
}

/// Returns the token and the number of bytes consumed after the `{`.
fn parse_token(after_open: &str) -> Option<(Segment, usize)> {
    let close = after_open.find('}')?;
    let body = &after_open[..close];
    if body.contains('{') {
        return None;
    }
    let (name, default) = match body.split_once('=') {
        Some((name, default)) => (name, Some(default.to_string())),
        None => (body, None),
    };
    if name.is_empty() {
        return None;
    }
    Some((
        Segment::Token {
            name: name.to_string(),
            default,
        },
        close + 1,
    ))
}

/// Resolve `raw` against `values` in at most `max_cycles` passes. At least
/// one pass always runs, whatever the budget.
///
/// A blank input or a missing lookup returns the input unchanged. Resolution
/// stops early once no tokens remain.
pub fn resolve(raw: &str, values: Option<&HashMap<String, String>>, max_cycles: usize) -> String {
    let Some(values) = values else {
        return raw.to_string();
    };
    if raw.trim().is_empty() {
        return raw.to_string();
    }

    let mut current = raw.to_string();
    for _ in 0..max_cycles.max(1) {
        let template = ParameterTemplate::parse(&current);
        if !template.has_tokens() {
            break;
        }
        current = template.render(values);
    }
    current
}
