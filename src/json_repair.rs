//! Two-stage parsing for structured provider responses.
//!
//! LLM-shaped providers frequently wrap JSON in markdown fences, prepend prose,
//! leave trailing commas, or emit bare object keys. [`parse_lenient`] first
//! attempts a strict `serde_json` parse; only if that fails does it apply a
//! bounded set of repairs and parse once more. The transformation set is
//! deliberately small and each repair is independently testable:
//!
//! 1. [`strip_code_fences`] drops markdown ``` fences around the payload
//! 2. [`trim_to_brackets`] cuts to the outermost `{…}` / `[…]` span
//! 3. [`quote_bare_keys`] quotes unquoted object keys
//! 4. [`strip_trailing_commas`] removes commas before a closing bracket
//!
//! Anything still unparsable after repair is an error; no further guessing.

use serde_json::Value;

/// Both parse stages failed.
#[derive(Debug, thiserror::Error)]
#[error("strict parse failed ({strict}); repaired parse failed ({repaired})")]
pub struct JsonRepairError {
    strict: serde_json::Error,
    #[source]
    repaired: serde_json::Error,
}

/// A successfully parsed value, flagged if the repair stage was needed.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub value: Value,
    pub repaired: bool,
}

/// Strict parse, then bounded repair parse.
pub fn parse_lenient(input: &str) -> Result<Parsed, JsonRepairError> {
    match serde_json::from_str(input) {
        Ok(value) => Ok(Parsed { value, repaired: false }),
        Err(strict) => match serde_json::from_str(&repair(input)) {
            Ok(value) => {
                tracing::debug!("provider response required JSON repair");
                Ok(Parsed { value, repaired: true })
            }
            Err(repaired) => Err(JsonRepairError { strict, repaired }),
        },
    }
}

/// Apply the full repair pipeline without parsing.
pub fn repair(input: &str) -> String {
    let defenced = strip_code_fences(input);
    let trimmed = trim_to_brackets(&defenced);
    let keyed = quote_bare_keys(&trimmed);
    strip_trailing_commas(&keyed)
}

/// Remove markdown code fences (```json … ``` or plain ``` … ```).
pub fn strip_code_fences(input: &str) -> String {
    let trimmed = input.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the language tag on the opening fence line
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim().to_string()
}

/// Cut the input down to the outermost `{…}` or `[…]` span, dropping any
/// leading/trailing prose. Leaves the input untouched when no bracket pair
/// is found.
pub fn trim_to_brackets(input: &str) -> String {
    let open = input.find(['{', '[']);
    let close = input.rfind(['}', ']']);
    match (open, close) {
        (Some(start), Some(end)) if start < end => input[start..=end].to_string(),
        _ => input.to_string(),
    }
}

/// Quote bare object keys: `{name: 1}` becomes `{"name": 1}`.
///
/// Only identifiers (`[A-Za-z_][A-Za-z0-9_]*`) directly followed by `:` in key
/// position are touched; string contents are left alone.
pub fn quote_bare_keys(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut in_string = false;
    let mut escaped = false;
    // Key position: right after '{' or ',' (ignoring whitespace)
    let mut at_key_position = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                at_key_position = false;
                out.push(c);
                i += 1;
            }
            '{' | ',' => {
                at_key_position = true;
                out.push(c);
                i += 1;
            }
            c if c.is_whitespace() => {
                out.push(c);
                i += 1;
            }
            c if at_key_position && (c.is_ascii_alphabetic() || c == '_') => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let mut lookahead = i;
                while lookahead < chars.len() && chars[lookahead].is_whitespace() {
                    lookahead += 1;
                }
                let identifier: String = chars[start..i].iter().collect();
                if lookahead < chars.len() && chars[lookahead] == ':' {
                    out.push('"');
                    out.push_str(&identifier);
                    out.push('"');
                } else {
                    // Not a key (e.g. bare `true` after '{'), leave as-is
                    out.push_str(&identifier);
                }
                at_key_position = false;
            }
            _ => {
                at_key_position = false;
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Remove commas directly preceding a closing `}` or `]` (whitespace allowed
/// in between). String contents are left alone.
pub fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let mut lookahead = i + 1;
                while lookahead < chars.len() && chars[lookahead].is_whitespace() {
                    lookahead += 1;
                }
                let drops = lookahead < chars.len()
                    && (chars[lookahead] == '}' || chars[lookahead] == ']');
                if !drops {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}
