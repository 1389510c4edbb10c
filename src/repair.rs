//! JSON repair — salvage near-valid JSON from model output.
//!
//! Models wrap JSON in markdown fences, leave trailing commas, use single
//! quotes, or emit raw newlines inside strings. The repair pipeline applies
//! a fixed sequence of conservative rewrites that never change the meaning
//! of JSON that already parses:
//!
//! 1. trim
//! 2. strip leading/trailing fenced-code markers
//! 3. extract the first brace-balanced `{…}` substring
//! 4. remove trailing commas before `}` / `]`
//! 5. quote bare object keys (`[A-Za-z_][A-Za-z0-9_]*`)
//! 6. rewrite single-quoted strings to double-quoted, respecting escapes
//! 7. strip C0 control characters except `\n` and `\t`
//! 8. escape literal newlines (and drop carriage returns) inside strings
//!
//! Valid input is a fixed point: `parse(repair(x)) == parse(x)` whenever
//! `parse(x)` succeeds, because repair is only attempted after a plain
//! parse has failed.

use serde_json::Value;
use thiserror::Error;

/// Outcome of a successful parse, noting whether repair was needed.
#[derive(Debug, Clone)]
pub struct RepairedParse {
    pub value: Value,
    /// True when the raw text failed to parse and the repaired form succeeded.
    pub repaired: bool,
}

/// Parse failure carrying the reason and the untouched original.
#[derive(Debug, Error)]
#[error("json parse failed: {reason}")]
pub struct RepairError {
    pub reason: String,
    pub original: String,
}

/// Parse `raw` as JSON, optionally running the repair pipeline on failure.
///
/// With `allow_repair = false` (deterministic mode) malformed input fails
/// immediately with the parser's reason.
pub fn parse_with_repair(raw: &str, allow_repair: bool) -> Result<RepairedParse, RepairError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => Ok(RepairedParse {
            value,
            repaired: false,
        }),
        Err(first_err) => {
            if !allow_repair {
                return Err(RepairError {
                    reason: first_err.to_string(),
                    original: raw.to_string(),
                });
            }
            let repaired = repair(raw);
            match serde_json::from_str::<Value>(&repaired) {
                Ok(value) => Ok(RepairedParse {
                    value,
                    repaired: true,
                }),
                Err(second_err) => Err(RepairError {
                    reason: format!(
                        "unrepairable: {} (after repair: {})",
                        first_err, second_err
                    ),
                    original: raw.to_string(),
                }),
            }
        }
    }
}

/// Run the full repair pipeline without parsing.
pub fn repair(raw: &str) -> String {
    let s = raw.trim().to_string();
    let s = strip_code_fences(&s);
    let s = extract_balanced_object(&s);
    let s = remove_trailing_commas(&s);
    let s = quote_bare_keys(&s);
    let s = rewrite_single_quotes(&s);
    let s = strip_control_chars(&s);
    escape_newlines_in_strings(&s)
}

fn strip_code_fences(s: &str) -> String {
    let mut out = s.trim();
    if out.starts_with("```") {
        // Drop the fence line, including a language tag like ```json.
        out = match out.find('\n') {
            Some(idx) => &out[idx + 1..],
            None => "",
        };
    }
    let out = out.trim_end();
    let out = out.strip_suffix("```").unwrap_or(out);
    out.trim().to_string()
}

/// Extract the first brace-balanced `{…}` substring, tracking string and
/// escape state so braces inside string literals do not count.
fn extract_balanced_object(s: &str) -> String {
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => {
                if start.is_none() {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        let begin = start.unwrap_or(0);
                        return s[begin..=idx].to_string();
                    }
                }
            }
            _ => {}
        }
    }
    s.to_string()
}

fn remove_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = s.chars().collect();

    for (idx, &ch) in chars.iter().enumerate() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
            out.push(ch);
            continue;
        }
        if ch == ',' {
            // Look ahead past whitespace; drop the comma before a closer.
            let next = chars[idx + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

/// Quote bare identifiers used as object keys.
fn quote_bare_keys(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 16);
    let mut in_string = false;
    let mut escaped = false;
    // Stack of container openers so keys are only quoted in object context.
    let mut containers: Vec<char> = Vec::new();
    // True between `{`/`,` and the next `:` at object level.
    let mut expecting_key = false;
    let chars: Vec<char> = s.chars().collect();
    let mut idx = 0;

    while idx < chars.len() {
        let ch = chars[idx];
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            idx += 1;
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                expecting_key = false;
                out.push(ch);
            }
            '{' => {
                containers.push('{');
                expecting_key = true;
                out.push(ch);
            }
            '[' => {
                containers.push('[');
                expecting_key = false;
                out.push(ch);
            }
            '}' | ']' => {
                containers.pop();
                expecting_key = false;
                out.push(ch);
            }
            ',' => {
                expecting_key = containers.last() == Some(&'{');
                out.push(ch);
            }
            ':' => {
                expecting_key = false;
                out.push(ch);
            }
            c if expecting_key && (c.is_ascii_alphabetic() || c == '_') => {
                let mut end = idx + 1;
                while end < chars.len()
                    && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                // Only a key if the next non-whitespace char is a colon.
                let next = chars[end..].iter().find(|c| !c.is_whitespace());
                if next == Some(&':') {
                    out.push('"');
                    out.extend(&chars[idx..end]);
                    out.push('"');
                    expecting_key = false;
                    idx = end;
                    continue;
                }
                out.push(c);
            }
            _ => out.push(ch),
        }
        idx += 1;
    }
    out
}

/// Rewrite single-quoted string literals to double-quoted ones.
fn rewrite_single_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_double = false;
    let mut in_single = false;
    let mut escaped = false;

    for ch in s.chars() {
        if in_double {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_double = false;
            }
            continue;
        }
        if in_single {
            if escaped {
                // `\'` inside a single-quoted string becomes a bare quote.
                if ch == '\'' {
                    out.push('\'');
                } else {
                    out.push('\\');
                    out.push(ch);
                }
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '\'' {
                out.push('"');
                in_single = false;
            } else if ch == '"' {
                out.push_str("\\\"");
            } else {
                out.push(ch);
            }
            continue;
        }
        match ch {
            '"' => {
                in_double = true;
                out.push(ch);
            }
            '\'' => {
                in_single = true;
                out.push('"');
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Strip C0 control characters except `\n` and `\t`.
fn strip_control_chars(s: &str) -> String {
    s.chars()
        .filter(|&c| !(c.is_control() && c != '\n' && c != '\t'))
        .collect()
}

/// Escape literal newlines and tabs inside string tokens; literal carriage
/// returns inside strings are dropped.
fn escape_newlines_in_strings(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in s.chars() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }
        if escaped {
            out.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                out.push(ch);
                escaped = true;
            }
            '"' => {
                out.push(ch);
                in_string = false;
            }
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => {}
            _ => out.push(ch),
        }
    }
    out
}
