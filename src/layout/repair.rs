//! JSON repair ladder for model replies.
//!
//! Models wrap JSON in code fences, prepend prose, and truncate mid-object
//! when they hit the token budget. Rather than one strict parse, replies go
//! through three passes of increasing tolerance:
//!
//! 1. direct parse of the fence-stripped text;
//! 2. balanced-scan extraction of the first complete JSON value;
//! 3. truncation repair: cut back to the last safely closed object and
//!    append the closers still open at that point.
//!
//! Each pass either yields text that parses or falls through; the ladder as
//! a whole yields parsed JSON or nothing, never garbage. Which parsed shapes
//! are acceptable is the caller's concern.

use serde_json::Value;

/// Parsed candidates in ladder order. Callers take the first candidate that
/// also has an acceptable shape.
pub fn parse_candidates(text: &str) -> Vec<Value> {
    let cleaned = strip_code_fences(text);
    let mut out = Vec::new();
    if let Ok(v) = serde_json::from_str::<Value>(cleaned) {
        out.push(v);
    }
    if let Some(extracted) = extract_first_json(cleaned) {
        if let Ok(v) = serde_json::from_str::<Value>(extracted) {
            out.push(v);
        }
    }
    if let Some(repaired) = repair_truncated(cleaned) {
        if let Ok(v) = serde_json::from_str::<Value>(&repaired) {
            out.push(v);
        }
    }
    out
}

/// First candidate, for callers that accept any parsed shape.
pub fn parse_lenient(text: &str) -> Option<Value> {
    parse_candidates(text).into_iter().next()
}

/// Drop a surrounding markdown code fence and its `json` language tag.
pub fn strip_code_fences(text: &str) -> &str {
    let mut cleaned = text.trim();
    if cleaned.starts_with("```") {
        cleaned = cleaned.trim_matches('`').trim();
        if let Some(rest) = cleaned.strip_prefix("json") {
            cleaned = rest.trim_start();
        }
    }
    cleaned
}

/// Scanner state shared by extraction and repair.
struct Scan {
    stack: Vec<char>,
    in_string: Option<char>,
    escape: bool,
}

impl Scan {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            in_string: None,
            escape: false,
        }
    }

    /// Feed one character. Returns `Some(event)` for structural characters
    /// outside strings, `None` otherwise.
    fn step(&mut self, ch: char) -> Option<ScanEvent> {
        if let Some(quote) = self.in_string {
            if self.escape {
                self.escape = false;
            } else if ch == '\\' {
                self.escape = true;
            } else if ch == quote {
                self.in_string = None;
            }
            return None;
        }
        match ch {
            // Single quotes are not JSON, but models emit them; treating
            // them as strings keeps braces inside from being counted.
            '"' | '\'' => {
                self.in_string = Some(ch);
                None
            }
            '{' | '[' => {
                self.stack.push(ch);
                Some(ScanEvent::Open)
            }
            '}' | ']' => {
                let Some(opener) = self.stack.pop() else {
                    // Stray closer before any opener; skip it.
                    return None;
                };
                let matched = (opener == '{' && ch == '}') || (opener == '[' && ch == ']');
                if !matched {
                    return Some(ScanEvent::Mismatch);
                }
                if self.stack.is_empty() {
                    Some(ScanEvent::Balanced)
                } else if ch == '}' {
                    Some(ScanEvent::ClosedObject)
                } else {
                    Some(ScanEvent::ClosedArray)
                }
            }
            _ => None,
        }
    }
}

enum ScanEvent {
    Open,
    Balanced,
    ClosedObject,
    ClosedArray,
    Mismatch,
}

fn first_open(text: &str) -> Option<usize> {
    text.find(['{', '['])
}

/// Extract the first complete JSON value by balanced-brace scanning.
///
/// Returns `None` on mismatched closers; stray closers before any opener
/// are ignored.
pub fn extract_first_json(text: &str) -> Option<&str> {
    let start = first_open(text)?;
    let mut scan = Scan::new();
    for (idx, ch) in text[start..].char_indices() {
        match scan.step(ch) {
            Some(ScanEvent::Balanced) => {
                return Some(&text[start..start + idx + ch.len_utf8()]);
            }
            Some(ScanEvent::Mismatch) => return None,
            _ => {}
        }
    }
    None
}

/// Repair a truncated JSON value: cut back to the last completely closed
/// object and append the closers still open there.
///
/// Truncating at an object boundary drops at most the trailing, partially
/// emitted element; everything before it survives. Input that balances on
/// its own is returned whole. `None` when no object ever closed.
pub fn repair_truncated(text: &str) -> Option<String> {
    let start = first_open(text)?;
    let mut scan = Scan::new();
    let mut last_safe: Option<(usize, Vec<char>)> = None;

    for (idx, ch) in text[start..].char_indices() {
        match scan.step(ch) {
            Some(ScanEvent::Balanced) => {
                return Some(text[start..start + idx + ch.len_utf8()].to_string());
            }
            Some(ScanEvent::Mismatch) => return None,
            Some(ScanEvent::ClosedObject) => {
                last_safe = Some((start + idx, scan.stack.clone()));
            }
            _ => {}
        }
    }

    let (end, remaining) = last_safe?;
    let mut repaired = text[start..=end].to_string();
    for opener in remaining.iter().rev() {
        repaired.push(if *opener == '{' { '}' } else { ']' });
    }
    Some(repaired)
}
