// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Permissive parsing for tool-call JSON that is still streaming in.
//!
//! Providers deliver tool-call arguments as raw text fragments; UIs want to
//! render the arguments while they stream.  [`parse_streaming_json`] first
//! tries a strict parse and then falls back to completing the buffer
//! (closing open strings, brackets and literals) before parsing again.
//! Failures yield an empty object — the function never errors.

use serde_json::{Map, Value};

/// Best-effort parse of a (possibly incomplete) JSON object.
///
/// Any prefix of a valid JSON object yields an object — possibly empty,
/// possibly missing the trailing fields that have not streamed yet.  Input
/// that cannot be salvaged, or that parses to a non-object, yields `{}`.
pub fn parse_streaming_json(input: &str) -> Value {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Value::Object(Map::new());
    }
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return into_object(v);
    }
    if let Some(completed) = complete_json(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(&completed) {
            return into_object(v);
        }
    }
    Value::Object(Map::new())
}

fn into_object(v: Value) -> Value {
    match v {
        Value::Object(_) => v,
        _ => Value::Object(Map::new()),
    }
}

enum Frame {
    Object { expecting_key: bool },
    Array,
}

/// Complete a truncated JSON document so that a strict parser accepts it.
///
/// Tracks string/escape state and the open-container stack, then repairs the
/// tail: an unterminated key is dropped, an unterminated value string is
/// closed, dangling commas/colons and partial literals or number tails are
/// fixed up, and the remaining containers are closed in reverse order.
fn complete_json(s: &str) -> Option<String> {
    let mut stack: Vec<Frame> = Vec::new();
    let mut in_string = false;
    let mut escape = false;
    let mut string_start = 0usize;
    let mut string_is_key = false;

    for (i, c) in s.char_indices() {
        if in_string {
            if escape {
                escape = false;
                continue;
            }
            match c {
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                string_start = i;
                string_is_key =
                    matches!(stack.last(), Some(Frame::Object { expecting_key: true }));
            }
            '{' => stack.push(Frame::Object { expecting_key: true }),
            '[' => stack.push(Frame::Array),
            '}' | ']' => {
                stack.pop()?;
            }
            ':' => {
                if let Some(Frame::Object { expecting_key }) = stack.last_mut() {
                    *expecting_key = false;
                }
            }
            ',' => {
                if let Some(Frame::Object { expecting_key }) = stack.last_mut() {
                    *expecting_key = true;
                }
            }
            _ => {}
        }
    }

    let mut out = s.to_string();

    if in_string {
        if string_is_key {
            // An incomplete key carries no information yet — drop it.
            out.truncate(string_start);
        } else {
            if escape {
                // Dangling backslash cannot be closed into a valid escape.
                out.pop();
            }
            trim_partial_unicode_escape(&mut out);
            out.push('"');
        }
    }

    cleanup_tail(&mut out);

    // A closed key with no value yet: `{"a":1,"b"` → give it a null value.
    if !in_string
        && out.ends_with('"')
        && matches!(stack.last(), Some(Frame::Object { expecting_key: true }))
    {
        out.push_str(":null");
    }

    for frame in stack.iter().rev() {
        out.push(match frame {
            Frame::Object { .. } => '}',
            Frame::Array => ']',
        });
    }
    Some(out)
}

/// Fix the tail of the document body: trailing whitespace, dangling commas,
/// a dangling colon, a partial `true`/`false`/`null`, or a number cut at a
/// sign/exponent/decimal point.
fn cleanup_tail(out: &mut String) {
    while out.ends_with(|c: char| c.is_whitespace()) {
        out.pop();
    }
    while out.ends_with(',') {
        out.pop();
        while out.ends_with(|c: char| c.is_whitespace()) {
            out.pop();
        }
    }
    if out.ends_with(':') {
        out.push_str("null");
        return;
    }
    let tail: String = {
        let rev: String = out
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        rev.chars().rev().collect()
    };
    if !tail.is_empty() {
        for lit in ["true", "false", "null"] {
            if tail.as_str() == lit {
                return;
            }
            if lit.starts_with(tail.as_str()) && tail.len() < lit.len() {
                out.push_str(&lit[tail.len()..]);
                return;
            }
        }
        // A number cut right after its exponent marker: `1.5e` / `2E`.
        let digit_before = out
            .len()
            .checked_sub(tail.len() + 1)
            .and_then(|i| out.as_bytes().get(i))
            .is_some_and(|b| b.is_ascii_digit());
        if (tail == "e" || tail == "E") && digit_before {
            out.push('0');
        }
        return;
    }
    if out.ends_with(['-', '+', '.']) {
        out.push('0');
    }
}

/// Drop a trailing `\uXX…` escape that has fewer than four hex digits.
fn trim_partial_unicode_escape(out: &mut String) {
    let bytes = out.as_bytes();
    let mut i = bytes.len();
    let mut hex = 0usize;
    while i > 0 && hex < 4 && bytes[i - 1].is_ascii_hexdigit() {
        i -= 1;
        hex += 1;
    }
    if hex == 4 {
        return;
    }
    if i >= 2 && bytes[i - 1] == b'u' && bytes[i - 2] == b'\\' {
        // The backslash must itself be unescaped.
        let mut preceding = 0usize;
        let mut j = i - 2;
        while j > 0 && bytes[j - 1] == b'\\' {
            preceding += 1;
            j -= 1;
        }
        if preceding % 2 == 0 {
            out.truncate(i - 2);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
