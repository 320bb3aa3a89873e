// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Repair of malformed tool calls from server parse-error messages.
//!
//! When the server reports `error parsing tool call`, the offending JSON is
//! usually embedded in the message (often with smart quotes or other
//! Unicode punctuation the model substituted).  This module pulls the
//! fragment out, normalises it, and reconstructs the call.

use regex::Regex;
use serde_json::Value;
use tracing::debug;
use vidar_tools::ToolCall;

use crate::textcalls::balanced_object_at;

/// Attempt to reconstruct a tool call from a parse-error message.
pub fn recover_tool_call(error_message: &str) -> Option<ToolCall> {
    let fragment = extract_fragment(error_message)?;
    let normalized = normalize_quotes(&fragment);
    // Escalating repairs: as-is, then invalid escape sequences fixed, then
    // doubled quotes collapsed (smart quotes inside an already-quoted value
    // normalise to `""`).
    let v: Value = serde_json::from_str(&normalized)
        .or_else(|_| serde_json::from_str(&fix_invalid_escapes(&normalized)))
        .or_else(|_| serde_json::from_str(&normalized.replace("\"\"", "\"")))
        .ok()?;

    let args = v
        .get("arguments")
        .or_else(|| v.get("args"))
        .cloned()
        .unwrap_or_else(|| {
            // No argument wrapper: treat the whole object minus "name" as args.
            let mut obj = v.as_object().cloned().unwrap_or_default();
            obj.remove("name");
            Value::Object(obj)
        });

    let name = match v.get("name").and_then(|n| n.as_str()) {
        Some(n) => n.to_string(),
        None => {
            let inferred = infer_tool_name(&args)?;
            debug!(tool = inferred, "inferred tool name from argument shape");
            inferred.to_string()
        }
    };

    Some(ToolCall::from_value(name, args))
}

/// Pull the JSON fragment out of the error message.
///
/// Servers embed it in a few shapes: `raw='{…}'`, `raw="{…}"`, or just
/// inline.  The fallback takes the first balanced object in the message.
fn extract_fragment(msg: &str) -> Option<String> {
    let quoted = Regex::new(r#"raw\s*=\s*['"]"#).expect("raw pattern");
    if let Some(m) = quoted.find(msg) {
        let rest = &msg[m.end()..];
        if let Some(start) = rest.find('{') {
            if let Some(obj) = balanced_object_at(rest, start) {
                return Some(obj.to_string());
            }
        }
    }
    let start = msg.find('{')?;
    balanced_object_at(msg, start).map(|s| s.to_string())
}

/// Normalise every Unicode quote variant to ASCII `"`.
///
/// Covers smart double quotes, single smart quotes used as string
/// delimiters, full-width quotes, and CJK corner brackets.
pub fn normalize_quotes(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => '"', // “ ” „ ‟
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => '"', // ‘ ’ ‚ ‛
            '\u{FF02}' | '\u{FF07}' => '"',                           // ＂ ＇
            '\u{300C}' | '\u{300D}' | '\u{300E}' | '\u{300F}' => '"', // 「 」 『 』
            '\u{301D}' | '\u{301E}' | '\u{301F}' => '"',              // 〝 〞 〟
            other => other,
        })
        .collect()
}

/// Escape any invalid JSON escape sequence inside string values.
///
/// Valid escapes are `"` `\` `/` `b` `f` `n` `r` `t` `u`; models
/// occasionally emit things like `\c` or `\(` which fail to parse.  The
/// stray backslash is doubled so the value round-trips.
fn fix_invalid_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

/// Infer a tool name from a recognisable argument shape.
fn infer_tool_name(args: &Value) -> Option<&'static str> {
    let obj = args.as_object()?;
    let has = |k: &str| obj.contains_key(k);
    if has("query") {
        return Some("search");
    }
    if has("path") && has("content") {
        return Some("write_file");
    }
    if has("command") {
        return Some("terminal");
    }
    if has("symbolName") && has("path") {
        return Some("find_definition");
    }
    if has("path") {
        return Some("read_file");
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_from_raw_single_quoted_fragment() {
        let msg = r#"error parsing tool call: raw='{"name":"read_file","arguments":{"path":"src/a.ts"}}'"#;
        let call = recover_tool_call(msg).unwrap();
        assert_eq!(call.name, "read_file");
        assert_eq!(call.str_arg("path"), Some("src/a.ts"));
    }

    #[test]
    fn recovers_from_inline_fragment() {
        let msg = r#"error parsing tool call near {"name":"grep","arguments":{"query":"foo"}} at pos 3"#;
        let call = recover_tool_call(msg).unwrap();
        assert_eq!(call.name, "grep");
    }

    #[test]
    fn normalizes_smart_quotes() {
        let msg = "error parsing tool call: raw='{\u{201C}name\u{201D}:\u{201C}read_file\u{201D},\u{201C}arguments\u{201D}:{\u{201C}path\u{201D}:\u{201C}src/a.ts\u{201D}}}'";
        let call = recover_tool_call(msg).unwrap();
        assert_eq!(call.name, "read_file");
        assert_eq!(call.str_arg("path"), Some("src/a.ts"));
    }

    #[test]
    fn normalizes_cjk_brackets() {
        assert_eq!(normalize_quotes("「x」"), "\"x\"");
        assert_eq!(normalize_quotes("\u{FF02}y\u{FF02}"), "\"y\"");
    }

    #[test]
    fn smart_quotes_as_string_delimiters_recover() {
        let msg = "raw='{\"name\":\"read_file\",\"arguments\":{\"path\":\u{201C}src/a.ts\u{201D}}}'";
        let call = recover_tool_call(msg).unwrap();
        assert_eq!(call.name, "read_file");
        assert_eq!(call.str_arg("path"), Some("src/a.ts"));
    }

    #[test]
    fn smart_quotes_inside_quoted_value_collapse() {
        let msg = r#"raw='{"name":"read_file","arguments":{"path":"“src/a.ts”"}}'"#;
        let call = recover_tool_call(msg).unwrap();
        assert_eq!(call.name, "read_file");
        assert_eq!(call.str_arg("path"), Some("src/a.ts"));
    }

    #[test]
    fn infers_search_from_query_arg() {
        let msg = r#"raw='{"arguments":{"query":"needle"}}'"#;
        let call = recover_tool_call(msg).unwrap();
        assert_eq!(call.name, "search");
    }

    #[test]
    fn infers_write_from_path_and_content() {
        let msg = r#"raw='{"arguments":{"path":"a.rs","content":"x"}}'"#;
        assert_eq!(recover_tool_call(msg).unwrap().name, "write_file");
    }

    #[test]
    fn infers_terminal_from_command() {
        let msg = r#"raw='{"arguments":{"command":"ls"}}'"#;
        assert_eq!(recover_tool_call(msg).unwrap().name, "terminal");
    }

    #[test]
    fn infers_find_definition_from_symbol_and_path() {
        let msg = r#"raw='{"arguments":{"symbolName":"main","path":"a.rs"}}'"#;
        assert_eq!(recover_tool_call(msg).unwrap().name, "find_definition");
    }

    #[test]
    fn infers_read_file_from_bare_path() {
        let msg = r#"raw='{"arguments":{"path":"a.rs"}}'"#;
        assert_eq!(recover_tool_call(msg).unwrap().name, "read_file");
    }

    #[test]
    fn flat_object_without_wrapper_becomes_args() {
        let msg = r#"raw='{"command":"cargo check"}'"#;
        let call = recover_tool_call(msg).unwrap();
        assert_eq!(call.name, "terminal");
        assert_eq!(call.str_arg("command"), Some("cargo check"));
    }

    #[test]
    fn invalid_escape_sequences_are_repaired() {
        let msg = r#"raw='{"name":"grep","arguments":{"query":"\cpp$"}}'"#;
        let call = recover_tool_call(msg).unwrap();
        assert_eq!(call.name, "grep");
        assert_eq!(call.str_arg("query"), Some("\\cpp$"));
    }

    #[test]
    fn fix_invalid_escapes_leaves_valid_json_alone() {
        let valid = r#"{"a":"line\nbreak \"quoted\""}"#;
        assert_eq!(fix_invalid_escapes(valid), valid);
    }

    #[test]
    fn unrecoverable_message_returns_none() {
        assert!(recover_tool_call("error parsing tool call: no json here").is_none());
        assert!(recover_tool_call(r#"raw='{"arguments":{"zzz":1}}'"#).is_none());
    }
}
