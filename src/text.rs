//! Low-level text scanning shared by the resolver and the response parser.

use std::borrow::Cow;

/// Reasoning decorations some models wrap around their answer.
const REASONING_TAGS: &[(&str, &str)] = &[
    ("<think>", "</think>"),
    ("<thinking>", "</thinking>"),
    ("<reasoning>", "</reasoning>"),
];

/// Outcome of a bracket-balanced scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scan {
    /// Depth returned to zero; the value is the byte index one past the closer.
    Balanced(usize),
    /// Text ended while brackets were still open.
    Unterminated,
}

/// Scan from the opening `{` or `[` at `start` until depth returns to zero.
///
/// Brackets inside string literals are ignored and `\"` does not close a
/// string. Both bracket kinds share one depth counter.
pub(crate) fn scan_balanced(text: &str, start: usize) -> Scan {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
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
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Scan::Balanced(start + offset + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    Scan::Unterminated
}

/// Slice of the balanced value starting at `start`, if it closes.
pub(crate) fn balanced_slice(text: &str, start: usize) -> Option<&str> {
    match scan_balanced(text, start) {
        Scan::Balanced(end) => Some(&text[start..end]),
        Scan::Unterminated => None,
    }
}

/// Remove reasoning blocks. An unterminated block is dropped to end of text;
/// a dangling closer (opening tag swallowed by the template) drops everything before it.
pub fn strip_reasoning(text: &str) -> Cow<'_, str> {
    if !REASONING_TAGS
        .iter()
        .any(|(open, close)| text.contains(open) || text.contains(close))
    {
        return Cow::Borrowed(text);
    }

    let mut out = text.to_string();
    for (open, close) in REASONING_TAGS {
        loop {
            let Some(begin) = out.find(open) else {
                if let Some(end) = out.find(close) {
                    out.replace_range(..end + close.len(), "");
                    continue;
                }
                break;
            };
            match out[begin + open.len()..].find(close) {
                Some(rel) => {
                    let end = begin + open.len() + rel + close.len();
                    out.replace_range(begin..end, "");
                }
                None => out.truncate(begin),
            }
        }
    }
    Cow::Owned(out.trim().to_string())
}

/// Markdown code fence found in text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fence<'a> {
    pub lang: &'a str,
    pub body: &'a str,
    /// The closing fence was missing.
    pub unclosed: bool,
}

/// All ``` fences in order of appearance.
pub(crate) fn fences(text: &str) -> Vec<Fence<'_>> {
    let mut found = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let (lang, body_start) = match after.find('\n') {
            Some(nl) => (after[..nl].trim(), nl + 1),
            None => (after.trim(), after.len()),
        };
        let body_region = &after[body_start..];
        match body_region.find("```") {
            Some(close) => {
                found.push(Fence {
                    lang,
                    body: body_region[..close].trim(),
                    unclosed: false,
                });
                rest = &body_region[close + 3..];
            }
            None => {
                found.push(Fence {
                    lang,
                    body: body_region.trim(),
                    unclosed: true,
                });
                break;
            }
        }
    }
    found
}

/// First `max` characters, with an ellipsis when cut.
pub(crate) fn excerpt(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_balanced_object() {
        let text = r#"x {"a": {"b": 1}} y"#;
        assert_eq!(scan_balanced(text, 2), Scan::Balanced(17));
        assert_eq!(balanced_slice(text, 2), Some(r#"{"a": {"b": 1}}"#));
    }

    #[test]
    fn test_scan_ignores_brackets_in_strings() {
        let text = r#"{"a": "}{][", "b": "say \"}\""}"#;
        assert_eq!(balanced_slice(text, 0), Some(text));
    }

    #[test]
    fn test_scan_unterminated() {
        assert_eq!(scan_balanced(r#"{"name": "lookup", "arguments": {"id": 7"#, 0), Scan::Unterminated);
        assert_eq!(scan_balanced(r#"{"a": "open string }"#, 0), Scan::Unterminated);
    }

    #[test]
    fn test_scan_handles_multibyte() {
        let text = r#"{"name": "молоко"} tail"#;
        assert_eq!(balanced_slice(text, 0), Some(r#"{"name": "молоко"}"#));
    }

    #[test]
    fn test_strip_reasoning_cases() {
        let cases = [
            ("<think>hmm</think>answer", "answer"),
            ("<thinking>a</thinking> b <think>c</think>d", "b d"),
            ("answer <think>never closed {\"x\":1}", "answer"),
            ("leaked reasoning</think>final", "final"),
            ("plain text", "plain text"),
        ];
        for (input, expected) in cases {
            assert_eq!(strip_reasoning(input), expected, "input: {input}");
        }
    }

    #[test]
    fn test_strip_reasoning_borrows_when_untouched() {
        assert!(matches!(strip_reasoning("nothing here"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_fences() {
        let text = "a\n```json\n{\"a\":1}\n```\nb\n```\n[1]\n```";
        let found = fences(text);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].lang, "json");
        assert_eq!(found[0].body, "{\"a\":1}");
        assert_eq!(found[1].lang, "");
        assert_eq!(found[1].body, "[1]");
        assert!(!found[1].unclosed);
    }

    #[test]
    fn test_unclosed_fence() {
        let found = fences("```json\n{\"a\":");
        assert_eq!(found.len(), 1);
        assert!(found[0].unclosed);
    }

    #[test]
    fn test_excerpt() {
        assert_eq!(excerpt("short", 10), "short");
        assert_eq!(excerpt("абвгдеж", 3), "абв…");
    }
}
