//! Structured-output extraction from free model text.
//!
//! Models asked for JSON wrap it in prose, fences, labels and reasoning
//! blocks. [`extract_json`] strips reasoning and then tries each strategy in
//! order until one yields a value of the requested root kind:
//!
//! 1. a ```` ```json ```` fence
//! 2. any fence
//! 3. a bracket-balanced scan from the first expected opening character
//! 4. a greedy match from the first opener to the last closer
//! 5. a balanced scan after a prefix label such as `JSON:` or `Ответ:`
//!
//! The winning strategy is reported as an [`ExtractionMethod`].

use crate::text::{balanced_slice, excerpt, fences, strip_reasoning};
use crate::{Error, Result};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::LazyLock;

const EXCERPT_CHARS: usize = 200;

static GREEDY_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));
static GREEDY_ARRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[.*\]").expect("valid regex"));
static PREFIX_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:json|result|output|answer|ответ|результат|вывод)\s*:")
        .expect("valid regex")
});

/// Root kind the caller expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonKind {
    Object,
    Array,
}

impl JsonKind {
    fn opener(self) -> char {
        match self {
            JsonKind::Object => '{',
            JsonKind::Array => '[',
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            JsonKind::Object => value.is_object(),
            JsonKind::Array => value.is_array(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JsonKind::Object => "object",
            JsonKind::Array => "array",
        }
    }
}

impl fmt::Display for JsonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy that produced the extracted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    JsonFence,
    AnyFence,
    BalancedScan,
    GreedyRegex,
    PrefixLabel,
}

/// A successfully extracted JSON value.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub value: Value,
    /// The exact text that parsed.
    pub raw: String,
    pub method: ExtractionMethod,
}

/// Typed parse result.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub value: T,
    pub method: ExtractionMethod,
}

type Strategy = fn(&str, JsonKind) -> Option<(Value, String)>;

const STRATEGIES: &[(ExtractionMethod, Strategy)] = &[
    (ExtractionMethod::JsonFence, json_fence),
    (ExtractionMethod::AnyFence, any_fence),
    (ExtractionMethod::BalancedScan, balanced_scan),
    (ExtractionMethod::GreedyRegex, greedy_regex),
    (ExtractionMethod::PrefixLabel, prefix_label),
];

/// Extract the first JSON value of `kind` from `text`.
pub fn extract_json(text: &str, kind: JsonKind) -> Result<Extracted> {
    let cleaned = strip_reasoning(text);
    for (method, strategy) in STRATEGIES {
        if let Some((value, raw)) = strategy(&cleaned, kind) {
            return Ok(Extracted {
                value,
                raw,
                method: *method,
            });
        }
    }
    Err(Error::Parse {
        kind: kind.to_string(),
        excerpt: excerpt(text, EXCERPT_CHARS),
    })
}

/// Extract and deserialize into `T`. A shape mismatch is a parse failure too.
pub fn parse_response<T: DeserializeOwned>(text: &str, kind: JsonKind) -> Result<Parsed<T>> {
    let extracted = extract_json(text, kind)?;
    match serde_json::from_value(extracted.value) {
        Ok(value) => Ok(Parsed {
            value,
            method: extracted.method,
        }),
        Err(e) => Err(Error::Parse {
            kind: format!("{kind} of the expected shape ({e})"),
            excerpt: excerpt(text, EXCERPT_CHARS),
        }),
    }
}

fn parse_as(candidate: &str, kind: JsonKind) -> Option<(Value, String)> {
    let candidate = candidate.trim();
    let value: Value = serde_json::from_str(candidate).ok()?;
    kind.matches(&value).then(|| (value, candidate.to_string()))
}

/// Whole body first, then a balanced value inside it.
fn from_fence_body(body: &str, kind: JsonKind) -> Option<(Value, String)> {
    parse_as(body, kind).or_else(|| balanced_scan(body, kind))
}

fn json_fence(text: &str, kind: JsonKind) -> Option<(Value, String)> {
    fences(text)
        .into_iter()
        .filter(|f| f.lang.eq_ignore_ascii_case("json"))
        .find_map(|f| from_fence_body(f.body, kind))
}

fn any_fence(text: &str, kind: JsonKind) -> Option<(Value, String)> {
    fences(text)
        .into_iter()
        .find_map(|f| from_fence_body(f.body, kind))
}

fn balanced_scan(text: &str, kind: JsonKind) -> Option<(Value, String)> {
    let start = text.find(kind.opener())?;
    parse_as(balanced_slice(text, start)?, kind)
}

fn greedy_regex(text: &str, kind: JsonKind) -> Option<(Value, String)> {
    let re = match kind {
        JsonKind::Object => &*GREEDY_OBJECT,
        JsonKind::Array => &*GREEDY_ARRAY,
    };
    // Outermost span from each opener in turn, so prose braces ahead of the
    // payload do not hide it.
    let mut from = 0;
    while let Some(m) = re.find_at(text, from) {
        if let Some(found) = parse_as(m.as_str(), kind) {
            return Some(found);
        }
        // Openers are ASCII, so one byte past the match start is a boundary.
        from = m.start() + 1;
    }
    None
}

fn prefix_label(text: &str, kind: JsonKind) -> Option<(Value, String)> {
    PREFIX_LABEL
        .find_iter(text)
        .find_map(|m| balanced_scan(&text[m.end()..], kind))
}
