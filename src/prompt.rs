//! `{{name}}` placeholder substitution for prompts whose values are already
//! resolved by the host.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}").expect("valid regex")
});

/// Result of [`render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    /// Placeholder names without a value, in order of first appearance.
    pub unknown: Vec<String>,
}

impl Rendered {
    pub fn is_complete(&self) -> bool {
        self.unknown.is_empty()
    }
}

/// Replace every `{{name}}` found in `vars`; unknown placeholders stay as written.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Rendered {
    let mut unknown: Vec<String> = Vec::new();
    let text = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        let name = &caps[1];
        match vars.get(name) {
            Some(value) => value.clone(),
            None => {
                if !unknown.iter().any(|u| u == name) {
                    unknown.push(name.to_string());
                }
                caps[0].to_string()
            }
        }
    });
    Rendered {
        text: text.into_owned(),
        unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_substitutes_known_values() {
        let out = render(
            "Classify {{ item }} into {{categories}}.",
            &vars(&[("item", "Молоко 3.2%"), ("categories", "Dairy, Bakery")]),
        );
        assert_eq!(out.text, "Classify Молоко 3.2% into Dairy, Bakery.");
        assert!(out.is_complete());
    }

    #[test]
    fn test_unknown_left_intact_and_reported_once() {
        let out = render("{{a}} {{missing}} {{missing}}", &vars(&[("a", "1")]));
        assert_eq!(out.text, "1 {{missing}} {{missing}}");
        assert_eq!(out.unknown, vec!["missing".to_string()]);
    }

    #[test]
    fn test_single_braces_untouched() {
        let out = render("Return {\"name\": \"{{name}}\"}", &vars(&[("name", "x")]));
        assert_eq!(out.text, "Return {\"name\": \"x\"}");
    }
}
