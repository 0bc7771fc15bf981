//! `{{variable}}` placeholder handling.
//!
//! Three operations:
//! - [`extract_variable_names`] lists placeholders in order of first appearance,
//! - [`resolve`] substitutes values and leaves unknown names as `[name]`,
//! - [`validate`] reports names that have no value.
//!
//! Nested delimiters are not supported; whitespace inside the braces is
//! trimmed, so `{{ lang }}` and `{{lang}}` name the same variable.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{([^{}]*)\}\}").expect("valid placeholder regex"))
}

/// Every distinct variable name in `template`, in order of first appearance.
pub fn extract_variable_names(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in placeholder().captures_iter(template) {
        let name = caps[1].trim();
        if name.is_empty() || names.iter().any(|n| n == name) {
            continue;
        }
        names.push(name.to_string());
    }
    names
}

/// Substitute every `{{name}}` with `values[name]`.
///
/// Names without a value render as `[name]` so partial previews stay
/// readable. Substituted values are never expanded: a placeholder inside a
/// value is masked to the same `[name]` form, so the output holds no
/// `{{...}}` token for any bound name.
pub fn resolve(template: &str, values: &HashMap<String, String>) -> String {
    resolve_with(template, |name| values.get(name).cloned())
}

/// Like [`resolve`], with values supplied by a lookup function.
pub fn resolve_with<F>(template: &str, mut lookup: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    if !template.contains("{{") {
        return template.to_string();
    }
    placeholder()
        .replace_all(template, |caps: &Captures<'_>| {
            let name = caps[1].trim();
            if name.is_empty() {
                return caps[0].to_string();
            }
            match lookup(name) {
                Some(value) => mask_placeholders(&value),
                None => format!("[{}]", name),
            }
        })
        .into_owned()
}

fn mask_placeholders(value: &str) -> String {
    if !value.contains("{{") {
        return value.to_string();
    }
    placeholder()
        .replace_all(value, |caps: &Captures<'_>| {
            let name = caps[1].trim();
            if name.is_empty() {
                caps[0].to_string()
            } else {
                format!("[{}]", name)
            }
        })
        .into_owned()
}

/// Outcome of checking a template against a set of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateValidation {
    pub valid: bool,
    pub missing: Vec<String>,
}

/// Report every variable in `template` that has no entry in `values`.
pub fn validate(template: &str, values: &HashMap<String, String>) -> TemplateValidation {
    let missing = missing_variables(template, |name| values.contains_key(name));
    TemplateValidation {
        valid: missing.is_empty(),
        missing,
    }
}

/// Names in `template` for which `is_bound` returns false.
pub fn missing_variables<F>(template: &str, is_bound: F) -> Vec<String>
where
    F: Fn(&str) -> bool,
{
    extract_variable_names(template)
        .into_iter()
        .filter(|name| !is_bound(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn extracts_in_first_appearance_order() {
        let names = extract_variable_names("Review this {{lang}} code: {{code}} ({{ lang }})");
        assert_eq!(names, vec!["lang", "code"]);
    }

    #[test]
    fn empty_template() {
        assert!(extract_variable_names("").is_empty());
        assert_eq!(resolve("", &HashMap::new()), "");
    }

    #[test]
    fn ignores_empty_braces() {
        assert!(extract_variable_names("nothing {{ }} here").is_empty());
        assert_eq!(resolve("nothing {{}} here", &HashMap::new()), "nothing {{}} here");
    }

    #[test]
    fn resolves_known_and_marks_unknown() {
        let out = resolve(
            "Review this {{lang}} code: {{ code }}",
            &values(&[("lang", "rust")]),
        );
        assert_eq!(out, "Review this rust code: [code]");
    }

    #[test]
    fn resolved_output_has_no_placeholders() {
        let template = "{{a}} and {{b}} and {{a}}";
        let vals = values(&[("a", "1"), ("b", "2")]);
        let out = resolve(template, &vals);
        assert_eq!(out, "1 and 2 and 1");
        assert!(extract_variable_names(&out).is_empty());
    }

    #[test]
    fn placeholders_inside_values_are_masked() {
        let vals = values(&[("a", "{{b}}"), ("b", "x"), ("c", "see {{ a }} and {{zzz}}")]);
        assert_eq!(resolve("{{a}}", &vals), "[b]");
        assert_eq!(resolve("{{c}}!", &vals), "see [a] and [zzz]!");

        // Self-reference neither loops nor leaks a token.
        let out = resolve("{{a}}", &values(&[("a", "{{a}}")]));
        assert_eq!(out, "[a]");
        assert!(extract_variable_names(&out).is_empty());
    }

    #[test]
    fn validate_reports_missing() {
        let check = validate("{{a}} {{b}} {{c}}", &values(&[("b", "")]));
        assert!(!check.valid);
        assert_eq!(check.missing, vec!["a", "c"]);

        let check = validate("{{a}}", &values(&[("a", "x")]));
        assert!(check.valid);
        assert!(check.missing.is_empty());
    }
}
