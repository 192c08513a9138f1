//! `{placeholder}` rendering for tags, storage paths and index prefixes.
//!
//! Placeholders are `{name}` or dotted `{data.field}`. `{{` and `}}` render
//! literal braces. Values come from a caller-supplied lookup so the same
//! renderer serves tag maps, records and date components.

use anyhow::{Result, bail};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{|\}\}|\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}")
        .expect("valid placeholder regex")
});

/// Render `template`, resolving each placeholder through `lookup`.
///
/// # Errors
///
/// Returns an error naming the first placeholder `lookup` cannot resolve.
pub fn render<F>(template: &str, mut lookup: F) -> Result<String>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        out.push_str(&template[last..whole.start]);
        last = whole.end;
        match caps.get(1) {
            Some(name) => match lookup(name.as_str()) {
                Some(value) => out.push_str(&value),
                None => bail!("template `{template}` has no value for `{}`", name.as_str()),
            },
            None => out.push_str(&template[whole.start..whole.start + 1]),
        }
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Render against a tag map.
///
/// # Errors
///
/// Returns an error if a placeholder names a tag that is not present.
pub fn render_tags(template: &str, tags: &BTreeMap<String, String>) -> Result<String> {
    render(template, |name| tags.get(name).cloned())
}

/// Text form of a JSON value as it appears in paths and tags: strings are
/// unquoted, `null` is empty, everything else is compact JSON.
#[must_use]
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_tags_and_escapes() {
        let tags = BTreeMap::from([
            ("app_id".to_string(), "a1".to_string()),
            ("day".to_string(), "07".to_string()),
        ]);
        assert_eq!(render_tags("ev/{app_id}/{ day }/", &tags).unwrap(), "ev/a1/07/");
        assert_eq!(render_tags("{{x}}-{app_id}", &tags).unwrap(), "{x}-a1");
        assert!(render_tags("{missing}", &tags).is_err());
    }

    #[test]
    fn dotted_names_reach_lookup() {
        let out = render("g={data.user.id}", |name| {
            (name == "data.user.id").then(|| "42".to_string())
        })
        .unwrap();
        assert_eq!(out, "g=42");
    }

    #[test]
    fn value_text_forms() {
        assert_eq!(value_text(&Value::from("x")), "x");
        assert_eq!(value_text(&Value::Null), "");
        assert_eq!(value_text(&Value::from(3)), "3");
    }
}
