//! `{{ variable }}` substitution for prompts and tool arguments.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use baton_core::error::{BatonError, Result};
use baton_core::types::value_to_text;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}")
            .expect("placeholder pattern is valid")
    })
}

/// Resolve a dotted path (`item.title`, `rows.0.name`) against a variable map.
pub fn lookup_path<'a>(
    vars: &'a HashMap<String, serde_json::Value>,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut parts = path.split('.');
    let mut current = vars.get(parts.next()?)?;
    for part in parts {
        current = match current {
            serde_json::Value::Object(map) => map.get(part)?,
            serde_json::Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Full placeholder paths in `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    placeholder_re()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Root variable names referenced by `template` (`item` for `{{ item.title }}`).
pub fn referenced_variables(template: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for path in placeholders(template) {
        let root = root_of(&path).to_string();
        if !out.contains(&root) {
            out.push(root);
        }
    }
    out
}

/// Root variable names referenced by strings anywhere inside `value`.
pub fn referenced_in_value(value: &serde_json::Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_value_refs(value, &mut out);
    out
}

fn collect_value_refs(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => {
            for var in referenced_variables(s) {
                if !out.contains(&var) {
                    out.push(var);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_value_refs(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_value_refs(v, out)),
        _ => {}
    }
}

pub(crate) fn root_of(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// Substitute every placeholder with the text form of its value.
///
/// A placeholder that does not resolve is an `UnresolvedVariable` error
/// naming `step`.
pub fn render(step: &str, template: &str, vars: &HashMap<String, serde_json::Value>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder_re().captures_iter(template) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = lookup_path(vars, path.as_str()).ok_or_else(|| BatonError::UnresolvedVariable {
            step: step.to_string(),
            variable: path.as_str().to_string(),
        })?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(&value_to_text(value));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Render every string inside a JSON value. A string that is exactly one
/// placeholder becomes the raw referenced value, keeping its structure.
pub fn render_value(
    step: &str,
    value: &serde_json::Value,
    vars: &HashMap<String, serde_json::Value>,
) -> Result<serde_json::Value> {
    Ok(match value {
        serde_json::Value::String(s) => {
            if let Some(path) = sole_placeholder(s) {
                lookup_path(vars, path)
                    .cloned()
                    .ok_or_else(|| BatonError::UnresolvedVariable {
                        step: step.to_string(),
                        variable: path.to_string(),
                    })?
            } else {
                serde_json::Value::String(render(step, s, vars)?)
            }
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|v| render_value(step, v, vars))
                .collect::<Result<Vec<_>>>()?,
        ),
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(step, v, vars)?);
            }
            serde_json::Value::Object(out)
        }
        other => other.clone(),
    })
}

fn sole_placeholder(s: &str) -> Option<&str> {
    let caps = placeholder_re().captures(s.trim())?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == s.trim().len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> HashMap<String, serde_json::Value> {
        let mut v = HashMap::new();
        v.insert("greeting".into(), json!("Hello"));
        v.insert("count".into(), json!(3));
        v.insert("item".into(), json!({"title": "Intro", "pages": [1, 2]}));
        v
    }

    #[test]
    fn test_render_simple() {
        assert_eq!(render("s", "Summarize: {{greeting}}", &vars()).unwrap(), "Summarize: Hello");
        assert_eq!(render("s", "{{ greeting }}, {{ count }}x", &vars()).unwrap(), "Hello, 3x");
    }

    #[test]
    fn test_render_dotted() {
        assert_eq!(render("s", "Title: {{ item.title }}", &vars()).unwrap(), "Title: Intro");
        assert_eq!(render("s", "{{ item.pages.1 }}", &vars()).unwrap(), "2");
    }

    #[test]
    fn test_render_object_as_json() {
        let out = render("s", "{{ item.pages }}", &vars()).unwrap();
        assert_eq!(out, "[1,2]");
    }

    #[test]
    fn test_render_unresolved() {
        match render("s2", "{{ nope }}", &vars()).unwrap_err() {
            BatonError::UnresolvedVariable { step, variable } => {
                assert_eq!(step, "s2");
                assert_eq!(variable, "nope");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_render_without_placeholders() {
        assert_eq!(render("s", "plain {text}", &HashMap::new()).unwrap(), "plain {text}");
    }

    #[test]
    fn test_render_value_keeps_structure() {
        let args = json!({
            "query": "about {{ item.title }}",
            "pages": "{{ item.pages }}",
            "n": "{{count}}",
            "fixed": 7,
        });
        let out = render_value("s", &args, &vars()).unwrap();
        assert_eq!(out["query"], json!("about Intro"));
        assert_eq!(out["pages"], json!([1, 2]));
        assert_eq!(out["n"], json!(3));
        assert_eq!(out["fixed"], json!(7));
    }

    #[test]
    fn test_referenced_variables() {
        assert_eq!(
            referenced_variables("{{ a }} and {{ b.c }} and {{a}}"),
            vec!["a".to_string(), "b".to_string()]
        );
        let refs = referenced_in_value(&json!({"x": ["{{ p }}", {"y": "{{ q.r }}"}]}));
        assert!(refs.contains(&"p".to_string()));
        assert!(refs.contains(&"q".to_string()));
    }
}
