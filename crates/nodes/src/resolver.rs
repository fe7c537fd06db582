//! Path-based template substitution.
//!
//! `{{a.b[0].c}}` tokens inside string parameters are replaced by the value at
//! that path in the context (all prior node outputs). The resolver never fails:
//! a token whose path does not resolve is left verbatim.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^}]+)\}\}").expect("token pattern is valid"));

/// Resolve every token in `value` against `context`.
///
/// Non-string values are returned unchanged.
pub fn resolve(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(resolve_str(s, context)),
        other => other.clone(),
    }
}

/// Resolve every token in a string against `context`.
pub fn resolve_str(template: &str, context: &Value) -> String {
    if !template.contains("{{") {
        return template.to_owned();
    }

    TOKEN
        .replace_all(template, |caps: &Captures<'_>| {
            let path = caps[1].trim();
            match lookup(context, path) {
                Some(found) => {
                    tracing::trace!(path, "resolved template token");
                    render(found)
                }
                None => {
                    tracing::debug!(path, "template token left unresolved");
                    caps[0].to_owned()
                }
            }
        })
        .into_owned()
}

/// Walk `context` along a dot-separated path with optional `name[i]` indexing.
///
/// Returns `None` as soon as a segment is missing or `null`.
pub fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = step(current, segment.trim())?;
        if current.is_null() {
            return None;
        }
    }
    Some(current)
}

fn step<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    let (name, mut indices) = match segment.find('[') {
        Some(i) => (&segment[..i], &segment[i..]),
        None => (segment, ""),
    };

    let mut current = if name.is_empty() {
        value
    } else {
        field(value, name)?
    };

    while !indices.is_empty() {
        let inner = indices.strip_prefix('[')?;
        let end = inner.find(']')?;
        let index: usize = inner[..end].trim().parse().ok()?;
        current = current.get(index)?;
        indices = &inner[end + 1..];
    }

    Some(current)
}

fn field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(name),
        Value::Array(items) => items.get(name.parse::<usize>().ok()?),
        _ => None,
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        // Objects and arrays are inlined as compact JSON text.
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_path() {
        let ctx = json!({ "a": { "b": "x" } });
        assert_eq!(resolve_str("{{a.b}}", &ctx), "x");
    }

    #[test]
    fn missing_path_leaves_token_verbatim() {
        let ctx = json!({ "a": {} });
        assert_eq!(resolve_str("{{a.b}}", &ctx), "{{a.b}}");
    }

    #[test]
    fn null_segment_aborts_the_walk() {
        let ctx = json!({ "a": null });
        assert_eq!(resolve_str("hi {{a.b.c}}", &ctx), "hi {{a.b.c}}");
    }

    #[test]
    fn plain_string_is_returned_byte_identical() {
        let ctx = json!({ "a": 1 });
        let plain = "no tokens here, just {braces} and }} stray";
        assert_eq!(resolve_str(plain, &ctx), plain);
    }

    #[test]
    fn non_string_values_pass_through() {
        let ctx = json!({ "a": 1 });
        assert_eq!(resolve(&json!(42), &ctx), json!(42));
        assert_eq!(resolve(&json!({ "k": "{{a}}" }), &ctx), json!({ "k": "{{a}}" }));
    }

    #[test]
    fn array_index_segments() {
        let ctx = json!({ "items": [ { "name": "first" }, { "name": "second" } ] });
        assert_eq!(resolve_str("{{items[1].name}}", &ctx), "second");
        assert_eq!(resolve_str("{{items.0.name}}", &ctx), "first");
        assert_eq!(resolve_str("{{items[5].name}}", &ctx), "{{items[5].name}}");
    }

    #[test]
    fn objects_are_serialized_and_scalars_stringified() {
        let ctx = json!({ "obj": { "k": 1 }, "n": 3.5, "flag": true });
        assert_eq!(resolve_str("{{obj}}", &ctx), r#"{"k":1}"#);
        assert_eq!(resolve_str("{{ n }} / {{flag}}", &ctx), "3.5 / true");
    }

    #[test]
    fn mixed_tokens_resolve_independently() {
        let ctx = json!({ "previousNode": { "content": "hello" } });
        assert_eq!(
            resolve_str("say {{previousNode.content}} to {{user.name}}", &ctx),
            "say hello to {{user.name}}"
        );
    }

    #[test]
    fn resolving_twice_is_a_no_op() {
        let ctx = json!({ "a": { "b": "x" } });
        let once = resolve_str("value={{a.b}}", &ctx);
        assert_eq!(resolve_str(&once, &ctx), once);
    }
}
