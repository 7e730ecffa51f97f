//! `{{token}}` template substitution for step parameters.
//!
//! Resolution always produces a fresh parameter map; the step definition is
//! shared by every concurrent execution and is never written to.
//!
//! Token forms:
//! - `{{name}}` reads `variables[name]`. Unknown names are left verbatim.
//! - `{{step_id.key}}` reads `results[step_id].output[key]` (nested paths
//!   allowed). When `step_id` is not a result but a variable, the path is
//!   read from that variable instead. Unknown paths render as "".
//!
//! A string consisting of exactly one resolvable token yields the referenced
//! JSON value itself, so numbers and objects keep their type.

use std::collections::HashMap;

use autoflow_types::execution::ExecutionContext;
use serde_json::Value;

enum Lookup {
    Found(Value),
    Empty,
    Unresolved,
}

/// Resolve every value of a parameter map into a new map.
pub fn resolve_parameters(
    parameters: &HashMap<String, Value>,
    ctx: &ExecutionContext,
) -> HashMap<String, Value> {
    parameters
        .iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
        .collect()
}

/// Recursively resolve strings inside objects and arrays.
pub fn resolve_value(value: &Value, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => resolve_str(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a single template string.
pub fn resolve_str(template: &str, ctx: &ExecutionContext) -> Value {
    if let Some(token) = sole_token(template) {
        if let Lookup::Found(value) = lookup(token, ctx) {
            return value;
        }
    }
    Value::String(render(template, ctx))
}

/// Substitute every token, rendering values as text.
pub fn render(template: &str, ctx: &ExecutionContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        let close = open + 2 + close;
        out.push_str(&rest[..open]);

        let raw = &rest[open..close + 2];
        match lookup(rest[open + 2..close].trim(), ctx) {
            Lookup::Found(value) => out.push_str(&value_to_string(&value)),
            Lookup::Empty => {}
            Lookup::Unresolved => out.push_str(raw),
        }
        rest = &rest[close + 2..];
    }

    out.push_str(rest);
    out
}

/// The token of a string that is exactly `{{token}}`.
fn sole_token(template: &str) -> Option<&str> {
    let inner = template.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn lookup(token: &str, ctx: &ExecutionContext) -> Lookup {
    if token.is_empty() {
        return Lookup::Unresolved;
    }
    if let Some(value) = ctx.variables.get(token) {
        return Lookup::Found(value.clone());
    }

    let Some((head, path)) = token.split_once('.') else {
        return Lookup::Unresolved;
    };

    let root = match ctx.results.get(head) {
        Some(result) => &result.output,
        None => match ctx.variables.get(head) {
            Some(var) => var,
            None => return Lookup::Empty,
        },
    };

    match walk_path(root, path) {
        Some(Value::Null) | None => Lookup::Empty,
        Some(value) => Lookup::Found(value.clone()),
    }
}

/// Follow a dotted path through objects (by key) and arrays (by index).
pub(crate) fn walk_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Render a JSON value as template text.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects and arrays render as compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoflow_types::execution::StepResult;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(
            "wf",
            json!({"customer": {"name": "Ada", "tier": "gold"}, "order_id": 1042}),
        );
        ctx.results.insert(
            "classify".into(),
            StepResult::completed(json!({"label": "refund", "scores": [0.9, 0.1]})),
        );
        ctx
    }

    #[test]
    fn string_without_tokens_is_unchanged() {
        let ctx = ctx();
        for s in ["plain text", "", "{ not a token }", "{{ unclosed", "a }} b"] {
            assert_eq!(resolve_str(s, &ctx), json!(s));
        }
    }

    #[test]
    fn resolved_string_is_stable_on_second_pass() {
        let ctx = ctx();
        let once = render("Order {{order_id}} for {{customer.name}}", &ctx);
        assert_eq!(once, "Order 1042 for Ada");
        assert_eq!(render(&once, &ctx), once);
    }

    #[test]
    fn step_result_tokens() {
        let ctx = ctx();
        assert_eq!(render("label={{classify.label}}", &ctx), "label=refund");
        assert_eq!(render("top={{classify.scores.0}}", &ctx), "top=0.9");
        assert_eq!(render("[{{classify.missing}}]", &ctx), "[]");
        assert_eq!(render("[{{ghost_step.key}}]", &ctx), "[]");
    }

    #[test]
    fn unknown_bare_token_left_verbatim() {
        let ctx = ctx();
        assert_eq!(render("hi {{ nobody }}!", &ctx), "hi {{ nobody }}!");
    }

    #[test]
    fn sole_token_preserves_type() {
        let ctx = ctx();
        assert_eq!(resolve_str("{{order_id}}", &ctx), json!(1042));
        assert_eq!(
            resolve_str("{{customer}}", &ctx),
            json!({"name": "Ada", "tier": "gold"})
        );
        assert_eq!(resolve_str("{{ghost}}", &ctx), json!("{{ghost}}"));
    }

    #[test]
    fn resolves_nested_structures_into_fresh_map() {
        let ctx = ctx();
        let mut params = HashMap::new();
        params.insert(
            "message".to_string(),
            json!({"text": "Hi {{customer.name}}", "tags": ["{{classify.label}}", 7]}),
        );
        let original = params.clone();

        let resolved = resolve_parameters(&params, &ctx);
        assert_eq!(
            resolved["message"],
            json!({"text": "Hi Ada", "tags": ["refund", 7]})
        );
        assert_eq!(params, original);
    }
}
