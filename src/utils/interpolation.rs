use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Interpolate a template string by replacing tokens with values from `scope` and `globals`.
///
/// Supported token formats:
/// - `{{path.to.value}}` -> looked up in the pipeline scope (read context, `event`,
///   `options`, `services`, variables set by `set_var`)
/// - `{{@global_key}}` -> looked up in `globals`
///
/// Notes:
/// - Whitespace around the token content is ignored: `{{  var  }}` == `{{var}}`.
/// - Unknown tokens are left intact to aid debugging.
/// - Paths walk objects by key and arrays by index: `{{items.0.name}}`.
/// - Non-string values are rendered as JSON (e.g., numbers as `42`, objects as `{"k":"v"}`).
pub fn interpolate_string(
    template: &str,
    scope: &Map<String, Value>,
    globals: &BTreeMap<String, Value>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(len) = after_open.find("}}") else {
            // No matching end, keep the remainder verbatim
            out.push_str(&rest[start..]);
            return out;
        };

        let whole = &rest[start..start + 2 + len + 2];
        let token = after_open[..len].trim();
        let replaced = if token.is_empty() {
            None
        } else if let Some(global) = token.strip_prefix('@') {
            resolve(|key| globals.get(key), global.trim())
        } else {
            resolve(|key| scope.get(key), token)
        };
        match replaced {
            Some(value) => out.push_str(&render(value)),
            None => out.push_str(whole),
        }
        rest = &rest[start + 2 + len + 2..];
    }

    out.push_str(rest);
    out
}

/// Interpolates all string values in a JSON structure (recursively).
///
/// - Strings are processed with `interpolate_string`.
/// - Arrays and objects are traversed recursively.
/// - Other types are returned unchanged.
pub fn interpolate_json(
    value: &Value,
    scope: &Map<String, Value>,
    globals: &BTreeMap<String, Value>,
) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate_string(s, scope, globals)),
        Value::Array(arr) => Value::Array(
            arr.iter()
                .map(|v| interpolate_json(v, scope, globals))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_json(v, scope, globals)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

/// Resolve a dotted path whose first segment is looked up with `top`.
fn resolve<'a>(top: impl Fn(&str) -> Option<&'a Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.').map(str::trim);
    let first = top(segments.next()?)?;
    segments.try_fold(first, |current, seg| step(current, seg))
}

fn step<'a>(current: &'a Value, seg: &str) -> Option<&'a Value> {
    match current {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Strings as-is, everything else as compact JSON.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
