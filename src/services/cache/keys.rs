use md5::{Digest, Md5};
use serde_json::{Map, Value};

/// Deterministic JSON: object keys sorted, null members dropped at every depth.
pub fn canonical_json(value: &Value) -> String {
    strip_nulls(value).to_string()
}

fn strip_nulls(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut entries: Vec<(&String, &Value)> =
                obj.iter().filter(|(_, v)| !v.is_null()).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), strip_nulls(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_nulls).collect()),
        other => other.clone(),
    }
}

pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Key for a divination pre-computation:
/// `divination:paipan:<kind>:<first 16 hex of md5(canonical inputs)>`.
pub fn divination_key(kind: &str, inputs: &Value) -> String {
    let digest = md5_hex(&canonical_json(inputs));
    format!("divination:paipan:{}:{}", kind, &digest[..16])
}

/// Key for a pre-rendered prompt template.
pub fn template_key(template_id: &str, vars: &Value) -> String {
    md5_hex(&format!("{}:{}", template_id, canonical_json(vars)))
}
