//! Canonical JSON rendering used as the input of signatures
//!
//! Compact output, object keys in lexicographic order, the top-level
//! `signatures` member removed. Timestamps are already rendered as strings by
//! the time they reach a `Value`, see `signature::canonical_time`.

use serde_json::Value;

/// Name of the payload member that carries detached signatures
pub const SIGNATURES_FIELD: &str = "signatures";

/// Canonical bytes of a JSON payload
pub fn canonical_json(payload: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = String::new();
    match payload {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().filter(|k| *k != SIGNATURES_FIELD).collect();
            keys.sort();
            write_object(&mut out, keys.into_iter().map(|k| (k, &map[k])))?;
        }
        other => write_value(&mut out, other)?,
    }
    Ok(out.into_bytes())
}

fn write_value(out: &mut String, value: &Value) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            write_object(out, keys.into_iter().map(|k| (k, &map[k])))
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
            Ok(())
        }
        scalar => {
            out.push_str(&serde_json::to_string(scalar)?);
            Ok(())
        }
    }
}

fn write_object<'a>(
    out: &mut String,
    members: impl Iterator<Item = (&'a String, &'a Value)>,
) -> Result<(), serde_json::Error> {
    out.push('{');
    for (i, (key, value)) in members.enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::to_string(key)?);
        out.push(':');
        write_value(out, value)?;
    }
    out.push('}');
    Ok(())
}
