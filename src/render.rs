//! Manifest variable substitution.
//!
//! Variables are written `${name}` in the manifest body and replaced
//! textually. A substituted value may itself reference another variable, so
//! substitution runs in passes until nothing changes, capped at
//! [`MAX_PASSES`] so cyclic definitions still terminate.

use std::collections::BTreeMap;

use serde_yaml::Value;
use tracing::trace;

use crate::error::{Error, Result};

/// Upper bound on substitution passes.
pub const MAX_PASSES: usize = 5;

const VAR_PREFIX: &str = "${";
const VAR_SUFFIX: &str = "}";

/// Substitute every known `${name}` in `body`.
///
/// Unknown references are left untouched.
pub fn render(body: &str, vars: &BTreeMap<String, String>) -> String {
    let mut output = body.to_string();

    for pass in 1..=MAX_PASSES {
        let mut replaced = false;
        for (name, value) in vars {
            let token = format!("{}{}{}", VAR_PREFIX, name, VAR_SUFFIX);
            if output.contains(&token) {
                let next = output.replace(&token, value);
                if next != output {
                    trace!(pass, variable = %name, "Substituted manifest variable");
                    replaced = true;
                    output = next;
                }
            }
        }
        if !replaced {
            break;
        }
    }

    output
}

/// Flatten a structured variables document into `name -> value` pairs.
///
/// Sequences become `name_0`, `name_1`, ...; nested maps become
/// `name_key`; `null` becomes an empty string.
pub fn flatten_variables(doc: &Value) -> Result<BTreeMap<String, String>> {
    let mapping = match doc {
        Value::Mapping(m) => m,
        Value::Null => return Ok(BTreeMap::new()),
        _ => return Err(Error::config("variables document must be a mapping")),
    };

    let mut out = BTreeMap::new();
    for (key, value) in mapping {
        let key = scalar_to_string(key)
            .ok_or_else(|| Error::config("variable names must be scalars"))?;
        flatten_into(&key, value, &mut out);
    }
    Ok(out)
}

fn flatten_into(key: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Sequence(items) => {
            for (i, item) in items.iter().enumerate() {
                out.insert(format!("{}_{}", key, i), nested_to_string(item));
            }
        }
        Value::Mapping(entries) => {
            for (k, v) in entries {
                let sub = scalar_to_string(k).unwrap_or_default();
                out.insert(format!("{}_{}", key, sub), nested_to_string(v));
            }
        }
        Value::Tagged(tagged) => flatten_into(key, &tagged.value, out),
        other => {
            out.insert(key.to_string(), nested_to_string(other));
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

// Only one level is flattened; deeper structures keep their YAML form.
fn nested_to_string(value: &Value) -> String {
    scalar_to_string(value).unwrap_or_else(|| {
        serde_yaml::to_string(value)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default()
    })
}
