//! Request fingerprints.
//!
//! `sha256(name || "\n" || canonical_json(parameters))`, hex encoded. Object
//! keys are sorted and integral numbers below 2^53 print without a fraction,
//! so `{"a": 1.0, "b": 2}` and `{"b": 2.0, "a": 1}` hash identically.

use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;

use super::params::ComputationParams;
use crate::error::ComputeError;
use crate::error::Result;

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Deterministic serialization of a JSON value.
pub fn canonical_json(value: &Value) -> String {
  let mut out = String::new();
  write_canonical(value, &mut out);
  out
}

fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Null => out.push_str("null"),
    Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
    Value::Number(n) => {
      if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
      } else if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
      } else if let Some(f) = n.as_f64() {
        if f.fract() == 0.0 && f.abs() < MAX_SAFE_INTEGER {
          out.push_str(&(f as i64).to_string());
        } else {
          out.push_str(&f.to_string());
        }
      }
    }
    Value::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      out.push('{');
      for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key], out);
      }
      out.push('}');
    }
  }
}

/// Fingerprint of a typed, defaults-filled request.
pub fn fingerprint(params: &ComputationParams) -> Result<String> {
  let envelope = serde_json::to_value(params)
    .map_err(|err| ComputeError::Internal(format!("cannot serialize parameters: {err}")))?;
  let parameters = envelope.get("parameters").unwrap_or(&Value::Null);

  let mut hasher = Sha256::new();
  hasher.update(params.kind().as_str().as_bytes());
  hasher.update(b"\n");
  hasher.update(canonical_json(parameters).as_bytes());
  Ok(format!("{:x}", hasher.finalize()))
}
