use serde_json::Value;

use tether_core::{Result, TetherError};

/// Validate tool arguments against the tool's JSON Schema, after coercing
/// trivially-safe mismatches (whole floats to ints, numeric strings to
/// numbers) the schema expects.
pub fn validate_args(
    tool: &str,
    schema: &Value,
    args: &mut serde_json::Map<String, Value>,
) -> Result<()> {
    coerce(schema, args);
    let validator = jsonschema::Validator::new(schema)
        .map_err(|e| TetherError::Config(format!("tool {tool} has an invalid schema: {e}")))?;
    let value = Value::Object(args.clone());
    if validator.is_valid(&value) {
        return Ok(());
    }
    let reasons: Vec<String> = validator
        .iter_errors(&value)
        .map(|e| e.to_string())
        .collect();
    Err(TetherError::InvalidArguments {
        tool: tool.to_string(),
        reason: reasons.join("; "),
    })
}

// Best-effort type coercion driven by the schema's declared property types.
fn coerce(schema: &Value, args: &mut serde_json::Map<String, Value>) {
    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return;
    };
    for (key, prop) in properties {
        let Some(expected) = prop.get("type").and_then(|t| t.as_str()) else {
            continue;
        };
        let Some(current) = args.get(key) else {
            continue;
        };
        let coerced = coerce_value(current, expected);
        if let Some(new) = coerced {
            args.insert(key.clone(), new);
        }
    }
}

fn coerce_value(value: &Value, expected: &str) -> Option<Value> {
    match (expected, value) {
        // Whole floats become integers.
        ("integer", Value::Number(n)) if n.is_f64() => {
            let f = n.as_f64()?;
            if f.fract() == 0.0 && f.is_finite() {
                Some(Value::Number(serde_json::Number::from(f as i64)))
            } else {
                None
            }
        }
        // String-of-int / string-of-number.
        ("integer", Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        ("number", Value::String(s)) => {
            s.trim().parse::<f64>().ok().and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
        }
        ("boolean", Value::String(s)) => match s.trim() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        // Integers widen to numbers implicitly in JSON Schema; nothing to do.
        _ => None,
    }
}
