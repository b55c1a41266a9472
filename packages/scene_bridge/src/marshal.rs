//! Values crossing the sandbox boundary.
//!
//! Only plain data crosses: unit, booleans, numbers, strings and arrays or
//! maps of those. Function pointers, handles to host objects and anything
//! else the engine can hold are refused and reported with the path of the
//! first offending field.

use rhai::Dynamic;
use serde_json::{Map, Number, Value};

use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marshalability {
    /// Scalar that crosses as-is.
    Plain,
    /// Array or map whose members all cross.
    Structured,
    /// Cannot cross at all.
    Opaque,
}

pub fn classify(value: &Dynamic) -> Marshalability {
    if value.is_unit()
        || value.is_bool()
        || value.is_int()
        || value.is_string()
        || value.is_char()
    {
        return Marshalability::Plain;
    }
    if value.is_float() {
        return match value.as_float() {
            Ok(f) if f.is_finite() => Marshalability::Plain,
            _ => Marshalability::Opaque,
        };
    }
    if value.is_array() || value.is_map() || value.is_blob() {
        return if first_opaque(value).is_none() {
            Marshalability::Structured
        } else {
            Marshalability::Opaque
        };
    }
    Marshalability::Opaque
}

pub fn is_marshalable(value: &Dynamic) -> bool {
    classify(value) != Marshalability::Opaque
}

/// Path of the first field that cannot cross, `$` being the value itself.
pub fn first_opaque(value: &Dynamic) -> Option<String> {
    convert(value, "$").err()
}

/// Convert a script value to JSON, refusing anything opaque.
pub fn to_json(owner: &str, path: &str, value: &Dynamic) -> BridgeResult<Value> {
    if !is_marshalable(value) {
        let at = convert(value, path).err().unwrap_or_else(|| path.to_string());
        return Err(refusal(owner, at));
    }
    convert(value, path).map_err(|at| refusal(owner, at))
}

fn refusal(owner: &str, path: String) -> BridgeError {
    log::warn!("[{owner}] refusing to marshal value at `{path}`");
    BridgeError::NotMarshalable {
        owner: owner.to_string(),
        path,
    }
}

/// Convert host data into a script value. JSON is always representable.
pub fn to_script(value: &Value) -> Dynamic {
    rhai::serde::to_dynamic(value).unwrap_or_else(|err| {
        log::warn!("Failed to convert host value for script: {err}");
        Dynamic::UNIT
    })
}

/// Walk `value`, returning the JSON form or the path of the first opaque
/// member.
fn convert(value: &Dynamic, path: &str) -> Result<Value, String> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(Value::Number(Number::from(i)));
    }
    if let Ok(f) = value.as_float() {
        return Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| path.to_string());
    }
    if let Ok(c) = value.as_char() {
        return Ok(Value::String(c.to_string()));
    }
    if value.is_string() {
        return value
            .clone()
            .into_string()
            .map(Value::String)
            .map_err(|_| path.to_string());
    }
    if let Some(array) = value.read_lock::<rhai::Array>() {
        return array
            .iter()
            .enumerate()
            .map(|(i, item)| convert(item, &format!("{path}[{i}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array);
    }
    if let Some(blob) = value.read_lock::<rhai::Blob>() {
        return Ok(Value::Array(
            blob.iter().map(|b| Value::Number(Number::from(*b))).collect(),
        ));
    }
    if let Some(map) = value.read_lock::<rhai::Map>() {
        let mut out = Map::new();
        for (key, item) in map.iter() {
            out.insert(key.to_string(), convert(item, &format!("{path}.{key}"))?);
        }
        return Ok(Value::Object(out));
    }
    Err(path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars_are_plain() {
        assert_eq!(classify(&Dynamic::UNIT), Marshalability::Plain);
        assert_eq!(classify(&Dynamic::from(3_i64)), Marshalability::Plain);
        assert_eq!(classify(&Dynamic::from(0.5_f64)), Marshalability::Plain);
        assert_eq!(classify(&Dynamic::from("x")), Marshalability::Plain);
        assert_eq!(classify(&Dynamic::from(f64::NAN)), Marshalability::Opaque);
    }

    #[test]
    fn test_function_pointer_is_refused_with_path() {
        let engine = rhai::Engine::new();
        let value: Dynamic = engine
            .eval(r#"#{ title: "t", nested: #{ items: [1, 2, |x| x + 1] } }"#)
            .unwrap();
        assert_eq!(classify(&value), Marshalability::Opaque);
        assert_eq!(first_opaque(&value).as_deref(), Some("$.nested.items[2]"));

        match to_json("w1", "message", &value) {
            Err(BridgeError::NotMarshalable { owner, path }) => {
                assert_eq!(owner, "w1");
                assert_eq!(path, "message.nested.items[2]");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_predicate_agrees_with_conversion() {
        let engine = rhai::Engine::new();
        let values: Vec<Dynamic> = vec![
            Dynamic::UNIT,
            Dynamic::from(f64::INFINITY),
            Dynamic::from_blob(vec![1, 2, 3]),
            engine.eval("|x| x").unwrap(),
            engine.eval(r#"[1, #{ ok: "yes" }]"#).unwrap(),
            engine.eval(r#"[1, #{ bad: || 1 }]"#).unwrap(),
        ];
        for value in &values {
            assert_eq!(
                is_marshalable(value),
                to_json("w1", "arg", value).is_ok(),
                "{value:?}"
            );
        }
        match to_json("w1", "arg", &values[3]) {
            Err(BridgeError::NotMarshalable { path, .. }) => assert_eq!(path, "arg"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_structured_converts() {
        let engine = rhai::Engine::new();
        let value: Dynamic = engine
            .eval(r#"#{ a: 1, b: [true, "s", 2.5], c: () }"#)
            .unwrap();
        assert_eq!(classify(&value), Marshalability::Structured);
        let json = to_json("p", "$", &value).unwrap();
        assert_eq!(json, json!({ "a": 1, "b": [true, "s", 2.5], "c": null }));
    }

    #[test]
    fn test_host_values_reach_script() {
        let value = to_script(&json!({ "lat": 10.5, "tags": ["a"] }));
        let map = value.read_lock::<rhai::Map>().unwrap();
        assert_eq!(map.get("lat").and_then(|v| v.as_float().ok()), Some(10.5));
        assert!(map.get("tags").is_some_and(|v| v.is_array()));
    }
}
