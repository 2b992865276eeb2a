//! Conversion between script values and JSON.
//!
//! Two encodings are provided:
//!
//! - **tagged** ([`encode`] / [`decode`]): every value is wrapped as
//!   `{"type": ..., "data": ...}` so that `3` and `3.0` are still distinct
//!   after a round trip through storage. Used for KV persistence.
//! - **plain** ([`to_plain_json`] / [`from_plain_json`]): ordinary JSON, for
//!   data exchanged with the outside (saved messages, embeds).
//!
//! Both directions are depth-bounded and fail closed on types they do not
//! know how to represent.

use rhai::{Array, Dynamic, Map};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

/// Maximum nesting of lists/dicts accepted in either direction.
pub const MAX_DEPTH: usize = 32;

const TAG_NONE: &str = "NoneType";
const TAG_STRING: &str = "string";
const TAG_BOOL: &str = "bool";
const TAG_INT: &str = "int";
const TAG_FLOAT: &str = "float";
const TAG_LIST: &str = "list";
const TAG_DICT: &str = "dict";

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("unsupported value type: {0}")]
    UnsupportedType(String),

    #[error("malformed stored value: {0}")]
    Malformed(String),

    #[error("value nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// On-disk form of a tagged value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerializedValue {
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub data: Value,
}

// ── Tagged encoding ──────────────────────────────────────

/// Encodes a script value into its tagged JSON form.
pub fn encode(value: &Dynamic) -> Result<Value, ValueError> {
    let serialized = encode_at(value, 0)?;
    Ok(serde_json::to_value(serialized)?)
}

fn encode_at(value: &Dynamic, depth: usize) -> Result<SerializedValue, ValueError> {
    if depth > MAX_DEPTH {
        return Err(ValueError::TooDeep);
    }

    let (tag, data) = if value.is_unit() {
        (TAG_NONE, Value::Null)
    } else if let Ok(b) = value.as_bool() {
        (TAG_BOOL, Value::Bool(b))
    } else if let Ok(i) = value.as_int() {
        (TAG_INT, Value::from(i))
    } else if let Ok(f) = value.as_float() {
        (TAG_FLOAT, Value::Number(finite_number(f)?))
    } else if value.is_string() {
        let s = value
            .clone()
            .into_string()
            .map_err(|t| ValueError::UnsupportedType(t.to_string()))?;
        (TAG_STRING, Value::String(s))
    } else if value.is_array() {
        let items = value
            .clone()
            .try_cast::<Array>()
            .ok_or_else(|| ValueError::UnsupportedType(value.type_name().to_string()))?;
        let mut data = Vec::with_capacity(items.len());
        for item in &items {
            data.push(serde_json::to_value(encode_at(item, depth + 1)?)?);
        }
        (TAG_LIST, Value::Array(data))
    } else if value.is_map() {
        let map = value
            .clone()
            .try_cast::<Map>()
            .ok_or_else(|| ValueError::UnsupportedType(value.type_name().to_string()))?;
        let mut data = serde_json::Map::with_capacity(map.len());
        for (key, item) in &map {
            data.insert(
                key.to_string(),
                serde_json::to_value(encode_at(item, depth + 1)?)?,
            );
        }
        (TAG_DICT, Value::Object(data))
    } else {
        return Err(ValueError::UnsupportedType(value.type_name().to_string()));
    };

    Ok(SerializedValue {
        type_tag: tag.to_string(),
        data,
    })
}

/// Decodes a tagged JSON value back into a script value.
pub fn decode(value: &Value) -> Result<Dynamic, ValueError> {
    decode_at(value, 0)
}

fn decode_at(value: &Value, depth: usize) -> Result<Dynamic, ValueError> {
    if depth > MAX_DEPTH {
        return Err(ValueError::TooDeep);
    }

    let serialized = SerializedValue::deserialize(value)?;
    let data = &serialized.data;
    let malformed = || {
        ValueError::Malformed(format!(
            "data {data} does not match type tag '{}'",
            serialized.type_tag
        ))
    };

    match serialized.type_tag.as_str() {
        TAG_NONE => Ok(Dynamic::UNIT),
        TAG_STRING => data
            .as_str()
            .map(|s| Dynamic::from(s.to_string()))
            .ok_or_else(malformed),
        TAG_BOOL => data.as_bool().map(Dynamic::from).ok_or_else(malformed),
        TAG_INT => data
            .as_i64()
            // Older entries may carry integral floats
            .or_else(|| data.as_f64().filter(|f| is_integral(*f)).map(|f| f as i64))
            .map(Dynamic::from)
            .ok_or_else(malformed),
        TAG_FLOAT => data.as_f64().map(Dynamic::from).ok_or_else(malformed),
        TAG_LIST => {
            let items = data.as_array().ok_or_else(malformed)?;
            let mut array = Array::with_capacity(items.len());
            for item in items {
                array.push(decode_at(item, depth + 1)?);
            }
            Ok(Dynamic::from_array(array))
        }
        TAG_DICT => {
            let entries = data.as_object().ok_or_else(malformed)?;
            let mut map = Map::new();
            for (key, item) in entries {
                map.insert(key.as_str().into(), decode_at(item, depth + 1)?);
            }
            Ok(Dynamic::from_map(map))
        }
        other => Err(ValueError::Malformed(format!("unknown type tag '{other}'"))),
    }
}

/// Encodes a value to the JSON text stored in the KV backend.
pub fn to_json_string(value: &Dynamic) -> Result<String, ValueError> {
    Ok(serde_json::to_string(&encode_at(value, 0)?)?)
}

/// Whether `f` is a whole number that fits in an `i64` without clamping.
fn is_integral(f: f64) -> bool {
    // i64::MAX as f64 rounds up to 2^63, which is out of range
    f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64
}

/// Decodes JSON text read from the KV backend.
pub fn from_json_str(raw: &str) -> Result<Dynamic, ValueError> {
    let value: Value = serde_json::from_str(raw)?;
    decode(&value)
}

// ── Plain encoding ───────────────────────────────────────

/// Converts external JSON into a script value.
///
/// Numbers without a fractional part become ints, everything else floats.
pub fn from_plain_json(value: &Value) -> Result<Dynamic, ValueError> {
    from_plain_at(value, 0)
}

fn from_plain_at(value: &Value, depth: usize) -> Result<Dynamic, ValueError> {
    if depth > MAX_DEPTH {
        return Err(ValueError::TooDeep);
    }

    Ok(match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                if is_integral(f) {
                    Dynamic::from(f as i64)
                } else {
                    Dynamic::from(f)
                }
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            let mut array = Array::with_capacity(items.len());
            for item in items {
                array.push(from_plain_at(item, depth + 1)?);
            }
            Dynamic::from_array(array)
        }
        Value::Object(entries) => {
            let mut map = Map::new();
            for (key, item) in entries {
                map.insert(key.as_str().into(), from_plain_at(item, depth + 1)?);
            }
            Dynamic::from_map(map)
        }
    })
}

/// Converts a script value into plain JSON.
pub fn to_plain_json(value: &Dynamic) -> Result<Value, ValueError> {
    to_plain_at(value, 0)
}

fn to_plain_at(value: &Dynamic, depth: usize) -> Result<Value, ValueError> {
    if depth > MAX_DEPTH {
        return Err(ValueError::TooDeep);
    }

    if value.is_unit() {
        Ok(Value::Null)
    } else if let Ok(b) = value.as_bool() {
        Ok(Value::Bool(b))
    } else if let Ok(i) = value.as_int() {
        Ok(Value::from(i))
    } else if let Ok(f) = value.as_float() {
        Ok(Value::Number(finite_number(f)?))
    } else if value.is_string() {
        value
            .clone()
            .into_string()
            .map(Value::String)
            .map_err(|t| ValueError::UnsupportedType(t.to_string()))
    } else if let Some(items) = value.clone().try_cast::<Array>() {
        items
            .iter()
            .map(|item| to_plain_at(item, depth + 1))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)
    } else if let Some(map) = value.clone().try_cast::<Map>() {
        let mut object = serde_json::Map::with_capacity(map.len());
        for (key, item) in &map {
            object.insert(key.to_string(), to_plain_at(item, depth + 1)?);
        }
        Ok(Value::Object(object))
    } else {
        Err(ValueError::UnsupportedType(value.type_name().to_string()))
    }
}

fn finite_number(f: f64) -> Result<Number, ValueError> {
    Number::from_f64(f).ok_or_else(|| ValueError::UnsupportedType(format!("non-finite float {f}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_map() -> Dynamic {
        let mut inner = Map::new();
        inner.insert("count".into(), Dynamic::from(2_i64));
        inner.insert("ratio".into(), Dynamic::from(0.5_f64));

        let mut map = Map::new();
        map.insert("name".into(), Dynamic::from("clicker".to_string()));
        map.insert("enabled".into(), Dynamic::from(true));
        map.insert("nothing".into(), Dynamic::UNIT);
        map.insert("stats".into(), Dynamic::from_map(inner));
        map.insert(
            "tags".into(),
            Dynamic::from_array(vec![Dynamic::from(1_i64), Dynamic::from(1.0_f64)]),
        );
        Dynamic::from_map(map)
    }

    #[test]
    fn test_roundtrip_preserves_structure() {
        let values = vec![
            Dynamic::UNIT,
            Dynamic::from(true),
            Dynamic::from(-17_i64),
            Dynamic::from(2.25_f64),
            Dynamic::from("héllo".to_string()),
            Dynamic::from_array(vec![]),
            sample_map(),
        ];

        for value in values {
            let encoded = encode(&value).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(encode(&decoded).unwrap(), encoded);
            assert_eq!(decoded.type_name(), value.type_name());
        }
    }

    #[test]
    fn test_int_and_float_are_distinguishable() {
        let int = encode(&Dynamic::from(3_i64)).unwrap();
        let float = encode(&Dynamic::from(3.0_f64)).unwrap();

        assert_eq!(int, json!({"type": "int", "data": 3}));
        assert_eq!(float, json!({"type": "float", "data": 3.0}));
        assert_ne!(int, float);

        assert_eq!(decode(&int).unwrap().as_int().unwrap(), 3);
        assert!(decode(&int).unwrap().as_float().is_err());
        assert_eq!(decode(&float).unwrap().as_float().unwrap(), 3.0);
        assert!(decode(&float).unwrap().as_int().is_err());
    }

    #[test]
    fn test_string_helpers_roundtrip() {
        let raw = to_json_string(&Dynamic::from(42_i64)).unwrap();
        assert_eq!(raw, r#"{"type":"int","data":42}"#);
        assert_eq!(from_json_str(&raw).unwrap().as_int().unwrap(), 42);
    }

    #[test]
    fn test_legacy_integral_float_decodes_as_int() {
        let legacy = json!({"type": "int", "data": 5.0});
        assert_eq!(decode(&legacy).unwrap().as_int().unwrap(), 5);
    }

    #[test]
    fn test_legacy_int_out_of_range_is_malformed() {
        for data in [json!(1e30), json!(-1e30), json!(9223372036854775808.0)] {
            let legacy = json!({"type": "int", "data": data});
            assert!(matches!(decode(&legacy), Err(ValueError::Malformed(_))), "{legacy}");
        }
        assert!(matches!(
            decode(&json!({"type": "int", "data": 2.5})),
            Err(ValueError::Malformed(_))
        ));
    }

    #[test]
    fn test_unsupported_type_fails_closed() {
        let err = encode(&Dynamic::from('x')).unwrap_err();
        assert!(matches!(err, ValueError::UnsupportedType(ref t) if t == "char"));

        let nested = Dynamic::from_array(vec![Dynamic::from('x')]);
        assert!(matches!(
            encode(&nested),
            Err(ValueError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_non_finite_float_rejected() {
        assert!(matches!(
            encode(&Dynamic::from(f64::NAN)),
            Err(ValueError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_unknown_tag_is_malformed() {
        let err = decode(&json!({"type": "set", "data": []})).unwrap_err();
        assert!(matches!(err, ValueError::Malformed(_)));

        let err = decode(&json!({"type": "int", "data": "three"})).unwrap_err();
        assert!(matches!(err, ValueError::Malformed(_)));
    }

    #[test]
    fn test_nesting_is_bounded() {
        let mut value = Dynamic::from(1_i64);
        for _ in 0..=MAX_DEPTH + 1 {
            value = Dynamic::from_array(vec![value]);
        }
        assert!(matches!(encode(&value), Err(ValueError::TooDeep)));
        assert!(matches!(to_plain_json(&value), Err(ValueError::TooDeep)));

        let mut json = json!(1);
        for _ in 0..=MAX_DEPTH + 1 {
            json = json!([json]);
        }
        assert!(matches!(from_plain_json(&json), Err(ValueError::TooDeep)));
    }

    #[test]
    fn test_plain_json_numbers() {
        let value = from_plain_json(&json!({"a": 3, "b": 3.0, "c": 3.5})).unwrap();
        let map = value.try_cast::<Map>().unwrap();
        assert_eq!(map["a"].as_int().unwrap(), 3);
        assert_eq!(map["b"].as_int().unwrap(), 3);
        assert_eq!(map["c"].as_float().unwrap(), 3.5);
    }

    #[test]
    fn test_plain_json_roundtrip() {
        let json = json!({
            "title": "Welcome",
            "fields": [{"name": "rules", "inline": false}],
            "color": 5793266
        });
        let value = from_plain_json(&json).unwrap();
        assert_eq!(to_plain_json(&value).unwrap(), json);
    }
}
