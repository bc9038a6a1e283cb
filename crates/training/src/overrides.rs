//! `--override key=value` support: edits any dotted path of a serialized
//! [`TrainingConfig`] and deserializes it back.

use std::str::FromStr;

use serde_json::{Map, Number, Value};

use crate::{TrainingConfig, TrainingError};

#[derive(Debug, Clone, PartialEq)]
pub struct OverrideArg {
    pub path: String,
    pub value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

pub fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    if overrides.is_empty() {
        return Ok(config);
    }
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::ConfigFormat(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let segments = parse_path(&override_arg.path)?;
        assign_at_path(&mut value, &segments, parse_override_value(&override_arg.value))?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!("failed to deserialize config after overrides: {err}"))
    })
}

/// Scalars are typed by their spelling; anything else stays a string.
pub fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, TrainingError> {
    let segments = path
        .split('.')
        .map(|segment| match segment.split_once('[') {
            Some((key, rest)) => {
                let index = rest.trim_end_matches(']').parse::<usize>().map_err(|err| {
                    TrainingError::ConfigFormat(format!(
                        "invalid index in override path '{segment}': {err}"
                    ))
                })?;
                Ok(PathSegment {
                    key: key.to_string(),
                    index: Some(index),
                })
            }
            None => Ok(PathSegment {
                key: segment.to_string(),
                index: None,
            }),
        })
        .collect::<Result<Vec<_>, TrainingError>>()?;
    if segments.iter().any(|s| s.key.is_empty()) {
        return Err(TrainingError::ConfigFormat(format!(
            "override path '{path}' has an empty segment"
        )));
    }
    Ok(segments)
}

fn assign_at_path(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<(), TrainingError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return Err(TrainingError::ConfigFormat(format!(
            "override path segment '{}' points into a non-object value",
            segment.key
        )));
    };
    let entry = map.entry(segment.key.clone()).or_insert(Value::Null);

    match segment.index {
        None => assign_at_path(entry, rest, new_value),
        Some(index) => {
            if entry.is_null() {
                *entry = Value::Array(Vec::new());
            }
            let Value::Array(items) = entry else {
                return Err(TrainingError::ConfigFormat(format!(
                    "override path segment '{}' expects an array",
                    segment.key
                )));
            };
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            assign_at_path(&mut items[index], rest, new_value)
        }
    }
}
