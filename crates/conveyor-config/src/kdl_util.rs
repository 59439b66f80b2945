// Helper functions for extracting values from KDL nodes

use crate::{ConfigError, ConfigResult};
use conveyor_core::pipeline::Params;
use kdl::{KdlNode, KdlValue};
use std::time::Duration;

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

pub(crate) fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match node.get(name) {
        None => Ok(None),
        Some(v) => v
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: name.to_string(),
                message: "expected a non-negative integer".to_string(),
            }),
    }
}

/// First positional argument as an unsigned integer.
pub(crate) fn get_u64_arg(node: &KdlNode) -> ConfigResult<u64> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: node.name().value().to_string(),
            message: "expected a non-negative integer".to_string(),
        })
}

/// A flag child: `privileged` alone means true, `privileged #false` false.
pub(crate) fn get_flag_arg(node: &KdlNode) -> bool {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
        .unwrap_or(true)
}

/// Collect a string list given either as repeated properties or as the
/// arguments of a same-named child node.
pub(crate) fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                result.extend(get_all_string_args(child));
            }
        }
    }

    result
}

pub(crate) fn value_to_json(value: &KdlValue) -> serde_json::Value {
    if let Some(s) = value.as_string() {
        serde_json::Value::String(s.to_string())
    } else if let Some(b) = value.as_bool() {
        serde_json::Value::Bool(b)
    } else if let Some(i) = value.as_integer() {
        i64::try_from(i)
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::String(i.to_string()))
    } else if let Some(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    } else {
        serde_json::Value::Null
    }
}

/// Turn a block like `source { uri "..."; depth 1 }` into a params map.
///
/// Children with their own block become objects, several arguments become
/// an array and a bare node name becomes `true`.
pub(crate) fn node_to_params(node: &KdlNode) -> Params {
    let mut params = Params::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            params.insert(child.name().value().to_string(), node_value(child));
        }
    }
    params
}

fn node_value(node: &KdlNode) -> serde_json::Value {
    if node.children().is_some() {
        return serde_json::Value::Object(node_to_params(node).into_iter().collect());
    }
    let args: Vec<serde_json::Value> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| value_to_json(e.value()))
        .collect();
    match args.len() {
        0 => serde_json::Value::Bool(true),
        1 => args.into_iter().next().unwrap_or(serde_json::Value::Null),
        _ => serde_json::Value::Array(args),
    }
}

/// Parse `250ms`, `10s`, `5m`, `1h`; a bare number means seconds.
pub(crate) fn parse_duration(field: &str, raw: &str) -> ConfigResult<Duration> {
    let raw = raw.trim();
    let invalid = || ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("invalid duration '{raw}'"),
    };

    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let amount: u64 = digits.parse().map_err(|_| invalid())?;

    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "" | "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        _ => Err(invalid()),
    }
}
