//! Strategic merge of a patch document onto a machine config.
//!
//! Mappings are merged key by key and sequences are appended to, except for network interfaces
//! which are merged with the existing interface of the same name or device selector. A mapping
//! of the form `{"$patch": "delete"}` removes whatever it is merged onto. In any other sequence,
//! an item carrying the directive removes the items equal to it without the directive.

use serde_json::{Map, Value};
use snafu::{Snafu, ensure};

const DIRECTIVE_KEY: &str = "$patch";
const DELETE_DIRECTIVE: &str = "delete";

/// Path of the sequence whose items are matched up instead of appended.
const INTERFACES_PATH: &[&str] = &["machine", "network", "interfaces"];

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Eq, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("strategic merge patch must be a mapping, got {kind}"))]
    NotAMapping { kind: &'static str },

    #[snafu(display("unsupported patch directive {directive} at {path:?}"))]
    UnsupportedDirective { directive: Value, path: String },
}

/// Merges `patch` onto `base`.
pub fn strategic_merge(base: &mut Value, patch: &Value) -> Result<()> {
    ensure!(patch.is_object(), NotAMappingSnafu {
        kind: kind_of(patch),
    });
    let mut path = Vec::new();
    merge_value(base, patch, &mut path)
}

fn merge_value<'p>(base: &mut Value, patch: &'p Value, path: &mut Vec<&'p str>) -> Result<()> {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                path.push(key);
                if is_delete(patch_value, path)? {
                    base_map.remove(key);
                } else if let Some(base_value) = base_map.get_mut(key) {
                    merge_value(base_value, patch_value, path)?;
                } else {
                    base_map.insert(key.clone(), without_directives(patch_value, path)?);
                }
                path.pop();
            }
        }
        (Value::Array(base_items), Value::Array(patch_items)) if path == INTERFACES_PATH => {
            merge_interfaces(base_items, patch_items, path)?;
        }
        (Value::Array(base_items), Value::Array(patch_items)) => {
            for item in patch_items {
                if is_delete(item, path)? {
                    let target = delete_target(item, path)?;
                    base_items.retain(|base_item| *base_item != target);
                } else {
                    base_items.push(without_directives(item, path)?);
                }
            }
        }
        (base, patch) => *base = without_directives(patch, path)?,
    }
    Ok(())
}

fn merge_interfaces<'p>(
    base_items: &mut Vec<Value>,
    patch_items: &'p [Value],
    path: &mut Vec<&'p str>,
) -> Result<()> {
    for patch_item in patch_items {
        let existing = base_items
            .iter()
            .position(|base_item| same_interface(base_item, patch_item));
        match (existing, is_delete(patch_item, path)?) {
            (Some(index), true) => {
                base_items.remove(index);
            }
            (Some(index), false) => merge_value(&mut base_items[index], patch_item, path)?,
            (None, true) => {}
            (None, false) => base_items.push(without_directives(patch_item, path)?),
        }
    }
    Ok(())
}

/// Two interfaces are the same if they share the interface name or the device selector.
fn same_interface(left: &Value, right: &Value) -> bool {
    ["interface", "deviceSelector"].iter().any(|key| {
        matches!(
            (left.get(key), right.get(key)),
            (Some(left), Some(right)) if left == right
        )
    })
}

fn is_delete(value: &Value, path: &[&str]) -> Result<bool> {
    let Some(directive) = value.get(DIRECTIVE_KEY) else {
        return Ok(false);
    };
    ensure!(directive == DELETE_DIRECTIVE, UnsupportedDirectiveSnafu {
        directive: directive.clone(),
        path: path.join("."),
    });
    Ok(true)
}

/// Returns a copy of `value` with all delete directives applied to nothing, i.e. dropped.
fn without_directives<'p>(value: &'p Value, path: &mut Vec<&'p str>) -> Result<Value> {
    match value {
        Value::Object(_) => {
            let mut merged = Value::Object(Map::new());
            merge_value(&mut merged, value, path)?;
            Ok(merged)
        }
        Value::Array(items) => {
            let mut merged = Vec::with_capacity(items.len());
            for item in items {
                if !is_delete(item, path)? {
                    merged.push(without_directives(item, path)?);
                }
            }
            Ok(Value::Array(merged))
        }
        other => Ok(other.clone()),
    }
}

/// The value a delete directive inside a sequence item refers to.
fn delete_target<'p>(item: &'p Value, path: &mut Vec<&'p str>) -> Result<Value> {
    let mut target = without_directives(item, path)?;
    if let Value::Object(fields) = &mut target {
        fields.remove(DIRECTIVE_KEY);
    }
    Ok(target)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}
