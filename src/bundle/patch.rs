// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! JSON patch operations applied to generated machine configuration.
//!
//! Supports the `add`, `replace` and `remove` operations of RFC 6902 with
//! RFC 6901 pointers. Patches are applied in order, and the first failing
//! operation aborts the whole list.

use crate::errors::BundleError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single patch operation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    /// Insert into an object or array. Existing object members are overwritten.
    Add { path: String, value: Value },
    /// Replace an existing value.
    Replace { path: String, value: Value },
    /// Remove an existing value.
    Remove { path: String },
}

impl PatchOperation {
    #[must_use]
    pub fn add(path: &str, value: Value) -> Self {
        Self::Add {
            path: path.to_string(),
            value,
        }
    }

    #[must_use]
    pub fn replace(path: &str, value: Value) -> Self {
        Self::Replace {
            path: path.to_string(),
            value,
        }
    }

    #[must_use]
    pub fn remove(path: &str) -> Self {
        Self::Remove {
            path: path.to_string(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Replace { .. } => "replace",
            Self::Remove { .. } => "remove",
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Replace { path, .. } | Self::Remove { path } => path,
        }
    }
}

/// Parses a patch document: a JSON (or YAML) list of operations.
///
/// # Errors
///
/// Returns [`BundleError::InvalidPatch`] if the document is not a list of
/// supported operations.
pub fn parse_patch(document: &str) -> Result<Vec<PatchOperation>, BundleError> {
    serde_yaml::from_str(document).map_err(|e| BundleError::InvalidPatch {
        reason: e.to_string(),
    })
}

/// Applies `operations` to `document` in order.
///
/// # Errors
///
/// Returns [`BundleError::PatchFailed`] for the first operation that cannot be
/// applied. The document may be partially patched at that point.
pub fn apply_patches(
    document: &mut Value,
    operations: &[PatchOperation],
) -> Result<(), BundleError> {
    for (index, operation) in operations.iter().enumerate() {
        apply_one(document, operation).map_err(|reason| BundleError::PatchFailed {
            index,
            op: operation.name().to_string(),
            path: operation.path().to_string(),
            reason,
        })?;
    }
    Ok(())
}

fn apply_one(document: &mut Value, operation: &PatchOperation) -> Result<(), String> {
    let tokens = parse_pointer(operation.path())?;
    let Some((last, parent_tokens)) = tokens.split_last() else {
        // The root pointer replaces the whole document.
        return match operation {
            PatchOperation::Add { value, .. } | PatchOperation::Replace { value, .. } => {
                *document = value.clone();
                Ok(())
            }
            PatchOperation::Remove { .. } => Err("cannot remove the document root".to_string()),
        };
    };

    let parent = resolve_mut(document, parent_tokens)?;
    match (operation, parent) {
        (PatchOperation::Add { value, .. }, Value::Object(map)) => {
            map.insert(last.clone(), value.clone());
            Ok(())
        }
        (PatchOperation::Add { value, .. }, Value::Array(items)) => {
            if last == "-" {
                items.push(value.clone());
                return Ok(());
            }
            let index = array_index(last, items.len() + 1)?;
            items.insert(index, value.clone());
            Ok(())
        }
        (PatchOperation::Replace { value, .. }, Value::Object(map)) => match map.get_mut(last) {
            Some(slot) => {
                *slot = value.clone();
                Ok(())
            }
            None => Err(format!("member '{last}' does not exist")),
        },
        (PatchOperation::Replace { value, .. }, Value::Array(items)) => {
            let index = array_index(last, items.len())?;
            items[index] = value.clone();
            Ok(())
        }
        (PatchOperation::Remove { .. }, Value::Object(map)) => map
            .remove(last)
            .map(|_| ())
            .ok_or_else(|| format!("member '{last}' does not exist")),
        (PatchOperation::Remove { .. }, Value::Array(items)) => {
            let index = array_index(last, items.len())?;
            items.remove(index);
            Ok(())
        }
        (_, other) => Err(format!("parent is a {} and has no children", type_name(other))),
    }
}

/// Splits an RFC 6901 pointer into unescaped reference tokens.
fn parse_pointer(pointer: &str) -> Result<Vec<String>, String> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(format!("pointer '{pointer}' must start with '/'"));
    };
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn resolve_mut<'a>(mut current: &'a mut Value, tokens: &[String]) -> Result<&'a mut Value, String> {
    for token in tokens {
        current = match current {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| format!("member '{token}' does not exist"))?,
            Value::Array(items) => {
                let index = array_index(token, items.len())?;
                &mut items[index]
            }
            other => {
                return Err(format!(
                    "cannot descend into {} at '{token}'",
                    type_name(other)
                ))
            }
        };
    }
    Ok(current)
}

/// Parses an array index token, requiring `index < bound`.
fn array_index(token: &str, bound: usize) -> Result<usize, String> {
    if token.len() > 1 && token.starts_with('0') {
        return Err(format!("array index '{token}' has a leading zero"));
    }
    let index = token
        .parse::<usize>()
        .map_err(|_| format!("'{token}' is not an array index"))?;
    if index >= bound {
        return Err(format!("array index {index} is out of bounds"));
    }
    Ok(index)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[path = "patch_tests.rs"]
mod patch_tests;
