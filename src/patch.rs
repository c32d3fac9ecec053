//! # JSON Patch Engine
//!
//! Applies the closed set of patch operations — `ArrayAdd`, `ArrayRemove`,
//! `ObjectAdd` — to document content. Each operation carries a JSON Pointer
//! (RFC 6901 syntax: `/a/b`, with `~1` unescaping to `/` and `~0` to `~`)
//! and a value.
//!
//! ## Semantics
//!
//! - `ArrayAdd` appends the value to the target array unless a structurally
//!   equal element is already present (set-like).
//! - `ArrayRemove` removes **all** structurally equal elements.
//! - `ObjectAdd` inserts the property iff the key is absent; an existing
//!   property is left untouched without error.
//!
//! Navigation descends through objects only; meeting an array, primitive, or
//! null before the terminal segment is an error, as is a missing key. The
//! terminal target must match the operation (array for the `Array*` ops, the
//! parent object for `ObjectAdd`). A pointer referring to the whole document
//! is rejected by all three operations.
//!
//! ## Purity
//!
//! Application is pure: every operation builds a new [`JsonValue`] tree and
//! the input is never modified. The resource engine applies a patch sequence
//! to a copy and commits the final tree only after schema validation, so a
//! failed PATCH leaves the stored document untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::json::{JsonValue, Visitor};

// =============================================================================
// Wire Types
// =============================================================================

/// The closed set of patch operation kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Append to an array if no structurally equal element exists.
    ArrayAdd,
    /// Remove all structurally equal elements from an array.
    ArrayRemove,
    /// Insert an object property if the key is absent.
    ObjectAdd,
}

/// One patch operation as received in a PATCH request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatchOp {
    /// The operation kind.
    pub op: OpKind,
    /// JSON Pointer to the target.
    pub path: String,
    /// The value to add or remove.
    pub value: JsonValue,
}

// =============================================================================
// Application
// =============================================================================

/// Applies a sequence of operations left to right, threading the result of
/// each through to the next. Any failure aborts the whole sequence.
pub fn apply_all(doc: &JsonValue, ops: &[PatchOp]) -> Result<JsonValue> {
    let mut current = doc.clone();
    for op in ops {
        current = apply(&current, op)?;
    }
    Ok(current)
}

/// Applies a single patch operation, returning the new document tree.
pub fn apply(doc: &JsonValue, op: &PatchOp) -> Result<JsonValue> {
    let segments = parse_pointer(&op.path)?;
    match op.op {
        OpKind::ArrayAdd => apply_array_add(doc, &segments, &op.value),
        OpKind::ArrayRemove => apply_array_remove(doc, &segments, &op.value),
        OpKind::ObjectAdd => apply_object_add(doc, &segments, &op.value),
    }
}

/// Splits a JSON Pointer into unescaped segments.
///
/// The empty pointer yields no segments (the whole document). A non-empty
/// pointer must start with `/`.
fn parse_pointer(pointer: &str) -> Result<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    if !pointer.starts_with('/') {
        return Err(Error::Patch(format!("invalid JSON pointer: {pointer}")));
    }
    Ok(pointer[1..]
        .split('/')
        .map(|segment| segment.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn apply_array_add(doc: &JsonValue, segments: &[String], value: &JsonValue) -> Result<JsonValue> {
    if segments.is_empty() {
        return Err(Error::Patch(
            "path refers to the whole document, which must be an array".to_string(),
        ));
    }
    modify_at(doc, segments, &|target| {
        let add = |items: &[JsonValue]| -> Result<Vec<JsonValue>> {
            if items.iter().any(|element| element == value) {
                // Already present: set-like add is a no-op.
                return Ok(items.to_vec());
            }
            let mut updated = items.to_vec();
            updated.push(value.clone());
            Ok(updated)
        };
        let mut modifier = ArrayModify { apply: &add };
        target.accept(&mut modifier)
    })
}

fn apply_array_remove(
    doc: &JsonValue,
    segments: &[String],
    value: &JsonValue,
) -> Result<JsonValue> {
    if segments.is_empty() {
        return Err(Error::Patch(
            "path refers to the whole document, which must be an array".to_string(),
        ));
    }
    modify_at(doc, segments, &|target| {
        let remove = |items: &[JsonValue]| -> Result<Vec<JsonValue>> {
            Ok(items
                .iter()
                .filter(|element| *element != value)
                .cloned()
                .collect())
        };
        let mut modifier = ArrayModify { apply: &remove };
        target.accept(&mut modifier)
    })
}

fn apply_object_add(doc: &JsonValue, segments: &[String], value: &JsonValue) -> Result<JsonValue> {
    if segments.is_empty() {
        return Err(Error::Patch(
            "path refers to the whole document, which must be an object".to_string(),
        ));
    }
    let property = &segments[segments.len() - 1];
    let parent = &segments[..segments.len() - 1];
    modify_at(doc, parent, &|target| {
        let insert = |members: &BTreeMap<String, JsonValue>| -> Result<BTreeMap<String, JsonValue>> {
            if members.contains_key(property) {
                // Existing property is left untouched.
                return Ok(members.clone());
            }
            let mut updated = members.clone();
            updated.insert(property.clone(), value.clone());
            Ok(updated)
        };
        let mut modifier = ObjectModify { apply: &insert };
        target.accept(&mut modifier)
    })
}

/// Recursively navigates to the value at `segments` and applies `modify`,
/// rebuilding each object along the way with the modified child in place.
fn modify_at(
    doc: &JsonValue,
    segments: &[String],
    modify: &dyn Fn(&JsonValue) -> Result<JsonValue>,
) -> Result<JsonValue> {
    if segments.is_empty() {
        return modify(doc);
    }
    let mut navigator = Navigator {
        key: &segments[0],
        remaining: &segments[1..],
        modify,
    };
    doc.accept(&mut navigator)
}

// =============================================================================
// Visitors
// =============================================================================

/// Navigates one object level toward the target, erroring on every other
/// variant.
struct Navigator<'a> {
    key: &'a str,
    remaining: &'a [String],
    modify: &'a dyn Fn(&JsonValue) -> Result<JsonValue>,
}

impl Visitor for Navigator<'_> {
    type Output = JsonValue;

    fn object(&mut self, members: &BTreeMap<String, JsonValue>) -> Result<JsonValue> {
        let child = members
            .get(self.key)
            .ok_or_else(|| Error::Patch(format!("key '{}' not found in object", self.key)))?;
        let modified = modify_at(child, self.remaining, self.modify)?;
        let mut updated = members.clone();
        updated.insert(self.key.to_string(), modified);
        Ok(JsonValue::from(updated))
    }

    fn array(&mut self, _: &[JsonValue]) -> Result<JsonValue> {
        Err(Error::Patch("unexpected array while navigating".to_string()))
    }

    fn string(&mut self, _: &str) -> Result<JsonValue> {
        Err(Error::Patch(
            "unexpected string while navigating".to_string(),
        ))
    }

    fn number(&mut self, _: f64) -> Result<JsonValue> {
        Err(Error::Patch(
            "unexpected number while navigating".to_string(),
        ))
    }

    fn boolean(&mut self, _: bool) -> Result<JsonValue> {
        Err(Error::Patch("unexpected bool while navigating".to_string()))
    }

    fn null(&mut self) -> Result<JsonValue> {
        Err(Error::Patch("unexpected null while navigating".to_string()))
    }
}

/// Requires an array at the terminal segment and rebuilds it with `apply`.
struct ArrayModify<'a> {
    apply: &'a dyn Fn(&[JsonValue]) -> Result<Vec<JsonValue>>,
}

impl Visitor for ArrayModify<'_> {
    type Output = JsonValue;

    fn array(&mut self, items: &[JsonValue]) -> Result<JsonValue> {
        Ok(JsonValue::from((self.apply)(items)?))
    }

    fn object(&mut self, _: &BTreeMap<String, JsonValue>) -> Result<JsonValue> {
        Err(Error::Patch("expected array but found object".to_string()))
    }

    fn string(&mut self, _: &str) -> Result<JsonValue> {
        Err(Error::Patch("expected array but found string".to_string()))
    }

    fn number(&mut self, _: f64) -> Result<JsonValue> {
        Err(Error::Patch("expected array but found number".to_string()))
    }

    fn boolean(&mut self, _: bool) -> Result<JsonValue> {
        Err(Error::Patch("expected array but found bool".to_string()))
    }

    fn null(&mut self) -> Result<JsonValue> {
        Err(Error::Patch("expected array but found null".to_string()))
    }
}

/// Requires an object at the terminal segment and rebuilds it with `apply`.
struct ObjectModify<'a> {
    apply: &'a dyn Fn(&BTreeMap<String, JsonValue>) -> Result<BTreeMap<String, JsonValue>>,
}

impl Visitor for ObjectModify<'_> {
    type Output = JsonValue;

    fn object(&mut self, members: &BTreeMap<String, JsonValue>) -> Result<JsonValue> {
        Ok(JsonValue::from((self.apply)(members)?))
    }

    fn array(&mut self, _: &[JsonValue]) -> Result<JsonValue> {
        Err(Error::Patch("expected object but found array".to_string()))
    }

    fn string(&mut self, _: &str) -> Result<JsonValue> {
        Err(Error::Patch("expected object but found string".to_string()))
    }

    fn number(&mut self, _: f64) -> Result<JsonValue> {
        Err(Error::Patch("expected object but found number".to_string()))
    }

    fn boolean(&mut self, _: bool) -> Result<JsonValue> {
        Err(Error::Patch("expected object but found bool".to_string()))
    }

    fn null(&mut self) -> Result<JsonValue> {
        Err(Error::Patch("expected object but found null".to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
