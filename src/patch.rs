//! Explicit `{path, op, value}` patches over cached JSON data.
//!
//! Optimistic updates run a recipe against a copy of the cached value and
//! diff the result, producing a forward patch list and a matching inverse.
//! Applying the forward list then the inverse restores the original value
//! bit-identical, which is what makes "apply now, roll back on failure"
//! work without a deep-immutability library.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One step into a JSON value: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_owned())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// The operation a [`Patch`] performs at its path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Insert a value: a new object key, or an array insertion at the index.
    Add { value: Value },
    /// Overwrite the value at the path.
    Replace { value: Value },
    /// Delete the object key or array element at the path.
    Remove,
}

/// A single reversible delta against cached data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub path: Vec<PathSegment>,
    #[serde(flatten)]
    pub op: PatchOp,
}

impl Patch {
    pub fn add(path: Vec<PathSegment>, value: Value) -> Self {
        Self { path, op: PatchOp::Add { value } }
    }

    pub fn replace(path: Vec<PathSegment>, value: Value) -> Self {
        Self { path, op: PatchOp::Replace { value } }
    }

    pub fn remove(path: Vec<PathSegment>) -> Self {
        Self { path, op: PatchOp::Remove }
    }
}

/// A forward patch list paired with the inverse that undoes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchSet {
    pub patches: Vec<Patch>,
    pub inverse: Vec<Patch>,
}

impl PatchSet {
    /// `true` when the recipe changed nothing or no record matched.
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.inverse.is_empty()
    }
}

/// Failure while applying a patch to a concrete value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("path segment `{0}` does not exist")]
    MissingPath(String),

    #[error("array index {0} out of bounds")]
    IndexOutOfBounds(usize),

    #[error("cannot descend into a non-container value")]
    NotAContainer,
}

/// Diffs `old` against `new`, producing forward patches and their inverse.
///
/// Objects are diffed key by key; arrays of equal length element by element.
/// Anything else that differs becomes a single `Replace` at that path.
pub fn diff(old: &Value, new: &Value) -> PatchSet {
    let mut set = PatchSet::default();
    diff_at(&mut Vec::new(), old, new, &mut set);
    set
}

fn diff_at(path: &mut Vec<PathSegment>, old: &Value, new: &Value, out: &mut PatchSet) {
    if old == new {
        return;
    }

    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_value) in old_map {
                path.push(PathSegment::Key(key.clone()));
                match new_map.get(key) {
                    Some(new_value) => diff_at(path, old_value, new_value, out),
                    None => {
                        out.patches.push(Patch::remove(path.clone()));
                        out.inverse.push(Patch::add(path.clone(), old_value.clone()));
                    }
                }
                path.pop();
            }
            for (key, new_value) in new_map {
                if !old_map.contains_key(key) {
                    path.push(PathSegment::Key(key.clone()));
                    out.patches.push(Patch::add(path.clone(), new_value.clone()));
                    out.inverse.push(Patch::remove(path.clone()));
                    path.pop();
                }
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) if old_items.len() == new_items.len() => {
            for (i, (old_item, new_item)) in old_items.iter().zip(new_items).enumerate() {
                path.push(PathSegment::Index(i));
                diff_at(path, old_item, new_item, out);
                path.pop();
            }
        }
        _ => {
            out.patches.push(Patch::replace(path.clone(), new.clone()));
            out.inverse.push(Patch::replace(path.clone(), old.clone()));
        }
    }
}

/// Applies `patches` to `target` in order, stopping at the first failure.
pub fn apply(target: &mut Value, patches: &[Patch]) -> Result<(), PatchError> {
    for patch in patches {
        apply_one(target, patch)?;
    }
    Ok(())
}

fn apply_one(target: &mut Value, patch: &Patch) -> Result<(), PatchError> {
    let Some((last, parents)) = patch.path.split_last() else {
        // Patch addressed at the root replaces the whole value.
        match &patch.op {
            PatchOp::Add { value } | PatchOp::Replace { value } => *target = value.clone(),
            PatchOp::Remove => *target = Value::Null,
        }
        return Ok(());
    };

    let mut current = target;
    for segment in parents {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map
                .get_mut(key)
                .ok_or_else(|| PatchError::MissingPath(key.clone()))?,
            (PathSegment::Index(i), Value::Array(items)) => {
                items.get_mut(*i).ok_or(PatchError::IndexOutOfBounds(*i))?
            }
            _ => return Err(PatchError::NotAContainer),
        };
    }

    match (current, last) {
        (Value::Object(map), PathSegment::Key(key)) => match &patch.op {
            PatchOp::Add { value } | PatchOp::Replace { value } => {
                map.insert(key.clone(), value.clone());
            }
            PatchOp::Remove => {
                map.remove(key)
                    .ok_or_else(|| PatchError::MissingPath(key.clone()))?;
            }
        },
        (Value::Array(items), PathSegment::Index(i)) => match &patch.op {
            PatchOp::Add { value } => {
                if *i > items.len() {
                    return Err(PatchError::IndexOutOfBounds(*i));
                }
                items.insert(*i, value.clone());
            }
            PatchOp::Replace { value } => {
                *items.get_mut(*i).ok_or(PatchError::IndexOutOfBounds(*i))? = value.clone();
            }
            PatchOp::Remove => {
                if *i >= items.len() {
                    return Err(PatchError::IndexOutOfBounds(*i));
                }
                items.remove(*i);
            }
        },
        _ => return Err(PatchError::NotAContainer),
    }
    Ok(())
}
