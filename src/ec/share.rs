//! Two-level, path-addressable state.
//!
//! A share maps names to either a scalar or one nested map of scalars, so the
//! depth limit of two is carried by the type. Dotted paths arriving from the
//! wire are still validated at runtime by [`SharePath::parse`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    /// Reads an unquoted wire atom: booleans and numbers first, then text.
    pub fn from_atom(atom: &str) -> Self {
        match atom {
            "true" => return Scalar::Bool(true),
            "false" => return Scalar::Bool(false),
            _ => {}
        }
        if let Ok(value) = atom.parse::<i64>() {
            return Scalar::Int(value);
        }
        if let Ok(value) = atom.parse::<f64>() {
            if value.is_finite() {
                return Scalar::Float(value);
            }
        }
        Scalar::Str(atom.to_string())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(value) => write!(f, "{value}"),
            Scalar::Int(value) => write!(f, "{value}"),
            Scalar::Float(value) => write!(f, "{value:?}"),
            Scalar::Str(value) => f.write_str(value),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Str(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Str(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Int(i64::from(value))
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Scalar(Scalar),
    Map(BTreeMap<String, Scalar>),
}

impl Value {
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Value::Scalar(scalar) => Some(scalar),
            Value::Map(_) => None,
        }
    }
}

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        Value::Scalar(value)
    }
}

macro_rules! value_from_scalar {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::Scalar(Scalar::from(value))
                }
            }
        )*
    };
}

value_from_scalar!(&str, String, i64, i32, f64, bool);

impl From<BTreeMap<String, Scalar>> for Value {
    fn from(value: BTreeMap<String, Scalar>) -> Self {
        Value::Map(value)
    }
}

/// A validated dotted path: `name` or `name.key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharePath {
    head: String,
    leaf: Option<String>,
}

impl SharePath {
    /// # Errors
    ///
    /// `Error::InvalidPath` for an empty path, an empty segment, or more than
    /// two segments.
    pub fn parse(path: &str) -> Result<Self> {
        let mut parts = path.split('.');
        let head = parts.next().unwrap_or_default();
        let leaf = parts.next();
        let valid = !head.is_empty()
            && leaf.map_or(true, |leaf| !leaf.is_empty())
            && parts.next().is_none()
            && !path.chars().any(char::is_whitespace);
        if !valid {
            return Err(Error::InvalidPath(path.to_string()));
        }
        Ok(Self {
            head: head.to_string(),
            leaf: leaf.map(str::to_string),
        })
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn leaf(&self) -> Option<&str> {
        self.leaf.as_deref()
    }
}

impl fmt::Display for SharePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.leaf {
            Some(leaf) => write!(f, "{}.{}", self.head, leaf),
            None => f.write_str(&self.head),
        }
    }
}

/// Ordered two-level map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Share {
    entries: BTreeMap<String, Value>,
}

impl Share {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `path` to `value`.
    ///
    /// Writing under a name that holds a scalar replaces it with a map. A map
    /// value is only accepted at the first level.
    ///
    /// # Errors
    ///
    /// `Error::InvalidPath` if the path is malformed or the value would nest
    /// deeper than two levels. The share is unchanged on error.
    pub fn update(&mut self, path: &str, value: Value) -> Result<()> {
        let path = SharePath::parse(path)?;
        match (path.leaf, value) {
            (None, value) => {
                self.entries.insert(path.head, value);
            }
            (Some(leaf), Value::Scalar(scalar)) => {
                let entry = self
                    .entries
                    .entry(path.head)
                    .or_insert_with(|| Value::Map(BTreeMap::new()));
                if let Value::Scalar(_) = entry {
                    *entry = Value::Map(BTreeMap::new());
                }
                if let Value::Map(map) = entry {
                    map.insert(leaf, scalar);
                }
            }
            (Some(leaf), Value::Map(_)) => {
                return Err(Error::InvalidPath(format!("{}.{}.*", path.head, leaf)));
            }
        }
        Ok(())
    }

    /// Removes `path`, returning the removed value.
    pub fn remove(&mut self, path: &str) -> Result<Option<Value>> {
        let path = SharePath::parse(path)?;
        let removed = match path.leaf() {
            None => self.entries.remove(path.head()),
            Some(leaf) => match self.entries.get_mut(path.head()) {
                Some(Value::Map(map)) => map.remove(leaf).map(Value::Scalar),
                _ => None,
            },
        };
        Ok(removed)
    }

    pub fn get(&self, path: &str) -> Result<Option<Value>> {
        let path = SharePath::parse(path)?;
        let found = match (self.entries.get(path.head()), path.leaf()) {
            (value, None) => value.cloned(),
            (Some(Value::Map(map)), Some(leaf)) => map.get(leaf).cloned().map(Value::Scalar),
            _ => None,
        };
        Ok(found)
    }

    /// Every scalar with its fully-qualified dotted path, in map order.
    pub fn leaves(&self) -> Vec<(String, Scalar)> {
        let mut leaves = Vec::new();
        for (name, value) in &self.entries {
            match value {
                Value::Scalar(scalar) => leaves.push((name.clone(), scalar.clone())),
                Value::Map(map) => {
                    for (key, scalar) in map {
                        leaves.push((format!("{name}.{key}"), scalar.clone()));
                    }
                }
            }
        }
        leaves
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Share {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_depth_invariant() {
        assert!(SharePath::parse("a").is_ok());
        assert!(SharePath::parse("a.b").is_ok());
        for bad in ["", "a.b.c", ".a", "a.", "a..b", "a b"] {
            assert!(
                matches!(SharePath::parse(bad), Err(Error::InvalidPath(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn update_rejects_deep_path_without_mutation() {
        let mut share = Share::new();
        share.update("a.b", Value::from(1)).unwrap();
        let before = share.clone();

        assert!(share.update("a.b.c", Value::from(1)).is_err());
        let map: BTreeMap<String, Scalar> = [("x".to_string(), Scalar::Int(1))].into();
        assert!(share.update("a.b", Value::Map(map)).is_err());
        assert_eq!(share, before);
    }

    #[test]
    fn nested_update_get_remove() {
        let mut share = Share::new();
        share.update("lifecycle", Value::from("ready")).unwrap();
        share.update("stats.count", Value::from(3)).unwrap();
        share.update("stats.rate", Value::from(0.5)).unwrap();

        assert_eq!(
            share.get("stats.count").unwrap(),
            Some(Value::Scalar(Scalar::Int(3)))
        );
        assert!(matches!(share.get("stats").unwrap(), Some(Value::Map(m)) if m.len() == 2));
        assert_eq!(share.get("missing.key").unwrap(), None);

        assert_eq!(
            share.remove("stats.rate").unwrap(),
            Some(Value::Scalar(Scalar::Float(0.5)))
        );
        assert_eq!(share.remove("stats.rate").unwrap(), None);
        assert_eq!(
            share.leaves(),
            vec![
                ("lifecycle".to_string(), Scalar::from("ready")),
                ("stats.count".to_string(), Scalar::Int(3)),
            ]
        );
    }

    #[test]
    fn leaf_write_replaces_scalar_with_map() {
        let mut share = Share::new();
        share.update("a", Value::from(1)).unwrap();
        share.update("a.b", Value::from(2)).unwrap();
        assert_eq!(share.leaves(), vec![("a.b".to_string(), Scalar::Int(2))]);
    }

    #[test]
    fn atoms_parse_to_typed_scalars() {
        assert_eq!(Scalar::from_atom("true"), Scalar::Bool(true));
        assert_eq!(Scalar::from_atom("-4"), Scalar::Int(-4));
        assert_eq!(Scalar::from_atom("2.5"), Scalar::Float(2.5));
        assert_eq!(Scalar::from_atom("inf"), Scalar::from("inf"));
        assert_eq!(Scalar::from_atom("ready"), Scalar::from("ready"));
        assert_eq!(Scalar::Float(1.0).to_string(), "1.0");
    }

    #[test]
    fn share_collects_from_pairs() {
        let share: Share = [("b", 2), ("a", 1)].into_iter().collect();
        assert_eq!(share.len(), 2);
        assert_eq!(share.entries().next().map(|(name, _)| name), Some("a"));
    }
}
