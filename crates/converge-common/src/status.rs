//! Status labels, attribute values and observed remote state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// A status label reported by the remote system (e.g. "CREATING", "VALID").
///
/// Comparison is exact; remote systems are expected to report a stable
/// spelling for each status.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(String);

impl Status {
    /// Label used for the synthetic state produced when a deletion-aware
    /// wait observes that the resource is gone.
    pub const DELETED: &'static str = "DELETED";

    /// Creates a new status label.
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Returns the synthetic "deleted" status.
    pub fn deleted() -> Self {
        Self::new(Self::DELETED)
    }

    /// Returns the label as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Status {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Status {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Ordered set of status labels.
pub type StatusSet = BTreeSet<Status>;

/// Builds a [`StatusSet`] from anything convertible to [`Status`].
pub fn status_set<I, S>(labels: I) -> StatusSet
where
    I: IntoIterator<Item = S>,
    S: Into<Status>,
{
    labels.into_iter().map(Into::into).collect()
}

/// Renders a status set as `A|B|C` for log and error messages.
pub fn display_set(set: &StatusSet) -> String {
    set.iter()
        .map(Status::as_str)
        .collect::<Vec<_>>()
        .join("|")
}

/// A single attribute value of a resource.
///
/// Configuration and API shapes are decoded into this closed set of
/// variants instead of being inspected with dynamic type checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// Explicitly unset.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// String value.
    String(String),
    /// Ordered list of values.
    List(Vec<AttrValue>),
}

impl AttrValue {
    /// Returns the string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the boolean value, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the list elements, if this is a list.
    pub fn as_list(&self) -> Option<&[AttrValue]> {
        match self {
            AttrValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns true for [`AttrValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

impl<T: Into<AttrValue>> From<Vec<T>> for AttrValue {
    fn from(items: Vec<T>) -> Self {
        AttrValue::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<AttrValue>> From<Option<T>> for AttrValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(AttrValue::Null)
    }
}

/// Attribute set of a resource, keyed by attribute name.
pub type Attributes = BTreeMap<String, AttrValue>;

/// Typed accessors over an [`Attributes`] map.
pub trait AttributesExt {
    /// Gets a string attribute.
    fn get_str(&self, name: &str) -> Option<&str>;

    /// Gets an integer attribute.
    fn get_int(&self, name: &str) -> Option<i64>;

    /// Gets a list attribute as strings, skipping non-string elements.
    fn get_str_list(&self, name: &str) -> Option<Vec<&str>>;

    /// Returns the attribute, treating a missing entry as [`AttrValue::Null`].
    fn value_or_null(&self, name: &str) -> &AttrValue;
}

static NULL: AttrValue = AttrValue::Null;

impl AttributesExt for Attributes {
    fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttrValue::as_str)
    }

    fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(AttrValue::as_int)
    }

    fn get_str_list(&self, name: &str) -> Option<Vec<&str>> {
        self.get(name)
            .and_then(AttrValue::as_list)
            .map(|items| items.iter().filter_map(AttrValue::as_str).collect())
    }

    fn value_or_null(&self, name: &str) -> &AttrValue {
        self.get(name).unwrap_or(&NULL)
    }
}

/// Builds an [`Attributes`] map from name/value pairs.
#[macro_export]
macro_rules! attrs {
    ($($name:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut map = $crate::Attributes::new();
        $(map.insert($name.to_string(), $crate::AttrValue::from($value));)*
        map
    }};
}

/// Identifies one remote resource: its kind and its remote identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Resource kind name (registry key).
    pub kind: String,
    /// Remote identifier (name, ARN, ...).
    pub id: String,
}

impl ResourceKey {
    /// Creates a new key.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// The remote object as last fetched.
///
/// Owned by a single reconciliation call and never cached beyond it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedState {
    /// Which resource was observed.
    pub key: ResourceKey,
    /// Attributes reported by the remote system.
    pub attrs: Attributes,
    /// Status label at observation time.
    pub status: Status,
    /// False when the remote system reports the resource as not found.
    pub exists: bool,
}

impl ObservedState {
    /// An observation of an existing resource.
    pub fn present(key: ResourceKey, status: impl Into<Status>, attrs: Attributes) -> Self {
        Self {
            key,
            attrs,
            status: status.into(),
            exists: true,
        }
    }

    /// An observation that the resource does not exist.
    pub fn absent(key: ResourceKey, status: impl Into<Status>) -> Self {
        Self {
            key,
            attrs: Attributes::new(),
            status: status.into(),
            exists: false,
        }
    }
}
