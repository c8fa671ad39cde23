//! Record-oriented document state hosted by a room.
//!
//! A document is a flat collection of records keyed by id:
//! ```text
//! ┌──────────────┬────────────┬───────────────────────────┐
//! │ id           │ type_name  │ props                     │
//! ├──────────────┼────────────┼───────────────────────────┤
//! │ page:main    │ page       │ { name: "Page 1" }        │
//! │ shape:1      │ shape      │ { type: "rect", x: 10 }   │
//! │ asset:logo   │ asset      │ { src: "/uploads/l.png" } │
//! └──────────────┴────────────┴───────────────────────────┘
//! ```
//!
//! Records are ordered by id so that encoding a state is deterministic.
//! The record map is persistent: cloning a state shares every record with
//! the original, and a change copies only the path to the touched entry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use im::OrdMap;
use serde::{Deserialize, Serialize};

/// Record identifier, conventionally `<type>:<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Type prefix before the first `:` (`shape:1` → `shape`).
    pub fn type_prefix(&self) -> Option<&str> {
        self.0.split_once(':').map(|(prefix, _)| prefix)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A property value inside a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<PropValue>),
    Map(BTreeMap<String, PropValue>),
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Text(v.to_owned())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Text(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Int(v)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Float(v)
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

/// Record properties, ordered by name.
pub type Props = BTreeMap<String, PropValue>;

/// A single document record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub type_name: String,
    pub props: Props,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            props: Props::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_prop(mut self, name: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.props.insert(name.into(), value.into());
        self
    }

    pub fn prop(&self, name: &str) -> Option<&PropValue> {
        self.props.get(name)
    }
}

/// Authoritative record collection of one room.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentState {
    /// Schema version the records conform to
    pub schema_version: u32,
    /// Number of applied operations that changed the document
    pub clock: u64,
    pub records: OrdMap<RecordId, Record>,
}

impl DocumentState {
    /// Empty document for the given schema version.
    pub fn empty(schema_version: u32) -> Self {
        Self {
            schema_version,
            clock: 0,
            records: OrdMap::new(),
        }
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }
}

/// Record types a room accepts and the version clients must speak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    version: u32,
    record_types: BTreeSet<String>,
}

impl Schema {
    pub const DEFAULT_VERSION: u32 = 1;

    pub fn new<I, S>(version: u32, record_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            version,
            record_types: record_types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn accepts(&self, type_name: &str) -> bool {
        self.record_types.contains(type_name)
    }

    pub fn record_types(&self) -> impl Iterator<Item = &str> {
        self.record_types.iter().map(String::as_str)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_VERSION,
            [
                "document",
                "page",
                "shape",
                "binding",
                "asset",
                "camera",
                "instance",
                "instance_page_state",
                "pointer",
            ],
        )
    }
}
