//! Schema deltas and pending local transactions.
//!
//! Only the shape needed to decide how concurrent schema changes combine is
//! modeled here: which classes and properties a change-set adds, moves or
//! retypes, and the record values a pending transaction writes.

use crate::codes::Code;
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Primitive type of a schema property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyType {
    /// 64-bit integer.
    Integer,
    /// 64-bit float.
    Double,
    /// UTF-8 string.
    String,
    /// Boolean.
    Boolean,
}

impl PropertyType {
    /// Converts a stored value into this type.
    pub fn convert(&self, value: &Value) -> ProtocolResult<Value> {
        let converted = match (self, value) {
            (_, Value::Null) => Some(Value::Null),
            (PropertyType::Integer, Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Value::from),
            (PropertyType::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (PropertyType::Integer, Value::Bool(b)) => Some(Value::from(i64::from(*b))),
            (PropertyType::Double, Value::Number(n)) => n.as_f64().map(Value::from),
            (PropertyType::Double, Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::from),
            (PropertyType::String, Value::String(s)) => Some(Value::String(s.clone())),
            (PropertyType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            (PropertyType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
            (PropertyType::Boolean, Value::Bool(b)) => Some(Value::Bool(*b)),
            (PropertyType::Boolean, Value::Number(n)) => n.as_i64().map(|i| Value::Bool(i != 0)),
            _ => None,
        };
        converted.ok_or_else(|| ProtocolError::Conversion {
            value: value.to_string(),
            target: self.to_string(),
        })
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyType::Integer => "integer",
            PropertyType::Double => "double",
            PropertyType::String => "string",
            PropertyType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// One structural change inside a schema delta.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SchemaChange {
    /// A new class.
    AddClass {
        /// Class name.
        class: String,
    },
    /// A new property on an existing class.
    AddProperty {
        /// Owning class.
        class: String,
        /// Property name.
        property: String,
        /// Property type.
        property_type: PropertyType,
    },
    /// A property moved from one class to another (e.g. into a base class).
    MoveProperty {
        /// Property name.
        property: String,
        /// Previous owner.
        from_class: String,
        /// New owner.
        to_class: String,
    },
    /// A property whose type changed.
    RetypeProperty {
        /// Owning class.
        class: String,
        /// Property name.
        property: String,
        /// Previous type.
        from: PropertyType,
        /// New type.
        to: PropertyType,
    },
}

impl SchemaChange {
    /// Additive changes commute with any data change.
    pub fn is_additive(&self) -> bool {
        matches!(
            self,
            SchemaChange::AddClass { .. } | SchemaChange::AddProperty { .. }
        )
    }
}

/// The schema changes carried by one change-set or transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDelta {
    /// Schema name.
    pub schema: String,
    /// Schema version after the delta is applied.
    pub version: u32,
    /// Changes in application order.
    pub changes: Vec<SchemaChange>,
}

impl SchemaDelta {
    /// Creates an empty delta targeting `version`.
    pub fn new(schema: impl Into<String>, version: u32) -> Self {
        Self {
            schema: schema.into(),
            version,
            changes: Vec::new(),
        }
    }

    /// Appends a change.
    pub fn with_change(mut self, change: SchemaChange) -> Self {
        self.changes.push(change);
        self
    }

    /// Returns true if every change is additive.
    pub fn is_additive(&self) -> bool {
        self.changes.iter().all(SchemaChange::is_additive)
    }

    /// Returns true if any change needs record-level transformation.
    pub fn requires_transform(&self) -> bool {
        !self.is_additive()
    }
}

/// A property value written by a record change, keyed by its owning class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyValue {
    /// Class that owns the property.
    pub class: String,
    /// Property name.
    pub name: String,
    /// Stored value.
    pub value: Value,
}

/// Values written to one record by a pending transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordChange {
    /// Record (element) id.
    pub element_id: String,
    /// Concrete class of the record.
    pub class: String,
    /// Written values.
    pub values: Vec<PropertyValue>,
}

impl RecordChange {
    /// Rewrites the values so they resolve under the post-change layout.
    pub fn transform(&mut self, change: &SchemaChange) -> ProtocolResult<()> {
        match change {
            SchemaChange::MoveProperty {
                property,
                from_class,
                to_class,
            } => {
                for v in self
                    .values
                    .iter_mut()
                    .filter(|v| &v.class == from_class && &v.name == property)
                {
                    v.class = to_class.clone();
                }
            }
            SchemaChange::RetypeProperty {
                class, property, to, ..
            } => {
                for v in self
                    .values
                    .iter_mut()
                    .filter(|v| &v.class == class && &v.name == property)
                {
                    v.value = to.convert(&v.value)?;
                }
            }
            SchemaChange::AddClass { .. } | SchemaChange::AddProperty { .. } => {}
        }
        Ok(())
    }
}

/// What a pending local transaction carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "camelCase")]
pub enum TxnPayload {
    /// Record changes.
    Data(Vec<RecordChange>),
    /// A schema import.
    Schema(SchemaDelta),
}

/// A committed local transaction that has not been pushed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTxn {
    /// Local transaction id.
    pub id: u64,
    /// Transaction content.
    pub payload: TxnPayload,
    /// Codes the transaction uses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<Code>,
}

impl PendingTxn {
    /// A data transaction.
    pub fn data(id: u64, changes: Vec<RecordChange>, codes: Vec<Code>) -> Self {
        Self {
            id,
            payload: TxnPayload::Data(changes),
            codes,
        }
    }

    /// A schema import.
    pub fn schema_import(id: u64, delta: SchemaDelta) -> Self {
        Self {
            id,
            payload: TxnPayload::Schema(delta),
            codes: Vec::new(),
        }
    }

    /// Returns the schema delta if this is a schema transaction.
    pub fn schema(&self) -> Option<&SchemaDelta> {
        match &self.payload {
            TxnPayload::Schema(delta) => Some(delta),
            TxnPayload::Data(_) => None,
        }
    }
}
