use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::id::NodeId;
use crate::name::Name;
use crate::path::Path;

/// The type of a property value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    String,
    Long,
    Double,
    Boolean,
    Date,
    Name,
    Path,
    /// A reference whose target must exist (referential integrity is enforced).
    Reference,
    /// A reference that may dangle.
    WeakReference,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "String",
            Self::Long => "Long",
            Self::Double => "Double",
            Self::Boolean => "Boolean",
            Self::Date => "Date",
            Self::Name => "Name",
            Self::Path => "Path",
            Self::Reference => "Reference",
            Self::WeakReference => "WeakReference",
        };
        write!(f, "{s}")
    }
}

/// A single property value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Name(Name),
    Path(Path),
    Reference(NodeId),
    WeakReference(NodeId),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::String(_) => ValueType::String,
            Self::Long(_) => ValueType::Long,
            Self::Double(_) => ValueType::Double,
            Self::Boolean(_) => ValueType::Boolean,
            Self::Date(_) => ValueType::Date,
            Self::Name(_) => ValueType::Name,
            Self::Path(_) => ValueType::Path,
            Self::Reference(_) => ValueType::Reference,
            Self::WeakReference(_) => ValueType::WeakReference,
        }
    }

    /// The target of a strong or weak reference.
    pub fn as_node_id(&self) -> Option<&NodeId> {
        match self {
            Self::Reference(id) | Self::WeakReference(id) => Some(id),
            _ => None,
        }
    }

    /// The target of a strong reference only.
    pub fn strong_reference(&self) -> Option<&NodeId> {
        match self {
            Self::Reference(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&Name> {
        match self {
            Self::Name(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<&DateTime<Utc>> {
        match self {
            Self::Date(d) => Some(d),
            _ => None,
        }
    }

    /// Fail unless this value has the expected type.
    pub fn expect_type(&self, expected: ValueType) -> Result<(), TypeError> {
        let actual = self.value_type();
        if actual == expected {
            Ok(())
        } else {
            Err(TypeError::ValueTypeMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Long(n)
    }
}

impl From<Name> for Value {
    fn from(name: Name) -> Self {
        Self::Name(name)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(date: DateTime<Utc>) -> Self {
        Self::Date(date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::well_known;

    #[test]
    fn value_types() {
        assert_eq!(Value::from("x").value_type(), ValueType::String);
        assert_eq!(Value::from(true).value_type(), ValueType::Boolean);
        assert_eq!(Value::from(3i64).value_type(), ValueType::Long);
        assert_eq!(
            Value::from(well_known::NT_BASE).value_type(),
            ValueType::Name
        );
    }

    #[test]
    fn references() {
        let id = NodeId::new();
        assert_eq!(Value::Reference(id).strong_reference(), Some(&id));
        assert_eq!(Value::WeakReference(id).strong_reference(), None);
        assert_eq!(Value::WeakReference(id).as_node_id(), Some(&id));
    }

    #[test]
    fn expect_type_reports_mismatch() {
        let err = Value::from(1i64).expect_type(ValueType::Date).unwrap_err();
        assert_eq!(
            err,
            TypeError::ValueTypeMismatch {
                expected: "Date".into(),
                actual: "Long".into()
            }
        );
    }
}
