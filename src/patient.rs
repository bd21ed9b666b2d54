//! Synthetic patient records.
//!
//! A patient is a flat mapping from attribute name to a typed value. Records
//! are built once by the generator and never mutated afterwards; simulated
//! state changes produce new records instead.

use crate::schema::AttributeType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type alias for patient identifiers
pub type PatientId = usize;

/// A typed attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Numeric(f64),
    Categorical(String),
    Boolean(bool),
}

impl AttributeValue {
    /// Runtime type of this value
    pub fn ty(&self) -> AttributeType {
        match self {
            AttributeValue::Numeric(_) => AttributeType::Numeric,
            AttributeValue::Categorical(_) => AttributeType::Categorical,
            AttributeValue::Boolean(_) => AttributeType::Boolean,
        }
    }

    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            AttributeValue::Numeric(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_category(&self) -> Option<&str> {
        match self {
            AttributeValue::Categorical(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributeValue::Numeric(v) => write!(f, "{}", v),
            AttributeValue::Categorical(s) => write!(f, "{}", s),
            AttributeValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// One synthetic patient: id plus flat attribute map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: PatientId,
    attributes: BTreeMap<String, AttributeValue>,
}

impl Patient {
    /// Build a patient from a complete attribute map
    pub fn from_attributes(id: PatientId, attributes: BTreeMap<String, AttributeValue>) -> Self {
        Self { id, attributes }
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.attributes.iter()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_patient() -> Patient {
        let mut attrs = BTreeMap::new();
        attrs.insert("age".to_string(), AttributeValue::Numeric(54.0));
        attrs.insert(
            "ebv_status".to_string(),
            AttributeValue::Categorical("negative".to_string()),
        );
        attrs.insert("diabetic".to_string(), AttributeValue::Boolean(false));
        Patient::from_attributes(7, attrs)
    }

    #[test]
    fn test_typed_access() {
        let p = test_patient();
        assert_eq!(p.id, 7);
        assert_eq!(p.get("age").and_then(AttributeValue::as_numeric), Some(54.0));
        assert_eq!(
            p.get("ebv_status").and_then(AttributeValue::as_category),
            Some("negative")
        );
        assert_eq!(
            p.get("diabetic").and_then(AttributeValue::as_boolean),
            Some(false)
        );
        assert!(p.get("weight").is_none());
    }

    #[test]
    fn test_value_types() {
        assert_eq!(AttributeValue::Numeric(1.0).ty(), AttributeType::Numeric);
        assert_eq!(
            AttributeValue::Categorical("x".into()).ty(),
            AttributeType::Categorical
        );
        assert_eq!(AttributeValue::Boolean(true).ty(), AttributeType::Boolean);
    }
}
