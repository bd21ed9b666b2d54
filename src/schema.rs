//! Attribute schema for synthetic patients.
//!
//! The schema is the single source of truth for which patient attributes
//! exist, how they are typed, and how the generator samples them. It is
//! loaded once per run and treated as immutable afterwards.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Declared type of a patient attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    Numeric,
    Categorical,
    Boolean,
}

impl std::fmt::Display for AttributeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributeType::Numeric => write!(f, "numeric"),
            AttributeType::Categorical => write!(f, "categorical"),
            AttributeType::Boolean => write!(f, "boolean"),
        }
    }
}

/// Sampling distribution for one attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Distribution {
    /// Uniform over [min, max]
    Uniform { min: f64, max: f64 },

    /// Normal(mean, sd), clamped to the attribute's valid range when declared
    Normal { mean: f64, sd: f64 },

    /// Weighted draw over named categories
    Categorical {
        categories: Vec<String>,
        weights: Vec<f64>,
    },

    /// Boolean with P(true) = p
    Bernoulli { p: f64 },
}

/// Specification of a single attribute: type, distribution, valid domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSpec {
    #[serde(rename = "type")]
    pub ty: AttributeType,

    pub distribution: Distribution,

    /// Valid numeric range [lo, hi], inclusive. Samples are clamped to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<[f64; 2]>,

    /// Valid category set. Empty means "whatever the distribution produces".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

impl AttributeSpec {
    pub fn numeric_uniform(min: f64, max: f64) -> Self {
        Self {
            ty: AttributeType::Numeric,
            distribution: Distribution::Uniform { min, max },
            range: Some([min, max]),
            categories: Vec::new(),
        }
    }

    pub fn numeric_normal(mean: f64, sd: f64, range: Option<[f64; 2]>) -> Self {
        Self {
            ty: AttributeType::Numeric,
            distribution: Distribution::Normal { mean, sd },
            range,
            categories: Vec::new(),
        }
    }

    pub fn categorical(categories: Vec<&str>, weights: Vec<f64>) -> Self {
        let categories: Vec<String> = categories.into_iter().map(String::from).collect();
        Self {
            ty: AttributeType::Categorical,
            distribution: Distribution::Categorical {
                categories: categories.clone(),
                weights,
            },
            range: None,
            categories,
        }
    }

    pub fn boolean(p_true: f64) -> Self {
        Self {
            ty: AttributeType::Boolean,
            distribution: Distribution::Bernoulli { p: p_true },
            range: None,
            categories: Vec::new(),
        }
    }

    /// Whether a category name is inside this attribute's valid set.
    /// An empty declared set accepts any category.
    pub fn allows_category(&self, name: &str) -> bool {
        self.categories.is_empty() || self.categories.iter().any(|c| c == name)
    }

    /// Whether a numeric value lies in the declared range (if any)
    pub fn allows_value(&self, value: f64) -> bool {
        match self.range {
            Some([lo, hi]) => value >= lo && value <= hi,
            None => true,
        }
    }
}

/// Schema validation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("attribute '{attribute}': distribution does not match declared type {ty}")]
    DistributionMismatch { attribute: String, ty: AttributeType },

    #[error("attribute '{attribute}': invalid range [{lo}, {hi}]")]
    InvalidRange { attribute: String, lo: f64, hi: f64 },

    #[error("attribute '{attribute}': categorical distribution needs {categories} weights, got {weights}")]
    WeightMismatch {
        attribute: String,
        categories: usize,
        weights: usize,
    },

    #[error("attribute '{attribute}': empty category set")]
    EmptyCategories { attribute: String },

    #[error("attribute '{attribute}': probability {p} outside [0, 1]")]
    InvalidProbability { attribute: String, p: f64 },
}

/// Ordered map of attribute name -> specification.
///
/// Iteration order is the attribute name order (BTreeMap), which keeps
/// sampling order stable across runs for a fixed schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeSchema {
    attributes: BTreeMap<String, AttributeSpec>,
}

impl AttributeSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an attribute specification
    pub fn insert(&mut self, name: &str, spec: AttributeSpec) -> &mut Self {
        self.attributes.insert(name.to_string(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeSpec> {
        self.attributes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeSpec)> {
        self.attributes.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.attributes.keys()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Load a schema from a JSON file and validate it
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read schema file: {}", path.display()))?;
        let schema: AttributeSchema = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse schema file: {}", path.display()))?;
        schema
            .validate()
            .with_context(|| format!("Invalid schema: {}", path.display()))?;
        Ok(schema)
    }

    /// Check internal consistency of every attribute specification
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (name, spec) in &self.attributes {
            let attribute = name.clone();

            if let Some([lo, hi]) = spec.range {
                if !(lo <= hi) {
                    return Err(SchemaError::InvalidRange { attribute, lo, hi });
                }
            }

            match (&spec.ty, &spec.distribution) {
                (AttributeType::Numeric, Distribution::Uniform { min, max }) => {
                    if !(min <= max) {
                        return Err(SchemaError::InvalidRange {
                            attribute,
                            lo: *min,
                            hi: *max,
                        });
                    }
                }
                (AttributeType::Numeric, Distribution::Normal { sd, .. }) => {
                    if *sd < 0.0 {
                        return Err(SchemaError::InvalidRange {
                            attribute,
                            lo: *sd,
                            hi: 0.0,
                        });
                    }
                }
                (AttributeType::Categorical, Distribution::Categorical { categories, weights }) => {
                    if categories.is_empty() {
                        return Err(SchemaError::EmptyCategories { attribute });
                    }
                    if categories.len() != weights.len() {
                        return Err(SchemaError::WeightMismatch {
                            attribute,
                            categories: categories.len(),
                            weights: weights.len(),
                        });
                    }
                }
                (AttributeType::Boolean, Distribution::Bernoulli { p }) => {
                    if !(0.0..=1.0).contains(p) {
                        return Err(SchemaError::InvalidProbability { attribute, p: *p });
                    }
                }
                (ty, _) => {
                    return Err(SchemaError::DistributionMismatch {
                        attribute,
                        ty: *ty,
                    });
                }
            }
        }
        Ok(())
    }
}
