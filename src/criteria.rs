//! Eligibility criteria AST.
//!
//! A criteria set is a tree of comparison, membership, and boolean nodes.
//! Nodes carry a stable pre-order id assigned at construction, so downstream
//! diagnostics can reference individual criteria reproducibly. The tree is
//! validated against the attribute schema when built and is immutable
//! afterwards.

use crate::schema::{AttributeSchema, AttributeType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Type alias for node references (pre-order index, root = 0)
pub type NodeId = usize;

/// Comparison operator on a single attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    /// Inclusive on both ends; requires a range value
    Between,
}

impl std::fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComparisonOp::Lt => "<",
            ComparisonOp::Le => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Ge => ">=",
            ComparisonOp::Eq => "==",
            ComparisonOp::Ne => "!=",
            ComparisonOp::Between => "between",
        };
        write!(f, "{}", s)
    }
}

/// Right-hand side of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CriterionValue {
    Number(f64),
    Text(String),
    Flag(bool),
    /// [lo, hi] for `Between`
    Range(f64, f64),
}

/// Boolean combinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoolOp {
    And,
    Or,
    Not,
}

/// Node payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum CriterionKind {
    Comparison {
        attribute: String,
        op: ComparisonOp,
        value: CriterionValue,
    },
    Membership {
        attribute: String,
        allowed: Vec<String>,
    },
    BooleanOp {
        op: BoolOp,
        children: Vec<CriterionNode>,
    },
}

/// One criterion: stable id, human-readable clause label, payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionNode {
    pub id: NodeId,
    pub label: String,
    pub kind: CriterionKind,
}

impl CriterionNode {
    /// Comparison leaf. The id is assigned when the tree is built.
    pub fn comparison(label: &str, attribute: &str, op: ComparisonOp, value: CriterionValue) -> Self {
        Self {
            id: 0,
            label: label.to_string(),
            kind: CriterionKind::Comparison {
                attribute: attribute.to_string(),
                op,
                value,
            },
        }
    }

    /// Membership leaf
    pub fn membership(label: &str, attribute: &str, allowed: Vec<String>) -> Self {
        Self {
            id: 0,
            label: label.to_string(),
            kind: CriterionKind::Membership {
                attribute: attribute.to_string(),
                allowed,
            },
        }
    }

    pub fn and(label: &str, children: Vec<CriterionNode>) -> Self {
        Self {
            id: 0,
            label: label.to_string(),
            kind: CriterionKind::BooleanOp {
                op: BoolOp::And,
                children,
            },
        }
    }

    pub fn or(label: &str, children: Vec<CriterionNode>) -> Self {
        Self {
            id: 0,
            label: label.to_string(),
            kind: CriterionKind::BooleanOp {
                op: BoolOp::Or,
                children,
            },
        }
    }

    pub fn not(label: &str, child: CriterionNode) -> Self {
        Self {
            id: 0,
            label: label.to_string(),
            kind: CriterionKind::BooleanOp {
                op: BoolOp::Not,
                children: vec![child],
            },
        }
    }

    /// Whether this node is a comparison or membership leaf
    pub fn is_leaf(&self) -> bool {
        !matches!(self.kind, CriterionKind::BooleanOp { .. })
    }
}

/// Construction-time validation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CriteriaError {
    #[error("unknown attribute '{attribute}'")]
    UnknownAttribute { attribute: String },

    #[error("attribute '{attribute}' is {ty}; operator {op} with {value:?} is not applicable")]
    TypeMismatch {
        attribute: String,
        ty: AttributeType,
        op: ComparisonOp,
        value: CriterionValue,
    },

    #[error("attribute '{attribute}' has no category '{category}'")]
    UnknownCategory { attribute: String, category: String },

    #[error("membership criterion on '{attribute}' has an empty set")]
    EmptyMembership { attribute: String },

    #[error("boolean {op:?} node requires at least one child")]
    EmptyBooleanOp { op: BoolOp },

    #[error("not node requires exactly one child, got {children}")]
    NotArity { children: usize },
}

/// Validated, immutable criteria tree.
///
/// `root == None` means "no criteria": every patient passes. This is the
/// degenerate output of a parse in which every clause was dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriteriaAst {
    root: Option<CriterionNode>,
    node_count: usize,
}

impl CriteriaAst {
    /// Validate a tree against the schema, assign pre-order ids, and freeze it.
    pub fn new(root: CriterionNode, schema: &AttributeSchema) -> Result<Self, CriteriaError> {
        validate_node(&root, schema)?;
        let mut root = root;
        let mut next = 0;
        assign_ids(&mut root, &mut next);
        Ok(Self {
            root: Some(root),
            node_count: next,
        })
    }

    /// The accept-all criteria set
    pub fn accept_all() -> Self {
        Self {
            root: None,
            node_count: 0,
        }
    }

    pub fn root(&self) -> Option<&CriterionNode> {
        self.root.as_ref()
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn is_accept_all(&self) -> bool {
        self.root.is_none()
    }

    /// Look up a node by its pre-order id
    pub fn find(&self, id: NodeId) -> Option<&CriterionNode> {
        fn walk<'a>(node: &'a CriterionNode, id: NodeId) -> Option<&'a CriterionNode> {
            if node.id == id {
                return Some(node);
            }
            if let CriterionKind::BooleanOp { children, .. } = &node.kind {
                for child in children {
                    if let Some(found) = walk(child, id) {
                        return Some(found);
                    }
                }
            }
            None
        }
        self.root.as_ref().and_then(|r| walk(r, id))
    }

    /// All leaf nodes in pre-order
    pub fn leaves(&self) -> Vec<&CriterionNode> {
        fn walk<'a>(node: &'a CriterionNode, out: &mut Vec<&'a CriterionNode>) {
            match &node.kind {
                CriterionKind::BooleanOp { children, .. } => {
                    for child in children {
                        walk(child, out);
                    }
                }
                _ => out.push(node),
            }
        }
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            walk(root, &mut out);
        }
        out
    }
}

fn assign_ids(node: &mut CriterionNode, next: &mut NodeId) {
    node.id = *next;
    *next += 1;
    if let CriterionKind::BooleanOp { children, .. } = &mut node.kind {
        for child in children {
            assign_ids(child, next);
        }
    }
}

fn validate_node(node: &CriterionNode, schema: &AttributeSchema) -> Result<(), CriteriaError> {
    match &node.kind {
        CriterionKind::Comparison { attribute, op, value } => {
            let spec = schema
                .get(attribute)
                .ok_or_else(|| CriteriaError::UnknownAttribute {
                    attribute: attribute.clone(),
                })?;
            let mismatch = || CriteriaError::TypeMismatch {
                attribute: attribute.clone(),
                ty: spec.ty,
                op: *op,
                value: value.clone(),
            };
            match spec.ty {
                AttributeType::Numeric => match (op, value) {
                    (ComparisonOp::Between, CriterionValue::Range(_, _)) => Ok(()),
                    (ComparisonOp::Between, _) => Err(mismatch()),
                    (_, CriterionValue::Number(_)) => Ok(()),
                    _ => Err(mismatch()),
                },
                AttributeType::Categorical => match (op, value) {
                    (ComparisonOp::Eq | ComparisonOp::Ne, CriterionValue::Text(t)) => {
                        if spec.allows_category(t) {
                            Ok(())
                        } else {
                            Err(CriteriaError::UnknownCategory {
                                attribute: attribute.clone(),
                                category: t.clone(),
                            })
                        }
                    }
                    _ => Err(mismatch()),
                },
                AttributeType::Boolean => match (op, value) {
                    (ComparisonOp::Eq | ComparisonOp::Ne, CriterionValue::Flag(_)) => Ok(()),
                    _ => Err(mismatch()),
                },
            }
        }
        CriterionKind::Membership { attribute, allowed } => {
            let spec = schema
                .get(attribute)
                .ok_or_else(|| CriteriaError::UnknownAttribute {
                    attribute: attribute.clone(),
                })?;
            if spec.ty != AttributeType::Categorical {
                return Err(CriteriaError::TypeMismatch {
                    attribute: attribute.clone(),
                    ty: spec.ty,
                    op: ComparisonOp::Eq,
                    value: CriterionValue::Text(allowed.join(",")),
                });
            }
            if allowed.is_empty() {
                return Err(CriteriaError::EmptyMembership {
                    attribute: attribute.clone(),
                });
            }
            for category in allowed {
                if !spec.allows_category(category) {
                    return Err(CriteriaError::UnknownCategory {
                        attribute: attribute.clone(),
                        category: category.clone(),
                    });
                }
            }
            Ok(())
        }
        CriterionKind::BooleanOp { op, children } => {
            match op {
                BoolOp::Not => {
                    if children.len() != 1 {
                        return Err(CriteriaError::NotArity {
                            children: children.len(),
                        });
                    }
                }
                BoolOp::And | BoolOp::Or => {
                    if children.is_empty() {
                        return Err(CriteriaError::EmptyBooleanOp { op: *op });
                    }
                }
            }
            for child in children {
                validate_node(child, schema)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AttributeSpec;

    fn test_schema() -> AttributeSchema {
        let mut schema = AttributeSchema::new();
        schema
            .insert("age", AttributeSpec::numeric_uniform(18.0, 90.0))
            .insert(
                "ebv_status",
                AttributeSpec::categorical(vec!["negative", "positive"], vec![0.5, 0.5]),
            )
            .insert("diabetic", AttributeSpec::boolean(0.1));
        schema
    }

    #[test]
    fn test_preorder_ids() {
        let schema = test_schema();
        let root = CriterionNode::and(
            "all",
            vec![
                CriterionNode::comparison("age >= 18", "age", ComparisonOp::Ge, CriterionValue::Number(18.0)),
                CriterionNode::not(
                    "no exclusions",
                    CriterionNode::or(
                        "any exclusion",
                        vec![CriterionNode::comparison(
                            "ebv positive",
                            "ebv_status",
                            ComparisonOp::Eq,
                            CriterionValue::Text("positive".to_string()),
                        )],
                    ),
                ),
            ],
        );
        let ast = CriteriaAst::new(root, &schema).unwrap();

        assert_eq!(ast.node_count(), 5);
        // Pre-order: and(0), age(1), not(2), or(3), ebv(4)
        assert_eq!(ast.root().unwrap().id, 0);
        assert_eq!(ast.find(1).unwrap().label, "age >= 18");
        assert_eq!(ast.find(4).unwrap().label, "ebv positive");
        assert!(ast.find(5).is_none());

        let leaves = ast.leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].id, 1);
        assert_eq!(leaves[1].id, 4);
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let schema = test_schema();
        let root = CriterionNode::comparison(
            "bmi < 30",
            "bmi",
            ComparisonOp::Lt,
            CriterionValue::Number(30.0),
        );
        assert!(matches!(
            CriteriaAst::new(root, &schema),
            Err(CriteriaError::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let schema = test_schema();
        // Numeric operator on a boolean attribute
        let root = CriterionNode::comparison(
            "diabetic > 0",
            "diabetic",
            ComparisonOp::Gt,
            CriterionValue::Number(0.0),
        );
        assert!(matches!(
            CriteriaAst::new(root, &schema),
            Err(CriteriaError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_between_requires_range_value() {
        let schema = test_schema();
        let bad = CriterionNode::comparison(
            "age between",
            "age",
            ComparisonOp::Between,
            CriterionValue::Number(18.0),
        );
        assert!(CriteriaAst::new(bad, &schema).is_err());

        let good = CriterionNode::comparison(
            "age between 18 and 45",
            "age",
            ComparisonOp::Between,
            CriterionValue::Range(18.0, 45.0),
        );
        assert!(CriteriaAst::new(good, &schema).is_ok());
    }

    #[test]
    fn test_not_arity_enforced() {
        let schema = test_schema();
        let bad = CriterionNode {
            id: 0,
            label: "bad not".to_string(),
            kind: CriterionKind::BooleanOp {
                op: BoolOp::Not,
                children: vec![],
            },
        };
        assert!(matches!(
            CriteriaAst::new(bad, &schema),
            Err(CriteriaError::NotArity { children: 0 })
        ));
    }

    #[test]
    fn test_unknown_category_rejected() {
        let schema = test_schema();
        let bad = CriterionNode::membership(
            "ebv in {unknown}",
            "ebv_status",
            vec!["unknown".to_string()],
        );
        assert!(matches!(
            CriteriaAst::new(bad, &schema),
            Err(CriteriaError::UnknownCategory { .. })
        ));
    }
}
