//! Criteria evaluation against patient records.
//!
//! Evaluation is pure and side-effect free: the same (ast, patient) pair
//! always produces the same result, including the order of reported
//! failures (pre-order traversal of the tree). The evaluator holds no
//! state and is safe to share across worker threads.

use crate::criteria::{BoolOp, CriteriaAst, CriterionKind, CriterionNode, ComparisonOp, CriterionValue, NodeId};
use crate::patient::{AttributeValue, Patient, PatientId};
use serde::{Deserialize, Serialize};

/// Why a criterion is reported as failing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The criterion's test was not met
    Unsatisfied,
    /// The patient record lacks the referenced attribute
    MissingAttribute,
    /// An exclusion criterion matched the patient
    Excluded,
}

/// One failing criterion, referencing the AST node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedCriterion {
    pub node_id: NodeId,
    pub label: String,
    pub reason: FailureReason,
}

/// Outcome of evaluating one patient against one criteria set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityResult {
    pub patient_id: PatientId,
    pub passed: bool,
    pub failing_criteria: Vec<FailedCriterion>,
}

/// Evaluate with short-circuit semantics.
///
/// `And` stops at the first false child (retaining its failures); `Or`
/// stops at the first true child. A missing attribute fails the leaf with
/// [`FailureReason::MissingAttribute`] rather than aborting.
pub fn evaluate(ast: &CriteriaAst, patient: &Patient) -> EligibilityResult {
    run(ast, patient, false)
}

/// Evaluate without short-circuiting, reporting every violated criterion.
///
/// `passed` agrees with [`evaluate`]; the failure list is complete rather
/// than truncated at the first short-circuit. Used by the generator's
/// `violating` mode to verify that exactly one criterion is broken.
pub fn evaluate_exhaustive(ast: &CriteriaAst, patient: &Patient) -> EligibilityResult {
    run(ast, patient, true)
}

fn run(ast: &CriteriaAst, patient: &Patient, exhaustive: bool) -> EligibilityResult {
    let mut failing = Vec::new();
    let passed = match ast.root() {
        Some(root) => eval_node(root, patient, &mut failing, exhaustive),
        None => true,
    };
    if passed {
        failing.clear();
    }
    EligibilityResult {
        patient_id: patient.id,
        passed,
        failing_criteria: failing,
    }
}

enum LeafOutcome {
    Pass,
    Fail,
    Missing,
}

fn eval_leaf(node: &CriterionNode, patient: &Patient) -> LeafOutcome {
    match &node.kind {
        CriterionKind::Comparison { attribute, op, value } => {
            let Some(actual) = patient.get(attribute) else {
                return LeafOutcome::Missing;
            };
            let pass = match (actual, op, value) {
                (AttributeValue::Numeric(v), ComparisonOp::Between, CriterionValue::Range(lo, hi)) => {
                    *v >= *lo && *v <= *hi
                }
                (AttributeValue::Numeric(v), op, CriterionValue::Number(rhs)) => match op {
                    ComparisonOp::Lt => v < rhs,
                    ComparisonOp::Le => v <= rhs,
                    ComparisonOp::Gt => v > rhs,
                    ComparisonOp::Ge => v >= rhs,
                    ComparisonOp::Eq => v == rhs,
                    ComparisonOp::Ne => v != rhs,
                    ComparisonOp::Between => false,
                },
                (AttributeValue::Categorical(v), ComparisonOp::Eq, CriterionValue::Text(rhs)) => v == rhs,
                (AttributeValue::Categorical(v), ComparisonOp::Ne, CriterionValue::Text(rhs)) => v != rhs,
                (AttributeValue::Boolean(v), ComparisonOp::Eq, CriterionValue::Flag(rhs)) => v == rhs,
                (AttributeValue::Boolean(v), ComparisonOp::Ne, CriterionValue::Flag(rhs)) => v != rhs,
                // Value/operator shapes the AST validator rejects; a record
                // holding an off-type value simply fails the criterion.
                _ => false,
            };
            if pass {
                LeafOutcome::Pass
            } else {
                LeafOutcome::Fail
            }
        }
        CriterionKind::Membership { attribute, allowed } => {
            let Some(actual) = patient.get(attribute) else {
                return LeafOutcome::Missing;
            };
            match actual.as_category() {
                Some(v) if allowed.iter().any(|a| a == v) => LeafOutcome::Pass,
                _ => LeafOutcome::Fail,
            }
        }
        CriterionKind::BooleanOp { .. } => unreachable!("eval_leaf called on boolean node"),
    }
}

fn eval_node(
    node: &CriterionNode,
    patient: &Patient,
    out: &mut Vec<FailedCriterion>,
    exhaustive: bool,
) -> bool {
    match &node.kind {
        CriterionKind::Comparison { .. } | CriterionKind::Membership { .. } => {
            match eval_leaf(node, patient) {
                LeafOutcome::Pass => true,
                LeafOutcome::Fail => {
                    out.push(FailedCriterion {
                        node_id: node.id,
                        label: node.label.clone(),
                        reason: FailureReason::Unsatisfied,
                    });
                    false
                }
                LeafOutcome::Missing => {
                    out.push(FailedCriterion {
                        node_id: node.id,
                        label: node.label.clone(),
                        reason: FailureReason::MissingAttribute,
                    });
                    false
                }
            }
        }
        CriterionKind::BooleanOp { op, children } => match op {
            BoolOp::And => {
                let mut all_pass = true;
                for child in children {
                    if !eval_node(child, patient, out, exhaustive) {
                        all_pass = false;
                        if !exhaustive {
                            return false;
                        }
                    }
                }
                all_pass
            }
            BoolOp::Or => {
                let mut scratch = Vec::new();
                let mut any_pass = false;
                for child in children {
                    if eval_node(child, patient, &mut scratch, exhaustive) {
                        any_pass = true;
                        if !exhaustive {
                            break;
                        }
                    }
                }
                if !any_pass {
                    out.append(&mut scratch);
                }
                any_pass
            }
            BoolOp::Not => {
                let child = &children[0];
                let mut scratch = Vec::new();
                let child_pass = eval_node(child, patient, &mut scratch, exhaustive);
                if child_pass {
                    // The negated group matched: report the triggering
                    // criteria themselves, not the bare Not wrapper.
                    let mut triggered = Vec::new();
                    collect_satisfied_leaves(child, patient, &mut triggered);
                    if !exhaustive {
                        triggered.truncate(1);
                    }
                    if triggered.is_empty() {
                        triggered.push(FailedCriterion {
                            node_id: node.id,
                            label: node.label.clone(),
                            reason: FailureReason::Unsatisfied,
                        });
                    }
                    out.append(&mut triggered);
                }
                !child_pass
            }
        },
    }
}

/// Push every individually satisfied leaf under `node`, pre-order, with
/// reason [`FailureReason::Excluded`].
fn collect_satisfied_leaves(node: &CriterionNode, patient: &Patient, out: &mut Vec<FailedCriterion>) {
    match &node.kind {
        CriterionKind::BooleanOp { children, .. } => {
            for child in children {
                collect_satisfied_leaves(child, patient, out);
            }
        }
        _ => {
            if matches!(eval_leaf(node, patient), LeafOutcome::Pass) {
                out.push(FailedCriterion {
                    node_id: node.id,
                    label: node.label.clone(),
                    reason: FailureReason::Excluded,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::CriterionNode;
    use crate::schema::{AttributeSchema, AttributeSpec};
    use std::collections::BTreeMap;

    fn schema() -> AttributeSchema {
        let mut s = AttributeSchema::new();
        s.insert("age", AttributeSpec::numeric_uniform(18.0, 90.0))
            .insert(
                "ebv_status",
                AttributeSpec::categorical(vec!["negative", "positive"], vec![0.5, 0.5]),
            )
            .insert("diabetic", AttributeSpec::boolean(0.1));
        s
    }

    fn patient(age: f64, ebv: &str, diabetic: bool) -> Patient {
        let mut attrs = BTreeMap::new();
        attrs.insert("age".to_string(), AttributeValue::Numeric(age));
        attrs.insert(
            "ebv_status".to_string(),
            AttributeValue::Categorical(ebv.to_string()),
        );
        attrs.insert("diabetic".to_string(), AttributeValue::Boolean(diabetic));
        Patient::from_attributes(1, attrs)
    }

    fn trial_ast() -> CriteriaAst {
        // age between 18 and 45, diabetic, and not EBV positive
        let root = CriterionNode::and(
            "eligibility",
            vec![
                CriterionNode::comparison(
                    "age between 18 and 45",
                    "age",
                    ComparisonOp::Between,
                    CriterionValue::Range(18.0, 45.0),
                ),
                CriterionNode::comparison(
                    "diabetic == true",
                    "diabetic",
                    ComparisonOp::Eq,
                    CriterionValue::Flag(true),
                ),
                CriterionNode::not(
                    "no exclusion",
                    CriterionNode::or(
                        "any exclusion",
                        vec![CriterionNode::comparison(
                            "ebv_status == positive",
                            "ebv_status",
                            ComparisonOp::Eq,
                            CriterionValue::Text("positive".to_string()),
                        )],
                    ),
                ),
            ],
        );
        CriteriaAst::new(root, &schema()).unwrap()
    }

    #[test]
    fn test_pass() {
        let result = evaluate(&trial_ast(), &patient(30.0, "negative", true));
        assert!(result.passed);
        assert!(result.failing_criteria.is_empty());
    }

    #[test]
    fn test_and_short_circuit_retains_first_failure() {
        // Both age and diabetic fail; short-circuit reports only age
        let result = evaluate(&trial_ast(), &patient(70.0, "negative", false));
        assert!(!result.passed);
        assert_eq!(result.failing_criteria.len(), 1);
        assert_eq!(result.failing_criteria[0].label, "age between 18 and 45");
        assert_eq!(result.failing_criteria[0].reason, FailureReason::Unsatisfied);
    }

    #[test]
    fn test_exhaustive_reports_all_failures() {
        let result = evaluate_exhaustive(&trial_ast(), &patient(70.0, "positive", false));
        assert!(!result.passed);
        let labels: Vec<&str> = result
            .failing_criteria
            .iter()
            .map(|f| f.label.as_str())
            .collect();
        assert_eq!(
            labels,
            vec![
                "age between 18 and 45",
                "diabetic == true",
                "ebv_status == positive"
            ]
        );
    }

    #[test]
    fn test_exclusion_reports_triggering_leaf() {
        let result = evaluate(&trial_ast(), &patient(30.0, "positive", true));
        assert!(!result.passed);
        assert_eq!(result.failing_criteria.len(), 1);
        assert_eq!(result.failing_criteria[0].label, "ebv_status == positive");
        assert_eq!(result.failing_criteria[0].reason, FailureReason::Excluded);
    }

    #[test]
    fn test_missing_attribute_is_failing_criterion() {
        let mut attrs = BTreeMap::new();
        attrs.insert("age".to_string(), AttributeValue::Numeric(30.0));
        // diabetic and ebv_status absent
        let sparse = Patient::from_attributes(2, attrs);

        let result = evaluate(&trial_ast(), &sparse);
        assert!(!result.passed);
        assert_eq!(result.failing_criteria[0].reason, FailureReason::MissingAttribute);
        assert_eq!(result.failing_criteria[0].label, "diabetic == true");
    }

    #[test]
    fn test_between_is_inclusive() {
        for age in [18.0, 45.0] {
            let result = evaluate(&trial_ast(), &patient(age, "negative", true));
            assert!(result.passed, "age {} should be inside the closed interval", age);
        }
        let result = evaluate(&trial_ast(), &patient(45.01, "negative", true));
        assert!(!result.passed);
    }

    #[test]
    fn test_accept_all() {
        let result = evaluate(&CriteriaAst::accept_all(), &patient(99.0, "positive", false));
        assert!(result.passed);
    }

    #[test]
    fn test_failing_order_is_preorder() {
        let result = evaluate_exhaustive(&trial_ast(), &patient(70.0, "positive", false));
        let ids: Vec<_> = result.failing_criteria.iter().map(|f| f.node_id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted, "failures must follow pre-order node ids");
    }
}
