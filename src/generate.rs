//! Synthetic cohort generation.
//!
//! Patients are sampled attribute-by-attribute from the schema's
//! distributions. Generation is a pure function of (schema, count,
//! constraint, mode, seed): the same seed always reproduces the same
//! cohort, enabling exact trial replays. Constrained modes use rejection
//! sampling under an explicit draw budget so generation can fail fast
//! instead of looping forever on an infeasible constraint.

use crate::criteria::{CriteriaAst, NodeId};
use crate::eval::{evaluate, evaluate_exhaustive};
use crate::patient::{AttributeValue, Patient, PatientId};
use crate::schema::{AttributeSchema, AttributeSpec, Distribution};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fs::File;
use std::io::Write;
use thiserror::Error;
use tracing::debug;

/// How a supplied constraint shapes the cohort
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    /// Sample straight from the distributions
    Unconstrained,
    /// Keep only patients that pass the constraint
    Satisfying,
    /// Keep only patients that break exactly one criterion
    Violating,
}

/// Generator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Draw budget per requested patient in constrained modes
    pub budget_multiplier: usize,

    /// In violating mode, require the single broken criterion to be this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<NodeId>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            budget_multiplier: 50,
            target_node: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerateError {
    #[error("constraint infeasible: accepted {accepted}/{requested} patients after {draws} draws")]
    InfeasibleConstraint {
        requested: usize,
        accepted: usize,
        draws: usize,
    },

    #[error("{mode:?} generation requires a constraint")]
    MissingConstraint { mode: GenerationMode },
}

/// Seeded synthetic patient generator over an attribute schema
pub struct PatientGenerator<'a> {
    schema: &'a AttributeSchema,
    config: GeneratorConfig,
}

impl<'a> PatientGenerator<'a> {
    pub fn new(schema: &'a AttributeSchema) -> Self {
        Self {
            schema,
            config: GeneratorConfig::default(),
        }
    }

    pub fn with_config(schema: &'a AttributeSchema, config: GeneratorConfig) -> Self {
        Self { schema, config }
    }

    /// Generate `count` patients.
    ///
    /// Constrained modes evaluate each candidate against `constraint` and
    /// reject until the cohort is filled or the draw budget
    /// (`budget_multiplier x count`) is exhausted.
    pub fn generate(
        &self,
        count: usize,
        constraint: Option<&CriteriaAst>,
        mode: GenerationMode,
        seed: u64,
    ) -> Result<Vec<Patient>, GenerateError> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);

        if mode == GenerationMode::Unconstrained {
            return Ok((0..count).map(|id| self.sample_one(id, &mut rng)).collect());
        }

        let Some(ast) = constraint else {
            return Err(GenerateError::MissingConstraint { mode });
        };

        let budget = self.config.budget_multiplier.saturating_mul(count).max(count);
        let mut cohort: Vec<Patient> = Vec::with_capacity(count);
        let mut draws = 0;

        while cohort.len() < count && draws < budget {
            let candidate = self.sample_one(cohort.len(), &mut rng);
            draws += 1;

            let keep = match mode {
                GenerationMode::Unconstrained => unreachable!("handled above"),
                GenerationMode::Satisfying => evaluate(ast, &candidate).passed,
                GenerationMode::Violating => {
                    let result = evaluate_exhaustive(ast, &candidate);
                    !result.passed
                        && result.failing_criteria.len() == 1
                        && self
                            .config
                            .target_node
                            .map_or(true, |t| result.failing_criteria[0].node_id == t)
                }
            };
            if keep {
                cohort.push(candidate);
            }
        }

        debug!(
            requested = count,
            accepted = cohort.len(),
            draws,
            ?mode,
            "rejection sampling finished"
        );

        if cohort.len() < count {
            return Err(GenerateError::InfeasibleConstraint {
                requested: count,
                accepted: cohort.len(),
                draws,
            });
        }
        Ok(cohort)
    }

    /// Sample a single patient from the current RNG position.
    ///
    /// This is the streaming form used by the trial simulator's enrollment
    /// loop, which screens candidates one at a time against its own budget.
    pub fn sample_one(&self, id: PatientId, rng: &mut ChaCha20Rng) -> Patient {
        let mut attributes = BTreeMap::new();
        for (name, spec) in self.schema.iter() {
            attributes.insert(name.clone(), sample_value(spec, rng));
        }
        Patient::from_attributes(id, attributes)
    }
}

fn sample_value(spec: &AttributeSpec, rng: &mut ChaCha20Rng) -> AttributeValue {
    match &spec.distribution {
        Distribution::Uniform { min, max } => {
            let v = if max > min {
                rng.gen_range(*min..=*max)
            } else {
                *min
            };
            AttributeValue::Numeric(v)
        }
        Distribution::Normal { mean, sd } => {
            let mut v = mean + sd * standard_normal(rng);
            if let Some([lo, hi]) = spec.range {
                v = v.clamp(lo, hi);
            }
            AttributeValue::Numeric(v)
        }
        Distribution::Categorical { categories, weights } => {
            let total: f64 = weights.iter().sum();
            let mut x = rng.gen::<f64>() * total;
            for (category, weight) in categories.iter().zip(weights.iter()) {
                if x < *weight {
                    return AttributeValue::Categorical(category.clone());
                }
                x -= weight;
            }
            AttributeValue::Categorical(categories.last().cloned().unwrap_or_default())
        }
        Distribution::Bernoulli { p } => AttributeValue::Boolean(rng.gen::<f64>() < *p),
    }
}

/// Box-Muller transform for a standard normal draw
fn standard_normal(rng: &mut ChaCha20Rng) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>(); // (0, 1], keeps ln finite
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Write a cohort to CSV: patient_id column plus one column per schema
/// attribute, `NA` for attributes a record does not carry.
pub fn write_cohort_csv(
    path: &str,
    patients: &[Patient],
    schema: &AttributeSchema,
) -> std::io::Result<()> {
    let mut file = File::create(path)?;

    let names: Vec<&String> = schema.names().collect();
    write!(file, "patient_id")?;
    for name in &names {
        write!(file, ",{}", name)?;
    }
    writeln!(file)?;

    for patient in patients {
        write!(file, "P{:04}", patient.id + 1)?;
        for name in &names {
            match patient.get(name) {
                Some(value) => write!(file, ",{}", value)?,
                None => write!(file, ",NA")?,
            }
        }
        writeln!(file)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{ComparisonOp, CriterionNode, CriterionValue};
    use crate::schema::AttributeSpec;

    fn schema() -> AttributeSchema {
        let mut s = AttributeSchema::new();
        s.insert("age", AttributeSpec::numeric_uniform(18.0, 90.0))
            .insert("diabetic", AttributeSpec::boolean(0.4))
            .insert(
                "sex",
                AttributeSpec::categorical(vec!["male", "female"], vec![0.48, 0.52]),
            )
            .insert("lab1", AttributeSpec::numeric_normal(100.0, 10.0, Some([50.0, 150.0])));
        s
    }

    #[test]
    fn test_same_seed_same_cohort() {
        let schema = schema();
        let gen = PatientGenerator::new(&schema);

        let a = gen.generate(20, None, GenerationMode::Unconstrained, 42).unwrap();
        let b = gen.generate(20, None, GenerationMode::Unconstrained, 42).unwrap();
        assert_eq!(a, b);

        let c = gen.generate(20, None, GenerationMode::Unconstrained, 43).unwrap();
        assert_ne!(a, c, "different seeds should differ");
    }

    #[test]
    fn test_samples_respect_domains() {
        let schema = schema();
        let gen = PatientGenerator::new(&schema);
        let cohort = gen.generate(100, None, GenerationMode::Unconstrained, 7).unwrap();

        for p in &cohort {
            let age = p.get("age").unwrap().as_numeric().unwrap();
            assert!((18.0..=90.0).contains(&age));
            let lab1 = p.get("lab1").unwrap().as_numeric().unwrap();
            assert!((50.0..=150.0).contains(&lab1), "normal draws are clamped");
            let sex = p.get("sex").unwrap().as_category().unwrap();
            assert!(sex == "male" || sex == "female");
        }
    }

    #[test]
    fn test_satisfying_mode_honors_constraint() {
        let schema = schema();
        let root = CriterionNode::and(
            "criteria",
            vec![
                CriterionNode::comparison("age >= 60", "age", ComparisonOp::Ge, CriterionValue::Number(60.0)),
                CriterionNode::comparison(
                    "diabetic == true",
                    "diabetic",
                    ComparisonOp::Eq,
                    CriterionValue::Flag(true),
                ),
            ],
        );
        let ast = CriteriaAst::new(root, &schema).unwrap();

        let gen = PatientGenerator::new(&schema);
        let cohort = gen.generate(30, Some(&ast), GenerationMode::Satisfying, 11).unwrap();

        assert_eq!(cohort.len(), 30);
        for p in &cohort {
            assert!(evaluate(&ast, p).passed);
        }
    }

    #[test]
    fn test_infeasible_constraint_fails_fast() {
        let schema = schema();
        // age >= 90 is satisfied by essentially no uniform draw over [18, 90]
        let root = CriterionNode::comparison(
            "age > 89.999",
            "age",
            ComparisonOp::Gt,
            CriterionValue::Number(89.999),
        );
        let ast = CriteriaAst::new(root, &schema).unwrap();

        let gen = PatientGenerator::with_config(
            &schema,
            GeneratorConfig {
                budget_multiplier: 10,
                target_node: None,
            },
        );
        match gen.generate(50, Some(&ast), GenerationMode::Satisfying, 3) {
            Err(GenerateError::InfeasibleConstraint { requested, draws, .. }) => {
                assert_eq!(requested, 50);
                assert_eq!(draws, 500);
            }
            other => panic!("Expected InfeasibleConstraint, got {:?}", other),
        }
    }

    #[test]
    fn test_violating_mode_breaks_exactly_one_criterion() {
        let schema = schema();
        let root = CriterionNode::and(
            "criteria",
            vec![
                CriterionNode::comparison("age >= 40", "age", ComparisonOp::Ge, CriterionValue::Number(40.0)),
                CriterionNode::comparison(
                    "diabetic == true",
                    "diabetic",
                    ComparisonOp::Eq,
                    CriterionValue::Flag(true),
                ),
            ],
        );
        let ast = CriteriaAst::new(root, &schema).unwrap();

        let gen = PatientGenerator::new(&schema);
        let cohort = gen.generate(25, Some(&ast), GenerationMode::Violating, 19).unwrap();

        for p in &cohort {
            let result = evaluate_exhaustive(&ast, p);
            assert!(!result.passed);
            assert_eq!(result.failing_criteria.len(), 1, "exactly one broken criterion");
        }
    }

    #[test]
    fn test_violating_mode_with_target_node() {
        let schema = schema();
        let root = CriterionNode::and(
            "criteria",
            vec![
                CriterionNode::comparison("age >= 40", "age", ComparisonOp::Ge, CriterionValue::Number(40.0)),
                CriterionNode::comparison(
                    "diabetic == true",
                    "diabetic",
                    ComparisonOp::Eq,
                    CriterionValue::Flag(true),
                ),
            ],
        );
        let ast = CriteriaAst::new(root, &schema).unwrap();
        let diabetic_node = ast.find(2).unwrap().id;

        let gen = PatientGenerator::with_config(
            &schema,
            GeneratorConfig {
                budget_multiplier: 200,
                target_node: Some(diabetic_node),
            },
        );
        let cohort = gen.generate(10, Some(&ast), GenerationMode::Violating, 23).unwrap();

        for p in &cohort {
            let result = evaluate_exhaustive(&ast, p);
            assert_eq!(result.failing_criteria.len(), 1);
            assert_eq!(result.failing_criteria[0].node_id, diabetic_node);
            // Everything else is compliant
            assert!(p.get("age").unwrap().as_numeric().unwrap() >= 40.0);
        }
    }

    #[test]
    fn test_constrained_mode_requires_constraint() {
        let schema = schema();
        let gen = PatientGenerator::new(&schema);
        assert!(matches!(
            gen.generate(5, None, GenerationMode::Satisfying, 1),
            Err(GenerateError::MissingConstraint { .. })
        ));
    }

    #[test]
    fn test_write_cohort_csv() {
        let schema = schema();
        let gen = PatientGenerator::new(&schema);
        let cohort = gen.generate(3, None, GenerationMode::Unconstrained, 5).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cohort.csv");
        write_cohort_csv(path.to_str().unwrap(), &cohort, &schema).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), "patient_id,age,diabetic,lab1,sex");
        assert_eq!(lines.count(), 3);
        assert!(content.starts_with("patient_id"));
    }
}
