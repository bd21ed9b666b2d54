//! Trial simulation.
//!
//! The simulator drives one run through the phases
//! `Configured -> Enrolling -> Dosing -> Measuring -> Aggregated`, with
//! `Failed` reachable from every non-terminal phase. Per-patient dosing and
//! measurement share no mutable state and run on a rayon worker pool;
//! results are collected by patient id and re-sorted into enrollment order
//! so aggregation never depends on completion order. Runs are cooperatively
//! cancellable: workers check a shared flag between patients.

use crate::criteria::CriteriaAst;
use crate::drug::{BaselineSpec, DosingSchedule, DrugModel, DrugModelKind, DrugResponseSeries};
use crate::eval::{evaluate, EligibilityResult};
use crate::generate::PatientGenerator;
use crate::patient::{Patient, PatientId};
use crate::schema::AttributeSchema;
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Simulation phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialPhase {
    Configured,
    Enrolling,
    Dosing,
    Measuring,
    Aggregated,
    Failed,
}

/// Immutable per-run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialConfig {
    pub enrollment_target: usize,

    /// Seed for candidate sampling; same seed replays the same run
    pub seed: u64,

    /// Screening draw budget per enrollment slot
    pub budget_multiplier: usize,

    /// Fractional reduction from baseline counting as clinical response
    pub response_threshold: f64,

    /// Fractional increase from baseline counting as an adverse event
    pub adverse_threshold: f64,

    pub schedule: DosingSchedule,
    pub drug_model: DrugModelKind,
    pub baseline: BaselineSpec,
}

impl TrialConfig {
    fn validate(&self) -> Result<(), SimulateError> {
        let fail = |reason: &str| {
            Err(SimulateError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.enrollment_target == 0 {
            return fail("enrollment_target must be positive");
        }
        if self.budget_multiplier == 0 {
            return fail("budget_multiplier must be positive");
        }
        if self.schedule.measure_times.is_empty() {
            return fail("dosing schedule has no measurement times");
        }
        if self.response_threshold <= 0.0 {
            return fail("response_threshold must be positive");
        }
        if self.adverse_threshold <= 0.0 {
            return fail("adverse_threshold must be positive");
        }
        Ok(())
    }
}

/// Classified outcome for one enrolled patient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Responder,
    NonResponder,
    AdverseEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientOutcome {
    pub patient_id: PatientId,
    pub baseline: f64,
    pub final_value: f64,
    /// Endpoint change relative to baseline (negative = improvement)
    pub effect: f64,
    pub outcome: Outcome,
}

/// Cohort-level summary statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortSummary {
    pub screened: usize,
    pub enrolled: usize,
    pub responders: usize,
    pub non_responders: usize,
    pub adverse_events: usize,
    /// Adverse-event discontinuations
    pub dropouts: usize,
    pub response_rate: f64,
    pub mean_effect: f64,
}

/// Complete, immutable record of one simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRun {
    pub run_id: Uuid,
    pub protocol: String,
    pub started_at: DateTime<Utc>,
    pub config: TrialConfig,
    /// Phase trace ending in the terminal phase
    pub phases: Vec<TrialPhase>,
    pub cohort: Vec<Patient>,
    /// Eligibility result for every screened candidate, enrolled or not
    pub screening: Vec<EligibilityResult>,
    pub series: Vec<DrugResponseSeries>,
    pub outcomes: Vec<PatientOutcome>,
    pub summary: CohortSummary,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimulateError {
    #[error("invalid trial configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("enrollment infeasible: enrolled {enrolled}/{target} after screening {screened} candidates")]
    EnrollmentInfeasible {
        target: usize,
        enrolled: usize,
        screened: usize,
    },

    #[error("simulation diverged for patient {patient_id} at t={time}: non-finite endpoint")]
    SimulationDiverged { patient_id: PatientId, time: f64 },

    #[error("simulation cancelled")]
    Cancelled,
}

/// Shared cancellation flag, checked by workers between patients
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Orchestrates enrollment, dosing, measurement, and aggregation
pub struct TrialSimulator<'a> {
    schema: &'a AttributeSchema,
    criteria: &'a CriteriaAst,
    config: TrialConfig,
}

impl<'a> TrialSimulator<'a> {
    pub fn new(schema: &'a AttributeSchema, criteria: &'a CriteriaAst, config: TrialConfig) -> Self {
        Self {
            schema,
            criteria,
            config,
        }
    }

    pub fn config(&self) -> &TrialConfig {
        &self.config
    }

    /// Run with the configured drug model variant
    pub fn run(&self, protocol: &str, cancel: &CancelFlag) -> Result<SimulationRun, SimulateError> {
        let model = self.config.drug_model.build(self.config.baseline.clone());
        self.run_with_model(protocol, model.as_ref(), cancel)
    }

    /// Run with an externally supplied drug model. The simulator only
    /// requires the [`DrugModel`] capability and is agnostic to the variant.
    pub fn run_with_model(
        &self,
        protocol: &str,
        model: &dyn DrugModel,
        cancel: &CancelFlag,
    ) -> Result<SimulationRun, SimulateError> {
        self.config.validate()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut phases = vec![TrialPhase::Configured];
        info!(%run_id, protocol, target = self.config.enrollment_target, "starting trial simulation");

        phases.push(TrialPhase::Enrolling);
        let (cohort, screening) = self.enroll(cancel)?;

        phases.push(TrialPhase::Dosing);
        let worker_results: Vec<Result<(DrugResponseSeries, PatientOutcome), SimulateError>> =
            cohort
                .par_iter()
                .map(|patient| {
                    if cancel.is_cancelled() {
                        return Err(SimulateError::Cancelled);
                    }
                    let series = model.respond(patient, &self.config.schedule);
                    if let Some(bad) = series.first_non_finite() {
                        return Err(SimulateError::SimulationDiverged {
                            patient_id: patient.id,
                            time: bad.time,
                        });
                    }
                    let outcome = classify(&series, &self.config);
                    Ok((series, outcome))
                })
                .collect();

        phases.push(TrialPhase::Measuring);
        let mut series = Vec::with_capacity(cohort.len());
        let mut outcomes = Vec::with_capacity(cohort.len());
        // Scan in cohort order so the surfaced error is deterministic even
        // though worker completion order is not.
        for result in worker_results {
            match result {
                Ok((s, o)) => {
                    series.push(s);
                    outcomes.push(o);
                }
                Err(e) => {
                    warn!(%run_id, error = %e, "trial simulation failed");
                    return Err(e);
                }
            }
        }
        series.sort_by_key(|s| s.patient_id);
        outcomes.sort_by_key(|o| o.patient_id);

        phases.push(TrialPhase::Aggregated);
        let summary = summarize(screening.len(), &outcomes);
        info!(
            %run_id,
            enrolled = summary.enrolled,
            response_rate = summary.response_rate,
            "trial simulation aggregated"
        );

        Ok(SimulationRun {
            run_id,
            protocol: protocol.to_string(),
            started_at,
            config: self.config.clone(),
            phases,
            cohort,
            screening,
            series,
            outcomes,
            summary,
        })
    }

    /// Screen generated candidates until the enrollment target is met or
    /// the feasibility budget is exhausted. Candidate ids are the screening
    /// sequence numbers, so every screened candidate is uniquely addressable
    /// in the diagnostics.
    fn enroll(
        &self,
        cancel: &CancelFlag,
    ) -> Result<(Vec<Patient>, Vec<EligibilityResult>), SimulateError> {
        let generator = PatientGenerator::new(self.schema);
        let mut rng = ChaCha20Rng::seed_from_u64(self.config.seed);

        let target = self.config.enrollment_target;
        let budget = self.config.budget_multiplier.saturating_mul(target).max(target);

        let mut cohort = Vec::with_capacity(target);
        let mut screening = Vec::new();

        while cohort.len() < target && screening.len() < budget {
            if cancel.is_cancelled() {
                return Err(SimulateError::Cancelled);
            }
            let candidate = generator.sample_one(screening.len(), &mut rng);
            let result = evaluate(self.criteria, &candidate);
            let passed = result.passed;
            screening.push(result);
            if passed {
                cohort.push(candidate);
            }
        }

        if cohort.len() < target {
            warn!(
                target,
                enrolled = cohort.len(),
                screened = screening.len(),
                "enrollment infeasible"
            );
            return Err(SimulateError::EnrollmentInfeasible {
                target,
                enrolled: cohort.len(),
                screened: screening.len(),
            });
        }

        info!(enrolled = cohort.len(), screened = screening.len(), "enrollment complete");
        Ok((cohort, screening))
    }
}

/// Endpoint delta relative to baseline, classified against the configured
/// thresholds. Falls back to the absolute delta when the baseline is zero.
fn classify(series: &DrugResponseSeries, config: &TrialConfig) -> PatientOutcome {
    let baseline = series.baseline;
    let final_value = series.final_value().unwrap_or(baseline);

    let effect = if baseline.abs() > f64::EPSILON {
        (final_value - baseline) / baseline.abs()
    } else {
        final_value - baseline
    };

    let outcome = if effect >= config.adverse_threshold {
        Outcome::AdverseEvent
    } else if effect <= -config.response_threshold {
        Outcome::Responder
    } else {
        Outcome::NonResponder
    };

    PatientOutcome {
        patient_id: series.patient_id,
        baseline,
        final_value,
        effect,
        outcome,
    }
}

fn summarize(screened: usize, outcomes: &[PatientOutcome]) -> CohortSummary {
    let enrolled = outcomes.len();
    let responders = outcomes.iter().filter(|o| o.outcome == Outcome::Responder).count();
    let adverse_events = outcomes
        .iter()
        .filter(|o| o.outcome == Outcome::AdverseEvent)
        .count();
    let non_responders = enrolled - responders - adverse_events;

    let response_rate = if enrolled > 0 {
        responders as f64 / enrolled as f64
    } else {
        0.0
    };
    let mean_effect = if enrolled > 0 {
        outcomes.iter().map(|o| o.effect).sum::<f64>() / enrolled as f64
    } else {
        0.0
    };

    CohortSummary {
        screened,
        enrolled,
        responders,
        non_responders,
        adverse_events,
        dropouts: adverse_events,
        response_rate,
        mean_effect,
    }
}
