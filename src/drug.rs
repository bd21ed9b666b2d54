//! Drug response models and dosing schedules.
//!
//! A drug model maps a patient and a dosing schedule to a time series of
//! endpoint measurements. The simulator only sees the [`DrugModel`]
//! capability; concrete pharmacodynamic shapes form a closed set of named
//! variants selected explicitly through [`DrugModelKind`]. Models are
//! deterministic: population variability enters through the generated
//! patients, not through the response curve.

use crate::patient::{Patient, PatientId};
use serde::{Deserialize, Serialize};

/// One administration event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseEvent {
    /// Time offset from trial start
    pub time: f64,
    /// Dose amount [mg]
    pub amount: f64,
}

/// Time-indexed dosing plan plus measurement times
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DosingSchedule {
    pub doses: Vec<DoseEvent>,
    /// Times at which the endpoint is measured
    pub measure_times: Vec<f64>,
}

impl DosingSchedule {
    /// Build a schedule, sorting events and measurement times by time
    pub fn new(mut doses: Vec<DoseEvent>, mut measure_times: Vec<f64>) -> Self {
        doses.sort_by(|a, b| a.time.total_cmp(&b.time));
        measure_times.sort_by(f64::total_cmp);
        Self {
            doses,
            measure_times,
        }
    }

    /// Total dose administered at or before `time`
    pub fn cumulative_dose_at(&self, time: f64) -> f64 {
        self.doses
            .iter()
            .take_while(|d| d.time <= time)
            .map(|d| d.amount)
            .sum()
    }

    pub fn total_dose(&self) -> f64 {
        self.doses.iter().map(|d| d.amount).sum()
    }
}

/// One measured endpoint sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePoint {
    pub time: f64,
    pub value: f64,
}

/// Endpoint trajectory for one patient under one dosing schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrugResponseSeries {
    pub patient_id: PatientId,
    /// Pre-treatment endpoint value used for normalization
    pub baseline: f64,
    pub points: Vec<ResponsePoint>,
}

impl DrugResponseSeries {
    pub fn final_value(&self) -> Option<f64> {
        self.points.last().map(|p| p.value)
    }

    /// First non-finite sample, if any
    pub fn first_non_finite(&self) -> Option<&ResponsePoint> {
        if !self.baseline.is_finite() {
            return self.points.first();
        }
        self.points.iter().find(|p| !p.value.is_finite())
    }
}

/// Where a model reads its per-patient baseline from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineSpec {
    /// Patient attribute holding the baseline endpoint value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    /// Used when the attribute is absent from the record
    pub fallback: f64,
}

impl BaselineSpec {
    pub fn constant(value: f64) -> Self {
        Self {
            attribute: None,
            fallback: value,
        }
    }

    pub fn from_attribute(attribute: &str, fallback: f64) -> Self {
        Self {
            attribute: Some(attribute.to_string()),
            fallback,
        }
    }

    fn resolve(&self, patient: &Patient) -> f64 {
        self.attribute
            .as_deref()
            .and_then(|name| patient.get(name))
            .and_then(|v| v.as_numeric())
            .unwrap_or(self.fallback)
    }
}

/// Capability mapping patient + dosing schedule to a response series
pub trait DrugModel: Send + Sync {
    fn name(&self) -> &str;

    /// Pre-treatment endpoint value for this patient
    fn baseline(&self, patient: &Patient) -> f64;

    /// Simulate the endpoint trajectory over the schedule's measurement times
    fn respond(&self, patient: &Patient, schedule: &DosingSchedule) -> DrugResponseSeries;
}

/// Closed set of pharmacodynamic curve shapes, selected by configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum DrugModelKind {
    /// Identity response: endpoint stays at baseline (control model)
    ZeroEffect,
    /// Effect proportional to cumulative dose
    Linear { slope: f64 },
    /// Saturating Michaelis-Menten-style curve
    Emax { emax: f64, ec50: f64 },
    /// All-or-nothing effect once cumulative dose reaches `min_dose`
    Threshold { min_dose: f64, effect: f64 },
}

impl DrugModelKind {
    /// Instantiate the model with its baseline source
    pub fn build(&self, baseline: BaselineSpec) -> Box<dyn DrugModel> {
        match self.clone() {
            DrugModelKind::ZeroEffect => Box::new(CurveModel {
                name: "zero_effect",
                baseline,
                effect: EffectCurve::Zero,
            }),
            DrugModelKind::Linear { slope } => Box::new(CurveModel {
                name: "linear",
                baseline,
                effect: EffectCurve::Linear { slope },
            }),
            DrugModelKind::Emax { emax, ec50 } => Box::new(CurveModel {
                name: "emax",
                baseline,
                effect: EffectCurve::Emax { emax, ec50 },
            }),
            DrugModelKind::Threshold { min_dose, effect } => Box::new(CurveModel {
                name: "threshold",
                baseline,
                effect: EffectCurve::Threshold { min_dose, effect },
            }),
        }
    }
}

enum EffectCurve {
    Zero,
    Linear { slope: f64 },
    Emax { emax: f64, ec50: f64 },
    Threshold { min_dose: f64, effect: f64 },
}

impl EffectCurve {
    fn effect_at(&self, cumulative_dose: f64) -> f64 {
        match self {
            EffectCurve::Zero => 0.0,
            EffectCurve::Linear { slope } => slope * cumulative_dose,
            EffectCurve::Emax { emax, ec50 } => {
                emax * cumulative_dose / (ec50 + cumulative_dose)
            }
            EffectCurve::Threshold { min_dose, effect } => {
                if cumulative_dose >= *min_dose {
                    *effect
                } else {
                    0.0
                }
            }
        }
    }
}

struct CurveModel {
    name: &'static str,
    baseline: BaselineSpec,
    effect: EffectCurve,
}

impl DrugModel for CurveModel {
    fn name(&self) -> &str {
        self.name
    }

    fn baseline(&self, patient: &Patient) -> f64 {
        self.baseline.resolve(patient)
    }

    fn respond(&self, patient: &Patient, schedule: &DosingSchedule) -> DrugResponseSeries {
        let baseline = self.baseline(patient);
        let points = schedule
            .measure_times
            .iter()
            .map(|&time| ResponsePoint {
                time,
                value: baseline + self.effect.effect_at(schedule.cumulative_dose_at(time)),
            })
            .collect();
        DrugResponseSeries {
            patient_id: patient.id,
            baseline,
            points,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn patient_with_baseline(value: f64) -> Patient {
        let mut attrs = BTreeMap::new();
        attrs.insert(
            "tumor_burden".to_string(),
            crate::patient::AttributeValue::Numeric(value),
        );
        Patient::from_attributes(0, attrs)
    }

    fn schedule() -> DosingSchedule {
        DosingSchedule::new(
            vec![
                DoseEvent { time: 0.0, amount: 100.0 },
                DoseEvent { time: 28.0, amount: 100.0 },
            ],
            vec![0.0, 14.0, 28.0, 56.0],
        )
    }

    #[test]
    fn test_cumulative_dose() {
        let s = schedule();
        assert_eq!(s.cumulative_dose_at(0.0), 100.0);
        assert_eq!(s.cumulative_dose_at(14.0), 100.0);
        assert_eq!(s.cumulative_dose_at(28.0), 200.0);
        assert_eq!(s.total_dose(), 200.0);
    }

    #[test]
    fn test_zero_effect_stays_at_baseline() {
        let model = DrugModelKind::ZeroEffect
            .build(BaselineSpec::from_attribute("tumor_burden", 0.0));
        let series = model.respond(&patient_with_baseline(80.0), &schedule());

        assert_eq!(series.baseline, 80.0);
        for point in &series.points {
            assert_eq!(point.value, 80.0);
        }
    }

    #[test]
    fn test_linear_accumulates_with_dose() {
        let model = DrugModelKind::Linear { slope: -0.1 }
            .build(BaselineSpec::from_attribute("tumor_burden", 0.0));
        let series = model.respond(&patient_with_baseline(100.0), &schedule());

        // 100 mg by day 14 -> -10; 200 mg by day 56 -> -20
        assert_eq!(series.points[1].value, 90.0);
        assert_eq!(series.points[3].value, 80.0);
    }

    #[test]
    fn test_emax_saturates() {
        let curve = EffectCurve::Emax { emax: 50.0, ec50: 100.0 };
        let low = curve.effect_at(100.0);
        let high = curve.effect_at(10_000.0);
        assert!((low - 25.0).abs() < 1e-9, "half-maximal at ec50");
        assert!(high < 50.0 && high > 49.0, "approaches but never exceeds emax");
    }

    #[test]
    fn test_threshold_cutoff() {
        let curve = EffectCurve::Threshold { min_dose: 150.0, effect: -30.0 };
        assert_eq!(curve.effect_at(100.0), 0.0);
        assert_eq!(curve.effect_at(150.0), -30.0);
    }

    #[test]
    fn test_baseline_fallback() {
        let spec = BaselineSpec::from_attribute("missing_attr", 42.0);
        assert_eq!(spec.resolve(&patient_with_baseline(80.0)), 42.0);
    }
}
