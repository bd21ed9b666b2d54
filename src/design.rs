//! Candidate trial design scoring.
//!
//! Scores alternative designs by combining approximate statistical power
//! with an operational feasibility penalty, then picks a small, diverse
//! set of candidates from a seeded pool. Intended as planning support for
//! a principal investigator, not as a substitute for a statistical
//! analysis plan.

use crate::protocol::ProtocolSummary;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

/// Assumed standardized effect size when the protocol gives no estimate
pub const DEFAULT_EFFECT_SIZE: f64 = 0.4;

const POWER_WEIGHT: f64 = 0.6;
const FEASIBILITY_WEIGHT: f64 = 0.4;

/// One candidate trial design
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignCandidate {
    pub sample_size: usize,
    /// How many eligibility criteria are relaxed (0..=2)
    pub looseness: u8,
    pub randomization_ratio: f64,
    pub score: f64,
}

/// Standard normal CDF via the Abramowitz-Stegun erf approximation
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

fn erf(x: f64) -> f64 {
    // Abramowitz & Stegun 7.1.26, |error| < 1.5e-7
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();
    sign * y
}

/// Standard normal quantile by bisection on [`normal_cdf`]
fn normal_quantile(p: f64) -> f64 {
    let (mut lo, mut hi) = (-8.0, 8.0);
    for _ in 0..80 {
        let mid = 0.5 * (lo + hi);
        if normal_cdf(mid) < p {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Approximate power of a two-sample comparison with equal group sizes.
///
/// Normal approximation: power = Phi(es * sqrt(n/2) - z_{1-alpha/2}),
/// ignoring the negligible lower rejection tail.
pub fn power_two_sample(effect_size: f64, n_per_group: usize, alpha: f64) -> f64 {
    if n_per_group == 0 {
        return 0.0;
    }
    let z_crit = normal_quantile(1.0 - alpha / 2.0);
    let ncp = effect_size * (n_per_group as f64 / 2.0).sqrt();
    normal_cdf(ncp - z_crit).clamp(0.0, 1.0)
}

/// Combined design score: weighted power plus operational feasibility.
///
/// Feasibility decreases with total sample size and with how loose the
/// eligibility criteria have been made.
pub fn score_design(sample_size: usize, looseness: u8, effect_size: f64) -> f64 {
    let n_per_group = (sample_size / 2).max(2);
    let power = power_two_sample(effect_size, n_per_group, 0.05);

    let feasibility =
        (1.0 - sample_size as f64 / 2000.0 - f64::from(looseness) * 0.1).clamp(0.0, 1.0);

    POWER_WEIGHT * power + FEASIBILITY_WEIGHT * feasibility
}

/// Generate a seeded candidate pool around the protocol's sample size and
/// return the `pick_k` best score-diverse designs, best first.
pub fn optimize_design(
    summary: &ProtocolSummary,
    pool_size: usize,
    pick_k: usize,
    seed: u64,
) -> Vec<DesignCandidate> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let base_n = summary.sample_size.unwrap_or(200) as i64;
    let delta = (base_n as f64 * 0.2) as i64;

    let ratios = [1.0, 1.5, 2.0];
    let mut pool: Vec<DesignCandidate> = (0..pool_size)
        .map(|_| {
            let sample_size = (base_n + rng.gen_range(-delta..=delta)).max(20) as usize;
            let looseness = rng.gen_range(0..=2u8);
            let randomization_ratio = ratios[rng.gen_range(0..ratios.len())];
            DesignCandidate {
                sample_size,
                looseness,
                randomization_ratio,
                score: score_design(sample_size, looseness, DEFAULT_EFFECT_SIZE),
            }
        })
        .collect();

    pool.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut selected = pick_diverse(&pool, pick_k);
    selected.sort_by(|a, b| b.score.total_cmp(&a.score));
    selected
}

/// Greedy max-min selection in normalized candidate space: start from the
/// best-scoring design, then repeatedly take the candidate farthest from
/// everything already selected.
fn pick_diverse(pool: &[DesignCandidate], pick_k: usize) -> Vec<DesignCandidate> {
    if pool.is_empty() || pick_k == 0 {
        return Vec::new();
    }

    let coords = |c: &DesignCandidate| {
        [
            c.sample_size as f64 / 2000.0,
            f64::from(c.looseness) / 2.0,
            c.randomization_ratio / 2.0,
        ]
    };
    let dist = |a: &DesignCandidate, b: &DesignCandidate| {
        coords(a)
            .iter()
            .zip(coords(b).iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f64>()
            .sqrt()
    };

    let mut picked: Vec<usize> = vec![0];
    while picked.len() < pick_k.min(pool.len()) {
        let mut best: Option<(usize, f64)> = None;
        for (i, candidate) in pool.iter().enumerate() {
            if picked.contains(&i) {
                continue;
            }
            let min_dist = picked
                .iter()
                .map(|&s| dist(candidate, &pool[s]))
                .fold(f64::INFINITY, f64::min);
            if best.map_or(true, |(_, d)| min_dist > d) {
                best = Some((i, min_dist));
            }
        }
        match best {
            Some((i, _)) => picked.push(i),
            None => break,
        }
    }
    picked.into_iter().map(|i| pool[i].clone()).collect()
}
