pub mod correction;

use anyhow::{bail, Context};
use nalgebra::DVector;

use crate::data::protocol::ObjectiveKind;
use crate::plan::influence::SparseInfluence;
use crate::plan::Plan;

/// One dose-dependent penalty of the objective. Thresholds are per-fraction
/// Gy; voxel weights are the fractional volumes of the structure.
#[derive(Debug, Clone)]
enum TermKind {
    /// Penalizes dose above the threshold.
    Overdose { threshold_gy: f64 },
    /// Penalizes dose below the threshold (target coverage).
    Underdose { threshold_gy: f64 },
    /// Penalizes any dose (organ-at-risk sparing).
    Quadratic,
}

#[derive(Debug, Clone)]
struct DoseTerm {
    structure: String,
    weight: f64,
    kind: TermKind,
    voxels: Vec<(usize, f64)>,
    total_volume: f64,
}

/// Pairs of beamlet indices that are grid neighbors within one beam, used by
/// the smoothness penalty to keep fluence maps deliverable.
#[derive(Debug, Clone)]
struct SmoothnessTerm {
    weight: f64,
    pairs: Vec<(usize, usize)>,
}

/// The fluence optimization problem: objective terms assembled from the
/// protocol, the truncated influence matrix, and an optional per-voxel dose
/// correction. Solving it is delegated to a [`FluenceSolver`].
#[derive(Debug, Clone)]
pub struct FluenceProblem {
    influence: SparseInfluence,
    terms: Vec<DoseTerm>,
    smoothness: Option<SmoothnessTerm>,
    delta: Option<DVector<f64>>,
}

impl FluenceProblem {
    /// Builds the problem from the plan's protocol parameters. Every
    /// dose-dependent objective must name a structure present in the
    /// structure set.
    pub fn new(plan: &Plan) -> anyhow::Result<Self> {
        let mut terms = Vec::new();
        let mut smoothness: Option<SmoothnessTerm> = None;

        for obj in &plan.protocol.objective_functions {
            match obj.kind {
                ObjectiveKind::SmoothnessQuadratic => {
                    let pairs = neighbor_pairs(plan);
                    match &mut smoothness {
                        Some(s) => s.weight += obj.weight,
                        None => smoothness = Some(SmoothnessTerm { weight: obj.weight, pairs }),
                    }
                }
                kind => {
                    let name = obj
                        .structure_name
                        .as_deref()
                        .with_context(|| format!("objective {:?} names no structure", kind))?;
                    let structure = plan.structures.require(name)?;
                    let term_kind = match kind {
                        ObjectiveKind::QuadraticOverdose => TermKind::Overdose {
                            threshold_gy: threshold(obj.dose_per_fraction_gy, name)?,
                        },
                        ObjectiveKind::QuadraticUnderdose => TermKind::Underdose {
                            threshold_gy: threshold(obj.dose_per_fraction_gy, name)?,
                        },
                        ObjectiveKind::Quadratic => TermKind::Quadratic,
                        ObjectiveKind::SmoothnessQuadratic => unreachable!(),
                    };
                    terms.push(DoseTerm {
                        structure: name.to_string(),
                        weight: obj.weight,
                        kind: term_kind,
                        voxels: structure
                            .voxels
                            .iter()
                            .map(|v| (v.voxel_idx, v.volume_cc))
                            .collect(),
                        total_volume: structure.volume_cc(),
                    });
                }
            }
        }

        if terms.is_empty() {
            bail!("protocol defines no dose objectives");
        }

        Ok(Self {
            influence: plan.inf_matrix.clone(),
            terms,
            smoothness,
            delta: None,
        })
    }

    /// The same problem with a per-voxel correction folded into every
    /// dose-dependent term, so the optimizer sees `A x + delta` instead of
    /// `A x`. Used by the correction loop.
    pub fn with_correction(&self, delta: &DVector<f64>) -> anyhow::Result<Self> {
        if delta.len() != self.influence.num_voxels() {
            bail!(
                "correction vector has {} entries but the dose grid has {} voxels",
                delta.len(),
                self.influence.num_voxels()
            );
        }
        let mut corrected = self.clone();
        corrected.delta = Some(delta.clone());
        Ok(corrected)
    }

    pub fn num_beamlets(&self) -> usize {
        self.influence.num_beamlets()
    }

    pub fn num_voxels(&self) -> usize {
        self.influence.num_voxels()
    }

    pub fn influence(&self) -> &SparseInfluence {
        &self.influence
    }

    pub fn correction(&self) -> Option<&DVector<f64>> {
        self.delta.as_ref()
    }

    /// Per-fraction dose the problem scores against, correction included.
    pub fn dose(&self, intensity: &DVector<f64>) -> anyhow::Result<DVector<f64>> {
        let mut dose = self.influence.dose(intensity)?;
        if let Some(delta) = &self.delta {
            dose += delta;
        }
        Ok(dose)
    }

    /// Evaluates the objective at the given intensities. Negative
    /// intensities are rejected since the problem is bounded below by zero.
    pub fn objective(&self, intensity: &DVector<f64>) -> anyhow::Result<f64> {
        if intensity.iter().any(|v| *v < 0.0) {
            bail!("intensity vector has negative entries");
        }
        let dose = self.dose(intensity)?;

        let mut value = 0.0;
        for term in &self.terms {
            let mut acc = 0.0;
            for &(voxel, vol) in &term.voxels {
                let d = dose[voxel];
                let r = match term.kind {
                    TermKind::Overdose { threshold_gy } => (d - threshold_gy).max(0.0),
                    TermKind::Underdose { threshold_gy } => (threshold_gy - d).max(0.0),
                    TermKind::Quadratic => d,
                };
                acc += vol * r * r;
            }
            value += term.weight * acc / term.total_volume;
        }

        if let Some(smooth) = &self.smoothness {
            if !smooth.pairs.is_empty() {
                let mut acc = 0.0;
                for &(i, j) in &smooth.pairs {
                    let d = intensity[i] - intensity[j];
                    acc += d * d;
                }
                value += smooth.weight * acc / smooth.pairs.len() as f64;
            }
        }

        Ok(value)
    }
}

fn threshold(dose: Option<f64>, structure: &str) -> anyhow::Result<f64> {
    dose.with_context(|| {
        format!(
            "overdose/underdose objective for {:?} needs dose_per_fraction_gy",
            structure
        )
    })
}

fn neighbor_pairs(plan: &Plan) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for beam in &plan.beams.beams {
        for a in &beam.beamlets {
            for b in &beam.beamlets {
                let row_neighbor = a.row == b.row && b.col == a.col + 1;
                let col_neighbor = a.col == b.col && b.row == a.row + 1;
                if row_neighbor || col_neighbor {
                    pairs.push((a.idx, b.idx));
                }
            }
        }
    }
    pairs
}

/// Result of one solver invocation.
#[derive(Debug, Clone)]
pub struct Solution {
    pub optimal_intensity: DVector<f64>,
    pub objective_value: f64,
    pub solver: String,
}

/// Seam to the external optimization engine. The crate formulates the
/// problem; solving it is an external concern, so implementations wrap
/// whichever engine is available.
pub trait FluenceSolver {
    fn name(&self) -> &str;

    fn solve(&self, problem: &FluenceProblem) -> anyhow::Result<Solution>;
}

#[cfg(test)]
mod optim_tests {
    use super::*;
    use crate::utils::test_utils::synthetic_plan;
    use approx::assert_relative_eq;

    #[test]
    fn test_problem_dimensions() {
        let plan = synthetic_plan();
        let problem = FluenceProblem::new(&plan).unwrap();
        assert_eq!(problem.num_beamlets(), plan.beams.num_beamlets());
        assert_eq!(problem.num_voxels(), plan.inf_matrix.num_voxels());
    }

    #[test]
    fn test_objective_penalizes_underdose_at_zero() {
        let plan = synthetic_plan();
        let problem = FluenceProblem::new(&plan).unwrap();
        let zero = DVector::zeros(problem.num_beamlets());
        // with no fluence the target is fully underdosed
        assert!(problem.objective(&zero).unwrap() > 0.0);
    }

    #[test]
    fn test_objective_rejects_negative_intensity() {
        let plan = synthetic_plan();
        let problem = FluenceProblem::new(&plan).unwrap();
        let mut x = DVector::zeros(problem.num_beamlets());
        x[0] = -1.0;
        assert!(problem.objective(&x).is_err());
    }

    #[test]
    fn test_correction_shifts_dose() {
        let plan = synthetic_plan();
        let problem = FluenceProblem::new(&plan).unwrap();
        let x = DVector::from_element(problem.num_beamlets(), 1.0);
        let base = problem.dose(&x).unwrap();

        let delta = DVector::from_element(problem.num_voxels(), 0.25);
        let corrected = problem.with_correction(&delta).unwrap();
        let shifted = corrected.dose(&x).unwrap();
        for v in 0..problem.num_voxels() {
            assert_relative_eq!(shifted[v], base[v] + 0.25, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_correction_wrong_length() {
        let plan = synthetic_plan();
        let problem = FluenceProblem::new(&plan).unwrap();
        let delta = DVector::zeros(problem.num_voxels() + 1);
        assert!(problem.with_correction(&delta).is_err());
    }

    #[test]
    fn test_smoothness_penalizes_ragged_fluence() {
        let (meta, structures, beams, inf, mut protocol) =
            crate::utils::test_utils::synthetic_plan_parts();
        // isolate the smoothness component
        for obj in &mut protocol.objective_functions {
            if obj.kind != crate::data::protocol::ObjectiveKind::SmoothnessQuadratic {
                obj.weight = 0.0;
            }
        }
        let plan = crate::plan::Plan::new(meta, structures, beams, inf, protocol).unwrap();
        let problem = FluenceProblem::new(&plan).unwrap();

        let flat = DVector::from_element(problem.num_beamlets(), 1.0);
        let mut ragged = flat.clone();
        for i in (0..ragged.len()).step_by(2) {
            ragged[i] = 2.0;
        }
        assert_relative_eq!(problem.objective(&flat).unwrap(), 0.0, epsilon = 1e-12);
        assert!(problem.objective(&ragged).unwrap() > 0.0);
    }
}
