use anyhow::Context;
use nalgebra::DVector;

use crate::eval;
use crate::optim::{FluenceProblem, FluenceSolver, Solution};
use crate::plan::influence::FullInfluence;
use crate::plan::Plan;

/// Settings of the dose correction loop. The defaults mirror the clinical
/// workflow: two passes, normalized so 90% of the PTV volume reaches the
/// prescription.
#[derive(Debug, Clone)]
pub struct CorrectionConfig {
    pub iterations: usize,
    pub norm_struct: String,
    pub norm_volume_pct: f64,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            iterations: 2,
            norm_struct: "PTV".to_string(),
            norm_volume_pct: 90.0,
        }
    }
}

/// Per-iteration diagnostics of the correction loop.
#[derive(Debug, Clone)]
pub struct CorrectionStep {
    pub iteration: usize,
    pub objective_value: f64,
    pub norm_factor_sparse: f64,
    pub norm_factor_full: f64,
    pub max_abs_delta: f64,
    pub mean_abs_delta: f64,
}

/// Outcome of the correction loop: the last corrected solution, the
/// accumulated per-voxel correction and the total-course dose estimates of
/// both matrix fidelities for that solution.
#[derive(Debug, Clone)]
pub struct CorrectionResult {
    pub solution: Solution,
    pub delta: DVector<f64>,
    pub dose_sparse_1d: DVector<f64>,
    pub dose_full_1d: DVector<f64>,
    pub history: Vec<CorrectionStep>,
}

/// Initial per-voxel correction: the discrepancy between the full and the
/// truncated dose model for one solution. Both doses are total-course and
/// get normalized to the reference dose-at-volume point before subtraction;
/// the result is scaled back to a per-fraction quantity.
pub fn initial_delta(
    plan: &Plan,
    dose_sparse_1d: &DVector<f64>,
    dose_full_1d: &DVector<f64>,
    cfg: &CorrectionConfig,
) -> anyhow::Result<DVector<f64>> {
    let structure = plan.structures.require(&cfg.norm_struct)?;
    let pres = plan.total_prescription_gy();

    let sparse_norm = eval::normalize(dose_sparse_1d, structure, cfg.norm_volume_pct, pres)
        .context("failed to normalize sparse dose")?;
    let full_norm = eval::normalize(dose_full_1d, structure, cfg.norm_volume_pct, pres)
        .context("failed to normalize full dose")?;

    Ok((full_norm - sparse_norm) / f64::from(plan.num_fractions()))
}

/// Runs the damped fixed-point correction.
///
/// Each pass re-solves the optimization with the accumulated correction
/// injected into the objective, recomputes both dose models for the new
/// solution, normalizes them to the reference point, and accumulates the
/// remaining discrepancy into the running correction. The iteration count is
/// a fixed user-set constant; there is no convergence test and solver
/// failures simply propagate.
pub fn run_correction<S: FluenceSolver>(
    plan: &Plan,
    problem: &FluenceProblem,
    inf_full: &FullInfluence,
    solver: &S,
    delta0: DVector<f64>,
    cfg: &CorrectionConfig,
) -> anyhow::Result<CorrectionResult> {
    let structure = plan.structures.require(&cfg.norm_struct)?;
    let pres = plan.total_prescription_gy();
    let fx = f64::from(plan.num_fractions());

    let mut accumulated = delta0;
    let mut last: Option<(Solution, DVector<f64>, DVector<f64>)> = None;
    let mut history = Vec::with_capacity(cfg.iterations);

    for iteration in 0..cfg.iterations {
        let corrected = problem.with_correction(&accumulated)?;
        let sol = solver
            .solve(&corrected)
            .with_context(|| format!("correction pass {} failed to solve", iteration))?;
        let x = &sol.optimal_intensity;

        // total-course dose under both fidelities; the sparse estimate
        // carries the correction the optimizer saw
        let dose_sparse_1d = (problem.influence().dose(x)? + &accumulated) * fx;
        let dose_full_1d = inf_full.dose(x)? * fx;

        let factor_sparse =
            eval::normalization_factor(&dose_sparse_1d, structure, cfg.norm_volume_pct, pres)
                .context("failed to normalize corrected sparse dose")?;
        let factor_full =
            eval::normalization_factor(&dose_full_1d, structure, cfg.norm_volume_pct, pres)
                .context("failed to normalize corrected full dose")?;

        let new_delta = (&dose_full_1d / factor_full - &dose_sparse_1d / factor_sparse) / fx;

        history.push(CorrectionStep {
            iteration,
            objective_value: sol.objective_value,
            norm_factor_sparse: factor_sparse,
            norm_factor_full: factor_full,
            max_abs_delta: new_delta.iter().fold(0.0f64, |m, v| m.max(v.abs())),
            mean_abs_delta: new_delta.iter().map(|v| v.abs()).sum::<f64>()
                / new_delta.len() as f64,
        });
        println!(
            "Correction pass {}: residual delta max {:.4} Gy/fx",
            iteration,
            history.last().map(|h| h.max_abs_delta).unwrap_or(0.0)
        );

        last = Some((sol, dose_sparse_1d, dose_full_1d));
        accumulated += new_delta;
    }

    let (solution, dose_sparse_1d, dose_full_1d) = match last {
        Some(parts) => parts,
        None => anyhow::bail!("correction loop configured with zero iterations"),
    };

    Ok(CorrectionResult {
        solution,
        delta: accumulated,
        dose_sparse_1d,
        dose_full_1d,
        history,
    })
}
