use anyhow::{bail, Context};
use csv::Writer;
use nalgebra::DVector;
use std::path::Path;

use crate::eval::{self, DvhCurve};
use crate::optim::correction::CorrectionStep;
use crate::optim::Solution;
use crate::plan::Plan;

/// Writes cumulative DVH tables for the named structures, one row per
/// sampled dose point. The plot itself happens outside this crate.
pub fn write_dvh_csv<P: AsRef<Path>>(
    path: P,
    plan: &Plan,
    dose_1d: &DVector<f64>,
    struct_names: &[String],
    bins: usize,
) -> anyhow::Result<()> {
    let mut curves: Vec<DvhCurve> = Vec::with_capacity(struct_names.len());
    for name in struct_names {
        let structure = plan.structures.require(name)?;
        curves.push(eval::dvh(dose_1d, structure, bins)?);
    }

    let mut wtr =
        Writer::from_path(&path).with_context(|| format!("failed to create {:?}", path.as_ref()))?;
    wtr.write_record(["structure", "dose_gy", "volume_pct"])?;
    for curve in &curves {
        for (d, v) in curve.dose_gy.iter().zip(&curve.volume_pct) {
            wtr.write_record(&[curve.structure.clone(), d.to_string(), v.to_string()])?;
        }
    }
    wtr.flush()?;
    Ok(())
}

/// Writes labeled per-voxel dose vectors side by side, for inspecting the
/// discrepancy between dose models (sparse, full, imported).
pub fn write_dose_comparison_csv<P: AsRef<Path>>(
    path: P,
    doses: &[(&str, &DVector<f64>)],
) -> anyhow::Result<()> {
    if doses.is_empty() {
        bail!("no dose vectors to write");
    }
    let len = doses[0].1.len();
    for (label, dose) in doses {
        if dose.len() != len {
            bail!(
                "dose column {:?} has {} voxels, expected {}",
                label,
                dose.len(),
                len
            );
        }
    }

    let mut wtr =
        Writer::from_path(&path).with_context(|| format!("failed to create {:?}", path.as_ref()))?;
    let mut header = vec!["voxel_idx".to_string()];
    header.extend(doses.iter().map(|(label, _)| (*label).to_string()));
    wtr.write_record(&header)?;

    for v in 0..len {
        let mut record = vec![v.to_string()];
        record.extend(doses.iter().map(|(_, dose)| dose[v].to_string()));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes the optimal beamlet intensities of a solution.
pub fn write_intensity_csv<P: AsRef<Path>>(path: P, sol: &Solution) -> anyhow::Result<()> {
    let mut wtr =
        Writer::from_path(&path).with_context(|| format!("failed to create {:?}", path.as_ref()))?;
    wtr.write_record(["beamlet_idx", "intensity"])?;
    for (i, x) in sol.optimal_intensity.iter().enumerate() {
        wtr.write_record(&[i.to_string(), x.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes the per-iteration diagnostics of a correction run.
pub fn write_correction_history_csv<P: AsRef<Path>>(
    path: P,
    history: &[CorrectionStep],
) -> anyhow::Result<()> {
    let mut wtr =
        Writer::from_path(&path).with_context(|| format!("failed to create {:?}", path.as_ref()))?;
    wtr.write_record([
        "iteration",
        "objective_value",
        "norm_factor_sparse",
        "norm_factor_full",
        "max_abs_delta",
        "mean_abs_delta",
    ])?;
    for step in history {
        wtr.write_record(&[
            step.iteration.to_string(),
            step.objective_value.to_string(),
            step.norm_factor_sparse.to_string(),
            step.norm_factor_full.to_string(),
            step.max_abs_delta.to_string(),
            step.mean_abs_delta.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
