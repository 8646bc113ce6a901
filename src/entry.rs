use anyhow::{anyhow, Context, Result};
use crossbeam::thread;
use nalgebra::DVector;
use serde::Deserialize;
use std::path::Path;

use crate::data::PatientData;
use crate::io::dose::{DoseGrid, VoxelMap};
use crate::io::fluence::write_eclipse_fluence;
use crate::io::output::{
    write_correction_history_csv, write_dose_comparison_csv, write_dvh_csv, write_intensity_csv,
};
use crate::optim::correction::{initial_delta, run_correction, CorrectionConfig, CorrectionResult};
use crate::optim::{FluenceProblem, FluenceSolver, Solution};
use crate::plan::influence::FullInfluence;
use crate::plan::Plan;

fn default_iterations() -> usize {
    2
}

fn default_norm_struct() -> String {
    "PTV".to_string()
}

fn default_norm_volume_pct() -> f64 {
    90.0
}

fn default_dvh_structures() -> Vec<String> {
    vec!["PTV".to_string()]
}

fn default_dvh_bins() -> usize {
    100
}

/// Correction-loop settings of the workflow config file.
#[derive(Debug, Clone, Deserialize)]
pub struct CorrectionSettings {
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default = "default_norm_struct")]
    pub norm_struct: String,
    #[serde(default = "default_norm_volume_pct")]
    pub norm_volume_pct: f64,
}

impl Default for CorrectionSettings {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            norm_struct: default_norm_struct(),
            norm_volume_pct: default_norm_volume_pct(),
        }
    }
}

impl CorrectionSettings {
    fn to_config(&self) -> CorrectionConfig {
        CorrectionConfig {
            iterations: self.iterations,
            norm_struct: self.norm_struct.clone(),
            norm_volume_pct: self.norm_volume_pct,
        }
    }
}

/// Workflow configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    pub data_dir: String,
    pub patient_id: String,
    pub protocol_name: String,
    pub output_dir: String,
    /// Overrides every smoothness-quadratic objective weight, the knob
    /// planners turn to keep monitor units reasonable.
    pub smoothness_weight: Option<f64>,
    #[serde(default = "default_dvh_structures")]
    pub dvh_structures: Vec<String>,
    #[serde(default = "default_dvh_bins")]
    pub dvh_bins: usize,
    #[serde(default)]
    pub correction: CorrectionSettings,
    /// Dose volume recalculated by the external system, already converted
    /// from DICOM RT-Dose by its exporter.
    pub external_dose_meta: Option<String>,
    pub external_dose_grid: Option<String>,
}

impl WorkflowConfig {
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read workflow config {:?}", path.as_ref()))?;
        let cfg: WorkflowConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse workflow config {:?}", path.as_ref()))?;
        Ok(cfg)
    }
}

/// Builds and solves the plan, then exports the optimal fluence together
/// with DVH and intensity tables. This is the state handed to the external
/// system for leaf sequencing and final dose calculation.
pub fn run_plan_workflow<S: FluenceSolver>(
    cfg: &WorkflowConfig,
    solver: &S,
) -> Result<(Plan, Solution)> {
    let data = PatientData::new(&cfg.data_dir, &cfg.patient_id)?;
    plan_and_export(&data, cfg, solver)
}

fn plan_and_export<S: FluenceSolver>(
    data: &PatientData,
    cfg: &WorkflowConfig,
    solver: &S,
) -> Result<(Plan, Solution)> {
    let mut protocol = data
        .load_protocol(&cfg.protocol_name)
        .with_context(|| format!("failed to load protocol {:?}", cfg.protocol_name))?;
    if let Some(weight) = cfg.smoothness_weight {
        protocol.set_smoothness_weight(weight);
    }

    let plan = Plan::load(data, protocol)?;
    let problem = FluenceProblem::new(&plan)?;

    println!("Solving fluence problem with {}", solver.name());
    let sol = solver.solve(&problem).context("fluence optimization failed")?;
    println!("Objective value: {:.4}", sol.objective_value);

    let out = Path::new(&cfg.output_dir);
    std::fs::create_dir_all(out)
        .with_context(|| format!("Could not create output directory: {:?}", out))?;
    write_eclipse_fluence(&plan, &sol, out.join("fluence"))?;

    let fx = f64::from(plan.num_fractions());
    let dose_1d = plan.inf_matrix.dose(&sol.optimal_intensity)? * fx;
    write_dvh_csv(
        out.join("dvh_sparse.csv"),
        &plan,
        &dose_1d,
        &cfg.dvh_structures,
        cfg.dvh_bins,
    )?;
    write_intensity_csv(out.join("optimal_intensity.csv"), &sol)?;

    Ok((plan, sol))
}

/// The full exchange workflow: plan and export as above, then quantify the
/// sparse/full model discrepancy, optionally compare against the dose
/// recalculated externally, run the correction loop and re-export the
/// corrected fluence for a final import.
pub fn run_correction_workflow<S: FluenceSolver>(
    cfg: &WorkflowConfig,
    solver: &S,
) -> Result<CorrectionResult> {
    let data = PatientData::new(&cfg.data_dir, &cfg.patient_id)?;
    let (plan, sol) = plan_and_export(&data, cfg, solver)?;
    let out = Path::new(&cfg.output_dir);

    let inf_full = FullInfluence::from_csv(
        data.influence_path(true),
        plan.inf_matrix.num_voxels(),
        plan.inf_matrix.num_beamlets(),
    )
    .with_context(|| format!("failed to load full influence matrix for {}", cfg.patient_id))?;

    let fx = f64::from(plan.num_fractions());
    let x = &sol.optimal_intensity;

    // both dose models for the uncorrected solution, one thread each
    let (dose_sparse_1d, dose_full_1d) = thread::scope(|s| -> Result<(DVector<f64>, DVector<f64>)> {
        let sparse_handle = s.spawn(|_| -> Result<DVector<f64>> {
            let dose = plan.inf_matrix.dose(x).context("sparse dose failed")?;
            Ok(dose * fx)
        });
        let full_handle = s.spawn(|_| -> Result<DVector<f64>> {
            let dose = inf_full.dose(x).context("full dose failed")?;
            Ok(dose * fx)
        });
        let sparse = sparse_handle.join().unwrap()?;
        let full = full_handle.join().unwrap()?;
        Ok((sparse, full))
    })
    .map_err(|panic_payload| anyhow!("Dose computation threads panicked: {:?}", panic_payload))??;

    write_dvh_csv(
        out.join("dvh_full.csv"),
        &plan,
        &dose_full_1d,
        &cfg.dvh_structures,
        cfg.dvh_bins,
    )?;

    // dose recalculated by the external system, if it has been exported
    if let (Some(meta_path), Some(grid_path)) = (&cfg.external_dose_meta, &cfg.external_dose_grid) {
        let grid = DoseGrid::from_files(meta_path, grid_path)?;
        grid.validate_against(&plan.meta.ct)
            .context("imported dose grid does not match the patient CT")?;
        let voxel_map = VoxelMap::from_csv(data.voxels_path(), plan.inf_matrix.num_voxels())?;
        let imported_dose_1d = voxel_map.dose_3d_to_1d(&grid)?;

        write_dvh_csv(
            out.join("dvh_imported.csv"),
            &plan,
            &imported_dose_1d,
            &cfg.dvh_structures,
            cfg.dvh_bins,
        )?;
        write_dose_comparison_csv(
            out.join("dose_comparison.csv"),
            &[
                ("imported", &imported_dose_1d),
                ("sparse", &dose_sparse_1d),
                ("full", &dose_full_1d),
            ],
        )?;
    }

    let corr_cfg = cfg.correction.to_config();
    let problem = FluenceProblem::new(&plan)?;
    let delta0 = initial_delta(&plan, &dose_sparse_1d, &dose_full_1d, &corr_cfg)?;
    println!(
        "Initial correction: max {:.4} Gy/fx over {} voxels",
        delta0.iter().fold(0.0f64, |m, v| m.max(v.abs())),
        delta0.len()
    );

    let result = run_correction(&plan, &problem, &inf_full, solver, delta0, &corr_cfg)?;

    write_eclipse_fluence(&plan, &result.solution, out.join("fluence_corrected"))?;
    write_dvh_csv(
        out.join("dvh_corrected_sparse.csv"),
        &plan,
        &result.dose_sparse_1d,
        &cfg.dvh_structures,
        cfg.dvh_bins,
    )?;
    write_dvh_csv(
        out.join("dvh_corrected_full.csv"),
        &plan,
        &result.dose_full_1d,
        &cfg.dvh_structures,
        cfg.dvh_bins,
    )?;
    write_correction_history_csv(out.join("correction_history.csv"), &result.history)?;

    Ok(result)
}
