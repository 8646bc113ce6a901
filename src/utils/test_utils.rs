//! Synthetic fixtures: a small two-beam plan with a deliberate gap between
//! its sparse and full influence matrices, sized so the target sits near the
//! prescription at unit fluence.

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::path::Path;

use crate::data::protocol::Protocol;
use crate::data::{CtGrid, PatientMeta};
use crate::optim::{FluenceProblem, FluenceSolver, Solution};
use crate::plan::beams::{Beam, Beamlet, Beams, FluenceGrid};
use crate::plan::influence::{FullInfluence, InfluenceEntry, SparseInfluence};
use crate::plan::structures::{StructVoxel, Structure, StructureSet};
use crate::plan::Plan;

pub const NUM_VOXELS: usize = 12;
pub const NUM_BEAMLETS: usize = 6;

const PROTOCOL_JSON: &str = r#"{
    "protocol_name": "SYN_2Gy_30Fx",
    "pres_per_fraction_gy": 2.0,
    "num_of_fractions": 30,
    "objective_functions": [
        {"type": "quadratic-overdose", "structure_name": "PTV", "weight": 10000.0, "dose_per_fraction_gy": 2.0},
        {"type": "quadratic-underdose", "structure_name": "PTV", "weight": 100000.0, "dose_per_fraction_gy": 2.0},
        {"type": "quadratic", "structure_name": "CORD", "weight": 10.0},
        {"type": "smoothness-quadratic", "weight": 1000.0}
    ],
    "clinical_criteria": [
        {"type": "max_dose", "structure_name": "CORD", "limit_gy": 50.0}
    ]
}"#;

pub fn synthetic_protocol() -> Protocol {
    serde_json::from_str(PROTOCOL_JSON).unwrap()
}

pub fn synthetic_meta() -> PatientMeta {
    PatientMeta {
        patient_id: "SYN_001".to_string(),
        disease_site: "Lung".to_string(),
        ct: CtGrid {
            dims: [4, 4, 2],
            origin_mm: [0.0, 0.0, 0.0],
            spacing_mm: [2.5, 2.5, 3.0],
        },
        tcia_collection_id: None,
        tcia_subject_id: None,
    }
}

pub fn synthetic_structures() -> StructureSet {
    let voxels = |range: std::ops::Range<usize>, vol: f64| -> Vec<StructVoxel> {
        range
            .map(|voxel_idx| StructVoxel {
                voxel_idx,
                volume_cc: vol,
            })
            .collect()
    };
    StructureSet {
        structures: vec![
            Structure { name: "PTV".to_string(), voxels: voxels(0..6, 0.5) },
            Structure { name: "CORD".to_string(), voxels: voxels(6..10, 0.25) },
            Structure { name: "RING".to_string(), voxels: voxels(10..12, 1.0) },
        ],
    }
}

pub fn synthetic_beams() -> Beams {
    let grid = |rows, cols, oy| FluenceGrid {
        rows,
        cols,
        spacing_x_mm: 2.5,
        spacing_y_mm: 2.5,
        origin_x_mm: -2.5,
        origin_y_mm: oy,
    };
    Beams {
        beams: vec![
            Beam {
                id: 0,
                gantry_angle_deg: 0.0,
                collimator_angle_deg: 0.0,
                grid: grid(2, 2, -2.5),
                beamlets: vec![
                    Beamlet { idx: 0, row: 0, col: 0 },
                    Beamlet { idx: 1, row: 0, col: 1 },
                    Beamlet { idx: 2, row: 1, col: 0 },
                    Beamlet { idx: 3, row: 1, col: 1 },
                ],
            },
            Beam {
                id: 1,
                gantry_angle_deg: 180.0,
                collimator_angle_deg: 0.0,
                grid: grid(1, 2, 0.0),
                beamlets: vec![
                    Beamlet { idx: 4, row: 0, col: 0 },
                    Beamlet { idx: 5, row: 0, col: 1 },
                ],
            },
        ],
    }
}

/// Influence triplets for both fidelities, from one seeded pass so every
/// call reproduces the same matrices. The full matrix carries an extra
/// scatter floor the truncated one drops.
fn synthetic_entries() -> (Vec<InfluenceEntry>, Vec<InfluenceEntry>) {
    let mut rng = StdRng::seed_from_u64(42);
    let mut sparse = Vec::new();
    let mut full = Vec::new();
    for voxel in 0..NUM_VOXELS {
        for beamlet in 0..NUM_BEAMLETS {
            let base = if voxel < 6 {
                0.32
            } else if voxel < 10 {
                0.05
            } else {
                0.12
            };
            let primary = base * (0.9 + 0.2 * rng.random::<f64>());
            let scatter = 0.015 * (0.9 + 0.2 * rng.random::<f64>());
            // the truncated matrix keeps only the primary component, and
            // drops it entirely for half the non-target voxels
            let truncated = voxel < 6 || (voxel + beamlet) % 2 == 0;
            if truncated {
                sparse.push(InfluenceEntry { voxel, beamlet, value: primary });
            }
            full.push(InfluenceEntry {
                voxel,
                beamlet,
                value: primary + scatter,
            });
        }
    }
    (sparse, full)
}

pub fn synthetic_sparse_influence() -> SparseInfluence {
    let (sparse, _) = synthetic_entries();
    SparseInfluence::from_triplets(NUM_VOXELS, NUM_BEAMLETS, sparse).unwrap()
}

pub fn synthetic_full_influence() -> FullInfluence {
    let (_, full) = synthetic_entries();
    FullInfluence::from_triplets(NUM_VOXELS, NUM_BEAMLETS, full).unwrap()
}

pub fn synthetic_plan_parts() -> (PatientMeta, StructureSet, Beams, SparseInfluence, Protocol) {
    (
        synthetic_meta(),
        synthetic_structures(),
        synthetic_beams(),
        synthetic_sparse_influence(),
        synthetic_protocol(),
    )
}

pub fn synthetic_plan() -> Plan {
    let (meta, structures, beams, inf, protocol) = synthetic_plan_parts();
    Plan::new(meta, structures, beams, inf, protocol).unwrap()
}

/// Solver stand-in that always returns the same intensities, with the
/// objective evaluated through the problem. Keeps correction-loop tests
/// deterministic without an optimization engine.
#[derive(Debug, Clone)]
pub struct FixedSolver {
    intensity: DVector<f64>,
}

impl FixedSolver {
    pub fn new(intensity: Vec<f64>) -> Self {
        Self {
            intensity: DVector::from_vec(intensity),
        }
    }

    pub fn uniform(n: usize, value: f64) -> Self {
        Self {
            intensity: DVector::from_element(n, value),
        }
    }

    pub fn intensity(&self) -> DVector<f64> {
        self.intensity.clone()
    }
}

impl FluenceSolver for FixedSolver {
    fn name(&self) -> &str {
        "fixed"
    }

    fn solve(&self, problem: &FluenceProblem) -> anyhow::Result<Solution> {
        let objective_value = problem.objective(&self.intensity)?;
        Ok(Solution {
            optimal_intensity: self.intensity.clone(),
            objective_value,
            solver: self.name().to_string(),
        })
    }
}

/// Writes the synthetic patient as a curated data directory, for tests that
/// exercise the loading path end to end.
pub fn write_synthetic_patient_dir(root: &Path) -> anyhow::Result<()> {
    let patient_dir = root.join("SYN_001");
    std::fs::create_dir_all(&patient_dir)?;
    std::fs::create_dir_all(root.join("protocols"))?;

    let meta = synthetic_meta();
    let meta_json = format!(
        r#"{{"patient_id": "{}", "disease_site": "{}",
            "ct": {{"dims": [{}, {}, {}], "origin_mm": [0.0, 0.0, 0.0], "spacing_mm": [2.5, 2.5, 3.0]}}}}"#,
        meta.patient_id,
        meta.disease_site,
        meta.ct.dims[0],
        meta.ct.dims[1],
        meta.ct.dims[2]
    );
    std::fs::write(patient_dir.join("meta.json"), meta_json)?;
    std::fs::write(root.join("protocols").join("SYN_2Gy_30Fx.json"), PROTOCOL_JSON)?;

    let mut f = std::fs::File::create(patient_dir.join("structures.csv"))?;
    writeln!(f, "structure,voxel_idx,volume_cc")?;
    for s in &synthetic_structures().structures {
        for v in &s.voxels {
            writeln!(f, "{},{},{}", s.name, v.voxel_idx, v.volume_cc)?;
        }
    }

    let beams = synthetic_beams();
    let mut f = std::fs::File::create(patient_dir.join("beams.csv"))?;
    writeln!(
        f,
        "beam_id,gantry_angle_deg,collimator_angle_deg,rows,cols,spacing_x_mm,spacing_y_mm,origin_x_mm,origin_y_mm"
    )?;
    for b in &beams.beams {
        writeln!(
            f,
            "{},{},{},{},{},{},{},{},{}",
            b.id,
            b.gantry_angle_deg,
            b.collimator_angle_deg,
            b.grid.rows,
            b.grid.cols,
            b.grid.spacing_x_mm,
            b.grid.spacing_y_mm,
            b.grid.origin_x_mm,
            b.grid.origin_y_mm
        )?;
    }
    let mut f = std::fs::File::create(patient_dir.join("beamlets.csv"))?;
    writeln!(f, "beam_id,beamlet_idx,row,col")?;
    for b in &beams.beams {
        for bl in &b.beamlets {
            writeln!(f, "{},{},{},{}", b.id, bl.idx, bl.row, bl.col)?;
        }
    }

    // calc voxels walk the first CT slice row-major
    let mut f = std::fs::File::create(patient_dir.join("voxels.csv"))?;
    writeln!(f, "voxel_idx,i,j,k")?;
    for v in 0..NUM_VOXELS {
        writeln!(f, "{},{},{},{}", v, v % 4, v / 4, 0)?;
    }

    let (sparse, full) = synthetic_entries();
    for (name, entries) in [("influence_sparse.csv", &sparse), ("influence_full.csv", &full)] {
        let mut f = std::fs::File::create(patient_dir.join(name))?;
        writeln!(f, "voxel,beamlet,value")?;
        for e in entries {
            writeln!(f, "{},{},{}", e.voxel, e.beamlet, e.value)?;
        }
    }

    Ok(())
}
