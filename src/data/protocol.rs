use anyhow::Context;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;

/// Objective term kinds understood by the problem builder. Tags follow the
/// protocol config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ObjectiveKind {
    #[serde(rename = "quadratic-overdose")]
    QuadraticOverdose,
    #[serde(rename = "quadratic-underdose")]
    QuadraticUnderdose,
    #[serde(rename = "quadratic")]
    Quadratic,
    #[serde(rename = "smoothness-quadratic")]
    SmoothnessQuadratic,
}

/// One objective-function entry of a protocol config.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectiveParams {
    #[serde(rename = "type")]
    pub kind: ObjectiveKind,
    pub structure_name: Option<String>,
    pub weight: f64,
    /// Threshold dose in Gy per fraction, where the term uses one.
    pub dose_per_fraction_gy: Option<f64>,
}

/// Clinical evaluation criterion (max/mean dose caps, dose-volume points).
#[derive(Debug, Clone, Deserialize)]
pub struct ClinicalCriterion {
    #[serde(rename = "type")]
    pub kind: String,
    pub structure_name: String,
    pub limit_gy: Option<f64>,
    pub limit_volume_pct: Option<f64>,
}

/// Clinical protocol: prescription, fractionation, optimization
/// hyper-parameters and evaluation criteria, loaded from
/// `protocols/<name>.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct Protocol {
    pub protocol_name: String,
    pub pres_per_fraction_gy: f64,
    pub num_of_fractions: u32,
    pub objective_functions: Vec<ObjectiveParams>,
    #[serde(default)]
    pub clinical_criteria: Vec<ClinicalCriterion>,
}

impl Protocol {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::open(&path)
            .with_context(|| format!("failed to open protocol file {:?}", path.as_ref()))?;
        let protocol: Protocol = serde_json::from_reader(file)
            .with_context(|| format!("failed to parse protocol file {:?}", path.as_ref()))?;
        Ok(protocol)
    }

    /// Total prescription over all fractions, in Gy.
    pub fn total_prescription_gy(&self) -> f64 {
        self.pres_per_fraction_gy * f64::from(self.num_of_fractions)
    }

    /// Overrides the weight of every smoothness-quadratic term. Planners
    /// tune this to keep the monitor units of the delivered plan reasonable.
    pub fn set_smoothness_weight(&mut self, weight: f64) {
        for obj in &mut self.objective_functions {
            if obj.kind == ObjectiveKind::SmoothnessQuadratic {
                obj.weight = weight;
            }
        }
    }
}
