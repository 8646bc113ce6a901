use nalgebra::DVector;
use thiserror::Error;

use crate::plan::structures::Structure;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("structure {name} has no voxels")]
    EmptyStructure { name: String },
    #[error("structure {name} references voxel {voxel} outside dose vector of length {len}")]
    VoxelOutOfRange {
        name: String,
        voxel: usize,
        len: usize,
    },
    #[error("volume percentage {got} outside (0, 100]")]
    BadVolumePercent { got: f64 },
    #[error("dose at volume is zero, cannot normalize to {prescription_gy} Gy")]
    ZeroDose { prescription_gy: f64 },
}

/// Dose/volume samples of a cumulative DVH curve for one structure.
#[derive(Debug, Clone)]
pub struct DvhCurve {
    pub structure: String,
    pub dose_gy: Vec<f64>,
    pub volume_pct: Vec<f64>,
}

fn structure_doses(
    dose_1d: &DVector<f64>,
    structure: &Structure,
) -> Result<Vec<(f64, f64)>, EvalError> {
    if structure.voxels.is_empty() {
        return Err(EvalError::EmptyStructure {
            name: structure.name.clone(),
        });
    }
    let mut samples = Vec::with_capacity(structure.voxels.len());
    for v in &structure.voxels {
        if v.voxel_idx >= dose_1d.len() {
            return Err(EvalError::VoxelOutOfRange {
                name: structure.name.clone(),
                voxel: v.voxel_idx,
                len: dose_1d.len(),
            });
        }
        samples.push((dose_1d[v.voxel_idx], v.volume_cc));
    }
    Ok(samples)
}

/// D(v%): the dose received by at least `volume_pct` percent of the
/// structure volume. Linearly interpolated between sorted dose samples,
/// weighting each voxel by its fractional volume.
pub fn dose_at_volume(
    dose_1d: &DVector<f64>,
    structure: &Structure,
    volume_pct: f64,
) -> Result<f64, EvalError> {
    if !(volume_pct > 0.0 && volume_pct <= 100.0) {
        return Err(EvalError::BadVolumePercent { got: volume_pct });
    }
    let mut samples = structure_doses(dose_1d, structure)?;
    samples.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let total: f64 = samples.iter().map(|(_, v)| v).sum();
    let target = volume_pct / 100.0 * total;

    let mut cum = 0.0;
    let mut prev_dose = samples[0].0;
    for (dose, vol) in &samples {
        let next = cum + vol;
        if next >= target {
            // interpolate inside this voxel's volume slab
            let frac = if *vol > 0.0 { (target - cum) / vol } else { 1.0 };
            return Ok(prev_dose + (dose - prev_dose) * frac);
        }
        cum = next;
        prev_dose = *dose;
    }
    // only reachable when cumulative rounding of fractional volumes leaves
    // `cum` a few ulps short of `target` at 100%; the answer is then the
    // coldest sample
    Ok(samples.last().map(|(d, _)| *d).unwrap_or(0.0))
}

/// V(d): percentage of the structure volume receiving at least `dose_gy`.
pub fn volume_at_dose(
    dose_1d: &DVector<f64>,
    structure: &Structure,
    dose_gy: f64,
) -> Result<f64, EvalError> {
    let samples = structure_doses(dose_1d, structure)?;
    let total: f64 = samples.iter().map(|(_, v)| v).sum();
    let above: f64 = samples
        .iter()
        .filter(|(d, _)| *d >= dose_gy)
        .map(|(_, v)| v)
        .sum();
    Ok(above / total * 100.0)
}

/// Volume-weighted mean dose of the structure.
pub fn mean_dose(dose_1d: &DVector<f64>, structure: &Structure) -> Result<f64, EvalError> {
    let samples = structure_doses(dose_1d, structure)?;
    let total: f64 = samples.iter().map(|(_, v)| v).sum();
    let weighted: f64 = samples.iter().map(|(d, v)| d * v).sum();
    Ok(weighted / total)
}

pub fn max_dose(dose_1d: &DVector<f64>, structure: &Structure) -> Result<f64, EvalError> {
    let samples = structure_doses(dose_1d, structure)?;
    Ok(samples.iter().fold(f64::MIN, |m, (d, _)| m.max(*d)))
}

/// Scale factor that maps the given dose distribution onto the prescription
/// at the reference dose-at-volume point. Dividing the dose by this factor
/// makes D(volume_pct) of the structure equal `prescription_gy`.
pub fn normalization_factor(
    dose_1d: &DVector<f64>,
    structure: &Structure,
    volume_pct: f64,
    prescription_gy: f64,
) -> Result<f64, EvalError> {
    let d = dose_at_volume(dose_1d, structure, volume_pct)?;
    if d == 0.0 {
        return Err(EvalError::ZeroDose { prescription_gy });
    }
    Ok(d / prescription_gy)
}

/// Normalizes a dose distribution so the reference structure reaches the
/// prescription at the given volume percentile.
pub fn normalize(
    dose_1d: &DVector<f64>,
    structure: &Structure,
    volume_pct: f64,
    prescription_gy: f64,
) -> Result<DVector<f64>, EvalError> {
    let factor = normalization_factor(dose_1d, structure, volume_pct, prescription_gy)?;
    Ok(dose_1d / factor)
}

/// Samples the cumulative DVH of one structure at `bins + 1` evenly spaced
/// dose points from zero to the structure maximum.
pub fn dvh(
    dose_1d: &DVector<f64>,
    structure: &Structure,
    bins: usize,
) -> Result<DvhCurve, EvalError> {
    let d_max = max_dose(dose_1d, structure)?.max(0.0);
    let bins = bins.max(1);
    let mut dose_gy = Vec::with_capacity(bins + 1);
    let mut volume_pct = Vec::with_capacity(bins + 1);
    for i in 0..=bins {
        let d = d_max * i as f64 / bins as f64;
        dose_gy.push(d);
        volume_pct.push(volume_at_dose(dose_1d, structure, d)?);
    }
    Ok(DvhCurve {
        structure: structure.name.clone(),
        dose_gy,
        volume_pct,
    })
}

#[cfg(test)]
mod eval_tests {
    use super::*;
    use crate::plan::structures::StructVoxel;
    use approx::assert_relative_eq;

    fn uniform_structure(name: &str, voxels: &[usize]) -> Structure {
        Structure {
            name: name.to_string(),
            voxels: voxels
                .iter()
                .map(|&i| StructVoxel {
                    voxel_idx: i,
                    volume_cc: 1.0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_dose_at_volume_simple() {
        let dose = DVector::from_vec(vec![10.0, 20.0, 30.0, 40.0]);
        let s = uniform_structure("PTV", &[0, 1, 2, 3]);

        // 25% of the volume sees at least 40 Gy
        assert_relative_eq!(dose_at_volume(&dose, &s, 25.0).unwrap(), 40.0, epsilon = 1e-9);
        // the full volume sees at least 10 Gy
        assert_relative_eq!(
            dose_at_volume(&dose, &s, 100.0).unwrap(),
            10.0,
            epsilon = 1e-9
        );
        // half the volume: interpolated between the 2nd and 3rd sample
        let d50 = dose_at_volume(&dose, &s, 50.0).unwrap();
        assert!(d50 <= 40.0 && d50 >= 20.0);
    }

    #[test]
    fn test_dose_at_volume_respects_fractional_volumes() {
        let dose = DVector::from_vec(vec![10.0, 50.0]);
        let s = Structure {
            name: "PTV".into(),
            voxels: vec![
                StructVoxel { voxel_idx: 0, volume_cc: 9.0 },
                StructVoxel { voxel_idx: 1, volume_cc: 1.0 },
            ],
        };
        // the hot voxel is only 10% of the volume
        assert_relative_eq!(dose_at_volume(&dose, &s, 10.0).unwrap(), 50.0, epsilon = 1e-9);
        let d90 = dose_at_volume(&dose, &s, 90.0).unwrap();
        assert!(d90 < 50.0);
    }

    #[test]
    fn test_dose_at_full_volume_with_fractional_volumes() {
        // volumes of 0.1 do not sum exactly in binary, so the 100% point
        // exercises the coldest-sample boundary
        let dose = DVector::from_vec(vec![12.0, 34.0, 56.0, 7.0, 89.0, 21.0, 43.0]);
        let s = Structure {
            name: "PTV".into(),
            voxels: (0..7)
                .map(|i| StructVoxel { voxel_idx: i, volume_cc: 0.1 })
                .collect(),
        };
        assert_relative_eq!(dose_at_volume(&dose, &s, 100.0).unwrap(), 7.0, epsilon = 1e-9);
    }

    #[test]
    fn test_volume_mean_max() {
        let dose = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let s = uniform_structure("CORD", &[0, 1, 2, 3]);
        assert_relative_eq!(volume_at_dose(&dose, &s, 2.5).unwrap(), 50.0, epsilon = 1e-9);
        assert_relative_eq!(mean_dose(&dose, &s).unwrap(), 2.5, epsilon = 1e-9);
        assert_relative_eq!(max_dose(&dose, &s).unwrap(), 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_normalize_hits_prescription() {
        let dose = DVector::from_vec(vec![55.0, 57.0, 61.0, 66.0, 70.0]);
        let s = uniform_structure("PTV", &[0, 1, 2, 3, 4]);
        let pres = 60.0;

        let normalized = normalize(&dose, &s, 90.0, pres).unwrap();
        let d90 = dose_at_volume(&normalized, &s, 90.0).unwrap();
        assert_relative_eq!(d90, pres, epsilon = 1e-9);
    }

    #[test]
    fn test_dvh_monotone_and_bounded() {
        let dose = DVector::from_vec(vec![0.0, 10.0, 20.0, 30.0]);
        let s = uniform_structure("PTV", &[0, 1, 2, 3]);
        let curve = dvh(&dose, &s, 10).unwrap();
        assert_eq!(curve.dose_gy.len(), 11);
        assert_relative_eq!(curve.volume_pct[0], 100.0, epsilon = 1e-9);
        for w in curve.volume_pct.windows(2) {
            assert!(w[1] <= w[0] + 1e-12, "DVH must be non-increasing");
        }
    }

    #[test]
    fn test_out_of_range_voxel() {
        let dose = DVector::from_vec(vec![1.0]);
        let s = uniform_structure("PTV", &[3]);
        assert!(matches!(
            mean_dose(&dose, &s),
            Err(EvalError::VoxelOutOfRange { voxel: 3, .. })
        ));
    }

    #[test]
    fn test_bad_volume_percent() {
        let dose = DVector::from_vec(vec![1.0]);
        let s = uniform_structure("PTV", &[0]);
        assert!(matches!(
            dose_at_volume(&dose, &s, 0.0),
            Err(EvalError::BadVolumePercent { .. })
        ));
        assert!(matches!(
            dose_at_volume(&dose, &s, 120.0),
            Err(EvalError::BadVolumePercent { .. })
        ));
    }
}
