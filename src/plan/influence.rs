use anyhow::{bail, Context};
use nalgebra::{DMatrix, DVector};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::io::open_sniffed_reader;

#[derive(Debug, Error)]
pub enum InfluenceError {
    #[error("intensity vector has {got} entries but the matrix expects {expected} beamlets")]
    IntensityLength { expected: usize, got: usize },
    #[error("correction vector has {got} entries but the dose grid has {expected} voxels")]
    DeltaLength { expected: usize, got: usize },
    #[error("voxel index {voxel} outside dose grid of {num_voxels} voxels")]
    VoxelOutOfRange { voxel: usize, num_voxels: usize },
    #[error("beamlet index {beamlet} outside fluence space of {num_beamlets} beamlets")]
    BeamletOutOfRange { beamlet: usize, num_beamlets: usize },
}

/// One `voxel,beamlet,value` row of an influence matrix file.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct InfluenceEntry {
    pub voxel: usize,
    pub beamlet: usize,
    pub value: f64,
}

fn read_entries<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<InfluenceEntry>> {
    let mut rdr = open_sniffed_reader(&path)?;
    let mut entries = Vec::new();
    for result in rdr.deserialize() {
        let entry: InfluenceEntry = result.with_context(|| {
            format!("invalid influence entry in {:?}", path.as_ref())
        })?;
        entries.push(entry);
    }
    if entries.is_empty() {
        bail!(
            "influence matrix file {:?} was empty, this data is required",
            path.as_ref()
        );
    }
    Ok(entries)
}

/// Truncated influence matrix in CSR layout.
///
/// This is the default matrix used during optimization. Small scatter
/// contributions are dropped at data generation time (or by
/// [`FullInfluence::sparsify`]), which keeps the dose product cheap but
/// introduces the discrepancy the correction loop exists to fix.
#[derive(Debug, Clone)]
pub struct SparseInfluence {
    num_voxels: usize,
    num_beamlets: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl SparseInfluence {
    pub fn from_triplets(
        num_voxels: usize,
        num_beamlets: usize,
        mut entries: Vec<InfluenceEntry>,
    ) -> Result<Self, InfluenceError> {
        for e in &entries {
            if e.voxel >= num_voxels {
                return Err(InfluenceError::VoxelOutOfRange {
                    voxel: e.voxel,
                    num_voxels,
                });
            }
            if e.beamlet >= num_beamlets {
                return Err(InfluenceError::BeamletOutOfRange {
                    beamlet: e.beamlet,
                    num_beamlets,
                });
            }
        }
        entries.sort_by(|a, b| (a.voxel, a.beamlet).cmp(&(b.voxel, b.beamlet)));

        let mut row_ptr = Vec::with_capacity(num_voxels + 1);
        let mut col_idx = Vec::with_capacity(entries.len());
        let mut values = Vec::with_capacity(entries.len());
        row_ptr.push(0);
        let mut row = 0;
        for e in &entries {
            while row < e.voxel {
                row_ptr.push(col_idx.len());
                row += 1;
            }
            col_idx.push(e.beamlet);
            values.push(e.value);
        }
        while row < num_voxels {
            row_ptr.push(col_idx.len());
            row += 1;
        }

        Ok(Self {
            num_voxels,
            num_beamlets,
            row_ptr,
            col_idx,
            values,
        })
    }

    /// Loads the truncated matrix from a `voxel,beamlet,value` CSV file.
    pub fn from_csv<P: AsRef<Path>>(
        path: P,
        num_voxels: usize,
        num_beamlets: usize,
    ) -> anyhow::Result<Self> {
        let entries = read_entries(&path)?;
        let matrix = Self::from_triplets(num_voxels, num_beamlets, entries)
            .with_context(|| format!("bad influence data in {:?}", path.as_ref()))?;
        Ok(matrix)
    }

    pub fn num_voxels(&self) -> usize {
        self.num_voxels
    }

    pub fn num_beamlets(&self) -> usize {
        self.num_beamlets
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Per-fraction dose for the given beamlet intensities.
    pub fn dose(&self, intensity: &DVector<f64>) -> Result<DVector<f64>, InfluenceError> {
        if intensity.len() != self.num_beamlets {
            return Err(InfluenceError::IntensityLength {
                expected: self.num_beamlets,
                got: intensity.len(),
            });
        }
        let mut dose = DVector::zeros(self.num_voxels);
        for v in 0..self.num_voxels {
            let mut acc = 0.0;
            for k in self.row_ptr[v]..self.row_ptr[v + 1] {
                acc += self.values[k] * intensity[self.col_idx[k]];
            }
            dose[v] = acc;
        }
        Ok(dose)
    }

    /// Sum of all stored matrix weights, used for truncation diagnostics.
    pub fn total_weight(&self) -> f64 {
        self.values.iter().sum()
    }
}

/// Full dense influence matrix including all scattering components.
///
/// Too expensive to optimize against directly; used to recompute the dose for
/// a solution obtained with the truncated matrix and to drive the correction
/// loop.
#[derive(Debug, Clone)]
pub struct FullInfluence {
    a: DMatrix<f64>,
}

impl FullInfluence {
    pub fn from_triplets(
        num_voxels: usize,
        num_beamlets: usize,
        entries: Vec<InfluenceEntry>,
    ) -> Result<Self, InfluenceError> {
        let mut a = DMatrix::zeros(num_voxels, num_beamlets);
        for e in &entries {
            if e.voxel >= num_voxels {
                return Err(InfluenceError::VoxelOutOfRange {
                    voxel: e.voxel,
                    num_voxels,
                });
            }
            if e.beamlet >= num_beamlets {
                return Err(InfluenceError::BeamletOutOfRange {
                    beamlet: e.beamlet,
                    num_beamlets,
                });
            }
            a[(e.voxel, e.beamlet)] = e.value;
        }
        Ok(Self { a })
    }

    pub fn from_csv<P: AsRef<Path>>(
        path: P,
        num_voxels: usize,
        num_beamlets: usize,
    ) -> anyhow::Result<Self> {
        let entries = read_entries(&path)?;
        let matrix = Self::from_triplets(num_voxels, num_beamlets, entries)
            .with_context(|| format!("bad influence data in {:?}", path.as_ref()))?;
        Ok(matrix)
    }

    pub fn from_matrix(a: DMatrix<f64>) -> Self {
        Self { a }
    }

    pub fn num_voxels(&self) -> usize {
        self.a.nrows()
    }

    pub fn num_beamlets(&self) -> usize {
        self.a.ncols()
    }

    pub fn dose(&self, intensity: &DVector<f64>) -> Result<DVector<f64>, InfluenceError> {
        if intensity.len() != self.a.ncols() {
            return Err(InfluenceError::IntensityLength {
                expected: self.a.ncols(),
                got: intensity.len(),
            });
        }
        Ok(&self.a * intensity)
    }

    /// Truncates the dense matrix by dropping every element below
    /// `threshold` times the column maximum, the same rule the curated data
    /// uses to produce its sparse variant.
    ///
    /// Returns the sparse matrix and the fraction of total matrix weight it
    /// retains, a useful sanity number when picking thresholds.
    pub fn sparsify(&self, threshold: f64) -> (SparseInfluence, f64) {
        let mut entries = Vec::new();
        let mut total = 0.0;
        let mut kept = 0.0;
        for b in 0..self.a.ncols() {
            let col_max = self.a.column(b).iter().fold(0.0f64, |m, v| m.max(*v));
            let cutoff = threshold * col_max;
            for v in 0..self.a.nrows() {
                let value = self.a[(v, b)];
                total += value;
                if value >= cutoff && value != 0.0 {
                    kept += value;
                    entries.push(InfluenceEntry {
                        voxel: v,
                        beamlet: b,
                        value,
                    });
                }
            }
        }
        // indices come straight from the dense shape, cannot be out of range
        let sparse = SparseInfluence::from_triplets(self.a.nrows(), self.a.ncols(), entries)
            .unwrap_or_else(|_| unreachable!());
        let retained = if total > 0.0 { kept / total } else { 1.0 };
        (sparse, retained)
    }
}

#[cfg(test)]
mod influence_tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_entries() -> Vec<InfluenceEntry> {
        vec![
            InfluenceEntry { voxel: 0, beamlet: 0, value: 1.0 },
            InfluenceEntry { voxel: 0, beamlet: 1, value: 0.5 },
            InfluenceEntry { voxel: 1, beamlet: 1, value: 2.0 },
            InfluenceEntry { voxel: 3, beamlet: 0, value: 0.25 },
        ]
    }

    #[test]
    fn test_sparse_dose_matches_dense() {
        let sparse = SparseInfluence::from_triplets(4, 2, sample_entries()).unwrap();
        let full = FullInfluence::from_triplets(4, 2, sample_entries()).unwrap();
        let x = DVector::from_vec(vec![2.0, 3.0]);

        let ds = sparse.dose(&x).unwrap();
        let df = full.dose(&x).unwrap();
        for v in 0..4 {
            assert_relative_eq!(ds[v], df[v], epsilon = 1e-12);
        }
        assert_relative_eq!(ds[0], 3.5, epsilon = 1e-12);
        assert_relative_eq!(ds[2], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sparse_rejects_wrong_intensity_length() {
        let sparse = SparseInfluence::from_triplets(4, 2, sample_entries()).unwrap();
        let x = DVector::from_vec(vec![1.0, 1.0, 1.0]);
        match sparse.dose(&x) {
            Err(InfluenceError::IntensityLength { expected, got }) => {
                assert_eq!(expected, 2);
                assert_eq!(got, 3);
            }
            other => panic!("expected IntensityLength error, got {:?}", other),
        }
    }

    #[test]
    fn test_triplets_out_of_range() {
        let mut entries = sample_entries();
        entries.push(InfluenceEntry { voxel: 9, beamlet: 0, value: 1.0 });
        assert!(matches!(
            SparseInfluence::from_triplets(4, 2, entries),
            Err(InfluenceError::VoxelOutOfRange { voxel: 9, .. })
        ));
    }

    #[test]
    fn test_sparsify_drops_small_elements() {
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 0.01, 0.002, 1.0, 0.5, 0.4]);
        let full = FullInfluence::from_matrix(a);
        let (sparse, retained) = full.sparsify(0.1);

        // column 0 max is 1.0, so 0.002 is dropped; column 1 max is 1.0, 0.01 dropped
        assert_eq!(sparse.nnz(), 4);
        let expected_retained = (1.0 + 1.0 + 0.5 + 0.4) / (1.0 + 0.01 + 0.002 + 1.0 + 0.5 + 0.4);
        assert_relative_eq!(retained, expected_retained, epsilon = 1e-12);

        let x = DVector::from_vec(vec![1.0, 1.0]);
        let d = sparse.dose(&x).unwrap();
        assert_relative_eq!(d[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sparsify_zero_threshold_is_lossless() {
        let a = DMatrix::from_row_slice(2, 2, &[0.3, 0.0, 0.1, 0.9]);
        let full = FullInfluence::from_matrix(a);
        let (sparse, retained) = full.sparsify(0.0);
        assert_relative_eq!(retained, 1.0, epsilon = 1e-12);

        let x = DVector::from_vec(vec![1.5, 2.5]);
        let ds = sparse.dose(&x).unwrap();
        let df = full.dose(&x).unwrap();
        for v in 0..2 {
            assert_relative_eq!(ds[v], df[v], epsilon = 1e-12);
        }
    }
}
