use anyhow::{bail, Context};
use nalgebra::DVector;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

use crate::data::CtGrid;
use crate::io::open_sniffed_reader;

#[derive(Debug, Error)]
pub enum DoseGridError {
    #[error("grid sample at ({i}, {j}, {k}) outside a {dims:?} grid")]
    IndexOutOfGrid {
        i: usize,
        j: usize,
        k: usize,
        dims: [usize; 3],
    },
    #[error("dose grid dims {grid:?} do not match the CT grid dims {ct:?}")]
    GridMismatch { grid: [usize; 3], ct: [usize; 3] },
}

/// Geometry of an imported 3-D dose volume, from `dose_meta.json` written by
/// the external converter.
#[derive(Debug, Clone, Deserialize)]
pub struct DoseGridMeta {
    pub dims: [usize; 3],
    pub origin_mm: [f64; 3],
    pub spacing_mm: [f64; 3],
    pub dose_units: Option<String>,
}

/// A 3-D dose volume recalculated by the external planning system and
/// exported through its DICOM converter. Values are total-course Gy on the
/// CT grid; samples are stored x-fastest.
#[derive(Debug, Clone)]
pub struct DoseGrid {
    pub meta: DoseGridMeta,
    values: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct GridRow {
    i: usize,
    j: usize,
    k: usize,
    dose_gy: f64,
}

impl DoseGrid {
    pub fn new(meta: DoseGridMeta) -> Self {
        let len = meta.dims[0] * meta.dims[1] * meta.dims[2];
        Self {
            meta,
            values: vec![0.0; len],
        }
    }

    /// Loads the grid from its metadata JSON and `i,j,k,dose_gy` sample CSV.
    /// Unlisted grid cells stay zero (the converter omits the air region).
    pub fn from_files<P: AsRef<Path>>(meta_path: P, grid_path: P) -> anyhow::Result<Self> {
        let file = File::open(&meta_path)
            .with_context(|| format!("failed to open dose metadata {:?}", meta_path.as_ref()))?;
        let meta: DoseGridMeta = serde_json::from_reader(file)
            .with_context(|| format!("failed to parse dose metadata {:?}", meta_path.as_ref()))?;
        let mut grid = Self::new(meta);

        let mut rdr = open_sniffed_reader(&grid_path)?;
        let mut samples = 0usize;
        for result in rdr.deserialize() {
            let row: GridRow = result
                .with_context(|| format!("invalid dose sample in {:?}", grid_path.as_ref()))?;
            grid.set(row.i, row.j, row.k, row.dose_gy)
                .with_context(|| format!("bad dose sample in {:?}", grid_path.as_ref()))?;
            samples += 1;
        }
        if samples == 0 {
            bail!(
                "dose grid file {:?} was empty, this data is required",
                grid_path.as_ref()
            );
        }
        println!("Imported dose grid with {} samples", samples);
        Ok(grid)
    }

    fn index(&self, i: usize, j: usize, k: usize) -> Result<usize, DoseGridError> {
        let [nx, ny, nz] = self.meta.dims;
        if i >= nx || j >= ny || k >= nz {
            return Err(DoseGridError::IndexOutOfGrid {
                i,
                j,
                k,
                dims: self.meta.dims,
            });
        }
        Ok(i + nx * (j + ny * k))
    }

    pub fn get(&self, i: usize, j: usize, k: usize) -> Result<f64, DoseGridError> {
        Ok(self.values[self.index(i, j, k)?])
    }

    pub fn set(&mut self, i: usize, j: usize, k: usize, dose_gy: f64) -> Result<(), DoseGridError> {
        let idx = self.index(i, j, k)?;
        self.values[idx] = dose_gy;
        Ok(())
    }

    /// Checks the imported grid shares the CT sampling. Spacing differences
    /// below a tenth of a millimeter are tolerated.
    pub fn validate_against(&self, ct: &CtGrid) -> Result<(), DoseGridError> {
        if self.meta.dims != ct.dims {
            return Err(DoseGridError::GridMismatch {
                grid: self.meta.dims,
                ct: ct.dims,
            });
        }
        for axis in 0..3 {
            if (self.meta.spacing_mm[axis] - ct.spacing_mm[axis]).abs() > 0.1 {
                return Err(DoseGridError::GridMismatch {
                    grid: self.meta.dims,
                    ct: ct.dims,
                });
            }
        }
        Ok(())
    }
}

/// Map between 1-D calc voxels and their CT grid cells, from `voxels.csv`.
/// A calc voxel may cover several CT cells when the dose grid is coarser
/// than the CT.
#[derive(Debug, Clone)]
pub struct VoxelMap {
    entries: Vec<(usize, [usize; 3])>,
    num_voxels: usize,
}

#[derive(Debug, Deserialize)]
struct VoxelRow {
    voxel_idx: usize,
    i: usize,
    j: usize,
    k: usize,
}

impl VoxelMap {
    pub fn from_csv<P: AsRef<Path>>(path: P, num_voxels: usize) -> anyhow::Result<Self> {
        let mut rdr = open_sniffed_reader(&path)?;
        let mut entries = Vec::new();
        for result in rdr.deserialize() {
            let row: VoxelRow = result
                .with_context(|| format!("invalid voxel map row in {:?}", path.as_ref()))?;
            if row.voxel_idx >= num_voxels {
                bail!(
                    "voxel map references voxel {} outside dose grid of {} voxels",
                    row.voxel_idx,
                    num_voxels
                );
            }
            entries.push((row.voxel_idx, [row.i, row.j, row.k]));
        }
        if entries.is_empty() {
            bail!(
                "voxel map file {:?} was empty, this data is required",
                path.as_ref()
            );
        }
        Ok(Self { entries, num_voxels })
    }

    pub fn from_entries(entries: Vec<(usize, [usize; 3])>, num_voxels: usize) -> Self {
        Self { entries, num_voxels }
    }

    pub fn num_voxels(&self) -> usize {
        self.num_voxels
    }

    /// Collapses a 3-D dose volume onto the 1-D calc voxels by averaging the
    /// grid samples each voxel covers. Voxels without any mapped CT cell
    /// stay at zero dose.
    pub fn dose_3d_to_1d(&self, grid: &DoseGrid) -> anyhow::Result<DVector<f64>> {
        let mut sums = vec![0.0f64; self.num_voxels];
        let mut counts = vec![0usize; self.num_voxels];
        for (voxel, [i, j, k]) in &self.entries {
            sums[*voxel] += grid.get(*i, *j, *k)?;
            counts[*voxel] += 1;
        }
        let mut dose = DVector::zeros(self.num_voxels);
        for v in 0..self.num_voxels {
            if counts[v] > 0 {
                dose[v] = sums[v] / counts[v] as f64;
            }
        }
        Ok(dose)
    }

    /// Scatters a 1-D dose back onto the CT grid, the inverse of
    /// [`dose_3d_to_1d`](Self::dose_3d_to_1d) up to the averaging loss.
    pub fn dose_1d_to_3d(&self, dose_1d: &DVector<f64>, ct: &CtGrid) -> anyhow::Result<DoseGrid> {
        if dose_1d.len() != self.num_voxels {
            bail!(
                "dose vector has {} entries but the voxel map covers {} voxels",
                dose_1d.len(),
                self.num_voxels
            );
        }
        let mut grid = DoseGrid::new(DoseGridMeta {
            dims: ct.dims,
            origin_mm: ct.origin_mm,
            spacing_mm: ct.spacing_mm,
            dose_units: Some("Gy".to_string()),
        });
        for (voxel, [i, j, k]) in &self.entries {
            grid.set(*i, *j, *k, dose_1d[*voxel])?;
        }
        Ok(grid)
    }
}

#[cfg(test)]
mod dose_tests {
    use super::*;
    use approx::assert_relative_eq;

    fn meta_2x2x1() -> DoseGridMeta {
        DoseGridMeta {
            dims: [2, 2, 1],
            origin_mm: [0.0, 0.0, 0.0],
            spacing_mm: [2.5, 2.5, 3.0],
            dose_units: Some("Gy".to_string()),
        }
    }

    #[test]
    fn test_grid_set_get_and_bounds() {
        let mut grid = DoseGrid::new(meta_2x2x1());
        grid.set(1, 0, 0, 42.0).unwrap();
        assert_relative_eq!(grid.get(1, 0, 0).unwrap(), 42.0, epsilon = 1e-12);
        assert_relative_eq!(grid.get(0, 1, 0).unwrap(), 0.0, epsilon = 1e-12);
        assert!(matches!(
            grid.get(2, 0, 0),
            Err(DoseGridError::IndexOutOfGrid { i: 2, .. })
        ));
    }

    #[test]
    fn test_dose_3d_to_1d_averages_mapped_cells() {
        let mut grid = DoseGrid::new(meta_2x2x1());
        grid.set(0, 0, 0, 10.0).unwrap();
        grid.set(1, 0, 0, 20.0).unwrap();
        grid.set(0, 1, 0, 30.0).unwrap();

        // voxel 0 covers two cells, voxel 1 one cell, voxel 2 none
        let map = VoxelMap::from_entries(
            vec![(0, [0, 0, 0]), (0, [1, 0, 0]), (1, [0, 1, 0])],
            3,
        );
        let dose = map.dose_3d_to_1d(&grid).unwrap();
        assert_relative_eq!(dose[0], 15.0, epsilon = 1e-12);
        assert_relative_eq!(dose[1], 30.0, epsilon = 1e-12);
        assert_relative_eq!(dose[2], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_round_trip_through_ct_grid() {
        let ct = CtGrid {
            dims: [2, 2, 1],
            origin_mm: [0.0, 0.0, 0.0],
            spacing_mm: [2.5, 2.5, 3.0],
        };
        let map = VoxelMap::from_entries(
            vec![(0, [0, 0, 0]), (1, [1, 0, 0]), (2, [0, 1, 0]), (3, [1, 1, 0])],
            4,
        );
        let dose = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let grid = map.dose_1d_to_3d(&dose, &ct).unwrap();
        grid.validate_against(&ct).unwrap();
        let back = map.dose_3d_to_1d(&grid).unwrap();
        for v in 0..4 {
            assert_relative_eq!(back[v], dose[v], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_validate_against_mismatched_ct() {
        let grid = DoseGrid::new(meta_2x2x1());
        let ct = CtGrid {
            dims: [4, 4, 2],
            origin_mm: [0.0, 0.0, 0.0],
            spacing_mm: [2.5, 2.5, 3.0],
        };
        assert!(matches!(
            grid.validate_against(&ct),
            Err(DoseGridError::GridMismatch { .. })
        ));
    }
}
