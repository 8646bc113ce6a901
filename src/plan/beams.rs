use anyhow::{bail, Context};
use nalgebra::{DMatrix, DVector};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::io::open_sniffed_reader;

/// Fluence grid geometry of one beam, in the BEV plane.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct FluenceGrid {
    pub rows: usize,
    pub cols: usize,
    pub spacing_x_mm: f64,
    pub spacing_y_mm: f64,
    pub origin_x_mm: f64,
    pub origin_y_mm: f64,
}

/// Position of one beamlet inside its beam's fluence grid. The `idx` is the
/// global beamlet index, i.e. the column of the influence matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beamlet {
    pub idx: usize,
    pub row: usize,
    pub col: usize,
}

#[derive(Debug, Clone)]
pub struct Beam {
    pub id: u32,
    pub gantry_angle_deg: f64,
    pub collimator_angle_deg: f64,
    pub grid: FluenceGrid,
    pub beamlets: Vec<Beamlet>,
}

impl Beam {
    /// Scatters the intensity vector into the beam's 2-D fluence map.
    /// Grid cells without a beamlet stay zero (outside the jaw opening).
    pub fn fluence_map(&self, intensity: &DVector<f64>) -> anyhow::Result<DMatrix<f64>> {
        let mut map = DMatrix::zeros(self.grid.rows, self.grid.cols);
        for b in &self.beamlets {
            if b.idx >= intensity.len() {
                bail!(
                    "beam {} beamlet {} outside intensity vector of length {}",
                    self.id,
                    b.idx,
                    intensity.len()
                );
            }
            if b.row >= self.grid.rows || b.col >= self.grid.cols {
                bail!(
                    "beam {} beamlet {} at ({}, {}) outside its {}x{} grid",
                    self.id,
                    b.idx,
                    b.row,
                    b.col,
                    self.grid.rows,
                    self.grid.cols
                );
            }
            map[(b.row, b.col)] = intensity[b.idx];
        }
        Ok(map)
    }
}

/// Treatment beams as selected by the planner, with their beamlet layout.
#[derive(Debug, Clone)]
pub struct Beams {
    pub beams: Vec<Beam>,
}

#[derive(Debug, Deserialize)]
struct BeamRow {
    beam_id: u32,
    gantry_angle_deg: f64,
    collimator_angle_deg: f64,
    rows: usize,
    cols: usize,
    spacing_x_mm: f64,
    spacing_y_mm: f64,
    origin_x_mm: f64,
    origin_y_mm: f64,
}

#[derive(Debug, Deserialize)]
struct BeamletRow {
    beam_id: u32,
    beamlet_idx: usize,
    row: usize,
    col: usize,
}

impl Beams {
    /// Loads beam geometry and the beamlet map from `beams.csv` and
    /// `beamlets.csv`. Beamlet indices must form one contiguous 0..n range
    /// across all beams because they index influence matrix columns.
    pub fn from_files<P: AsRef<Path>>(beams_path: P, beamlets_path: P) -> anyhow::Result<Self> {
        let mut rdr = open_sniffed_reader(&beams_path)?;
        let mut beams: Vec<Beam> = Vec::new();
        for result in rdr.deserialize() {
            let row: BeamRow = result
                .with_context(|| format!("invalid beam row in {:?}", beams_path.as_ref()))?;
            beams.push(Beam {
                id: row.beam_id,
                gantry_angle_deg: row.gantry_angle_deg,
                collimator_angle_deg: row.collimator_angle_deg,
                grid: FluenceGrid {
                    rows: row.rows,
                    cols: row.cols,
                    spacing_x_mm: row.spacing_x_mm,
                    spacing_y_mm: row.spacing_y_mm,
                    origin_x_mm: row.origin_x_mm,
                    origin_y_mm: row.origin_y_mm,
                },
                beamlets: Vec::new(),
            });
        }
        if beams.is_empty() {
            bail!(
                "beam file {:?} was empty, this data is required",
                beams_path.as_ref()
            );
        }

        let mut by_id: HashMap<u32, usize> = HashMap::new();
        for (i, beam) in beams.iter().enumerate() {
            if by_id.insert(beam.id, i).is_some() {
                bail!("duplicate beam id {} in {:?}", beam.id, beams_path.as_ref());
            }
        }

        let mut rdr = open_sniffed_reader(&beamlets_path)?;
        let mut seen: Vec<bool> = Vec::new();
        for result in rdr.deserialize() {
            let row: BeamletRow = result.with_context(|| {
                format!("invalid beamlet row in {:?}", beamlets_path.as_ref())
            })?;
            let beam = match by_id.get(&row.beam_id) {
                Some(&i) => &mut beams[i],
                None => bail!(
                    "beamlet {} references unknown beam id {}",
                    row.beamlet_idx,
                    row.beam_id
                ),
            };
            if row.beamlet_idx >= seen.len() {
                seen.resize(row.beamlet_idx + 1, false);
            }
            if seen[row.beamlet_idx] {
                bail!("beamlet index {} assigned twice", row.beamlet_idx);
            }
            seen[row.beamlet_idx] = true;
            beam.beamlets.push(Beamlet {
                idx: row.beamlet_idx,
                row: row.row,
                col: row.col,
            });
        }

        if seen.is_empty() {
            bail!(
                "beamlet file {:?} was empty, this data is required",
                beamlets_path.as_ref()
            );
        }
        if let Some(gap) = seen.iter().position(|s| !s) {
            bail!("beamlet indices are not contiguous, index {} is missing", gap);
        }

        Ok(Self { beams })
    }

    pub fn num_beams(&self) -> usize {
        self.beams.len()
    }

    pub fn num_beamlets(&self) -> usize {
        self.beams.iter().map(|b| b.beamlets.len()).sum()
    }

    pub fn beam_ids(&self) -> Vec<u32> {
        self.beams.iter().map(|b| b.id).collect()
    }

    pub fn get(&self, beam_id: u32) -> Option<&Beam> {
        self.beams.iter().find(|b| b.id == beam_id)
    }
}

#[cfg(test)]
mod beam_tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    fn write_temp_csv(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("rtplan_{}_{}", std::process::id(), name));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn sample_paths() -> (std::path::PathBuf, std::path::PathBuf) {
        let beams = write_temp_csv(
            "beams.csv",
            "beam_id,gantry_angle_deg,collimator_angle_deg,rows,cols,spacing_x_mm,spacing_y_mm,origin_x_mm,origin_y_mm\n\
             0,0.0,0.0,2,2,2.5,2.5,-2.5,-2.5\n\
             1,180.0,0.0,1,2,2.5,2.5,-2.5,0.0\n",
        );
        let beamlets = write_temp_csv(
            "beamlets.csv",
            "beam_id,beamlet_idx,row,col\n\
             0,0,0,0\n0,1,0,1\n0,2,1,0\n0,3,1,1\n1,4,0,0\n1,5,0,1\n",
        );
        (beams, beamlets)
    }

    #[test]
    fn test_load_beams_and_beamlets() {
        let (beams_path, beamlets_path) = sample_paths();
        let beams = Beams::from_files(&beams_path, &beamlets_path).unwrap();
        std::fs::remove_file(&beams_path).ok();
        std::fs::remove_file(&beamlets_path).ok();

        assert_eq!(beams.num_beams(), 2);
        assert_eq!(beams.num_beamlets(), 6);
        assert_eq!(beams.beam_ids(), vec![0, 1]);

        let b1 = beams.get(1).unwrap();
        assert_relative_eq!(b1.gantry_angle_deg, 180.0, epsilon = 1e-12);
        assert_eq!(b1.beamlets.len(), 2);
    }

    #[test]
    fn test_fluence_map_scatter() {
        let (beams_path, beamlets_path) = sample_paths();
        let beams = Beams::from_files(&beams_path, &beamlets_path).unwrap();
        std::fs::remove_file(&beams_path).ok();
        std::fs::remove_file(&beamlets_path).ok();

        let x = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let map = beams.get(0).unwrap().fluence_map(&x).unwrap();
        assert_relative_eq!(map[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(map[(1, 1)], 4.0, epsilon = 1e-12);

        let map1 = beams.get(1).unwrap().fluence_map(&x).unwrap();
        assert_relative_eq!(map1[(0, 1)], 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_gap_in_beamlet_indices_is_an_error() {
        let beams_path = write_temp_csv(
            "beams_gap.csv",
            "beam_id,gantry_angle_deg,collimator_angle_deg,rows,cols,spacing_x_mm,spacing_y_mm,origin_x_mm,origin_y_mm\n\
             0,0.0,0.0,1,3,2.5,2.5,0.0,0.0\n",
        );
        let beamlets_path = write_temp_csv(
            "beamlets_gap.csv",
            "beam_id,beamlet_idx,row,col\n0,0,0,0\n0,2,0,2\n",
        );
        let result = Beams::from_files(&beams_path, &beamlets_path);
        std::fs::remove_file(&beams_path).ok();
        std::fs::remove_file(&beamlets_path).ok();
        assert!(result.unwrap_err().to_string().contains("not contiguous"));
    }
}
