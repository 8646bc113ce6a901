use anyhow::{anyhow, bail, Context};
use nalgebra::DMatrix;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::optim::Solution;
use crate::plan::beams::FluenceGrid;
use crate::plan::Plan;

/// Writes one optimal-fluence text file per beam into `output_dir`, in the
/// layout the external planning system imports through its
/// "Import Optimal Fluence" dialog: a keyword header describing the grid
/// followed by the row-major intensity values.
///
/// Files are written in parallel; any failure is reported after the tally so
/// one bad beam does not hide the others.
pub fn write_eclipse_fluence(
    plan: &Plan,
    sol: &Solution,
    output_dir: impl AsRef<Path>,
) -> anyhow::Result<()> {
    let output_dir = output_dir.as_ref();
    std::fs::create_dir_all(output_dir).context(format!(
        "Could not create fluence output directory: {:?}",
        output_dir
    ))?;

    let total = plan.beams.num_beams();
    let results: Vec<anyhow::Result<()>> = plan
        .beams
        .beams
        .par_iter()
        .map(|beam| {
            let file_name = format!("beam_{}.optimal_fluence", beam.id);
            let path = output_dir.join(&file_name);
            let map = beam.fluence_map(&sol.optimal_intensity)?;
            write_fluence_file(&path, &beam.grid, beam.id, beam.gantry_angle_deg, &map)
                .map_err(|e| anyhow!("Failed [{}]: {}", file_name, e))
        })
        .collect();

    let success_count = results.iter().filter(|r| r.is_ok()).count();
    let fail_count = total - success_count;
    println!(
        "FLUENCE files: {}/{} written successfully{}",
        success_count,
        total,
        if fail_count > 0 {
            format!(", {} failures", fail_count)
        } else {
            String::new()
        }
    );

    if fail_count > 0 {
        let errors = results
            .into_iter()
            .filter_map(|r| r.err())
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Some fluence writes failed:\n{}", errors);
    }

    Ok(())
}

fn write_fluence_file(
    path: &Path,
    grid: &FluenceGrid,
    beam_id: u32,
    gantry_angle_deg: f64,
    map: &DMatrix<f64>,
) -> anyhow::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "# beam {} gantry {}", beam_id, gantry_angle_deg)?;
    writeln!(writer, "optimalfluence")?;
    writeln!(writer, "sizex {}", grid.cols)?;
    writeln!(writer, "sizey {}", grid.rows)?;
    writeln!(writer, "spacingx {}", grid.spacing_x_mm)?;
    writeln!(writer, "spacingy {}", grid.spacing_y_mm)?;
    writeln!(writer, "originx {}", grid.origin_x_mm)?;
    writeln!(writer, "originy {}", grid.origin_y_mm)?;
    writeln!(writer, "values")?;
    for r in 0..map.nrows() {
        let row = (0..map.ncols())
            .map(|c| format!("{:.6}", map[(r, c)]))
            .collect::<Vec<_>>()
            .join("\t");
        writeln!(writer, "{}", row)?;
    }
    Ok(())
}

/// Reads an optimal-fluence file back, mostly to verify an export.
pub fn read_fluence_file<P: AsRef<Path>>(path: P) -> anyhow::Result<(FluenceGrid, DMatrix<f64>)> {
    let file = File::open(&path)
        .with_context(|| format!("failed to open fluence file {:?}", path.as_ref()))?;
    let reader = BufReader::new(file);

    let mut sizex = None;
    let mut sizey = None;
    let mut spacingx = None;
    let mut spacingy = None;
    let mut originx = None;
    let mut originy = None;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut in_values = false;

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if in_values {
            let row = line
                .split_whitespace()
                .map(|v| v.parse::<f64>().map_err(|e| anyhow!("bad value {:?}: {}", v, e)))
                .collect::<anyhow::Result<Vec<f64>>>()?;
            rows.push(row);
            continue;
        }
        match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["optimalfluence"] => {}
            ["sizex", v] => sizex = Some(v.parse::<usize>()?),
            ["sizey", v] => sizey = Some(v.parse::<usize>()?),
            ["spacingx", v] => spacingx = Some(v.parse::<f64>()?),
            ["spacingy", v] => spacingy = Some(v.parse::<f64>()?),
            ["originx", v] => originx = Some(v.parse::<f64>()?),
            ["originy", v] => originy = Some(v.parse::<f64>()?),
            ["values"] => in_values = true,
            other => bail!("unexpected fluence header line: {:?}", other),
        }
    }

    let grid = FluenceGrid {
        cols: sizex.with_context(|| "fluence file missing sizex")?,
        rows: sizey.with_context(|| "fluence file missing sizey")?,
        spacing_x_mm: spacingx.with_context(|| "fluence file missing spacingx")?,
        spacing_y_mm: spacingy.with_context(|| "fluence file missing spacingy")?,
        origin_x_mm: originx.with_context(|| "fluence file missing originx")?,
        origin_y_mm: originy.with_context(|| "fluence file missing originy")?,
    };
    if rows.len() != grid.rows || rows.iter().any(|r| r.len() != grid.cols) {
        bail!(
            "fluence value block does not match declared {}x{} grid",
            grid.rows,
            grid.cols
        );
    }

    let mut map = DMatrix::zeros(grid.rows, grid.cols);
    for (r, row) in rows.iter().enumerate() {
        for (c, v) in row.iter().enumerate() {
            map[(r, c)] = *v;
        }
    }
    Ok((grid, map))
}

#[cfg(test)]
mod fluence_tests {
    use super::*;
    use crate::optim::{FluenceProblem, FluenceSolver};
    use crate::utils::test_utils::{synthetic_plan, FixedSolver};
    use approx::assert_relative_eq;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("rtplan_fluence_{}_{}", std::process::id(), name));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_export_and_read_back() {
        let plan = synthetic_plan();
        let problem = FluenceProblem::new(&plan).unwrap();
        let solver = FixedSolver::uniform(plan.beams.num_beamlets(), 1.5);
        let sol = solver.solve(&problem).unwrap();

        let dir = temp_dir("roundtrip");
        write_eclipse_fluence(&plan, &sol, &dir).unwrap();

        for beam in &plan.beams.beams {
            let path = dir.join(format!("beam_{}.optimal_fluence", beam.id));
            let (grid, map) = read_fluence_file(&path).unwrap();
            assert_eq!(grid, beam.grid);

            let expected = beam.fluence_map(&sol.optimal_intensity).unwrap();
            assert_eq!(map.nrows(), expected.nrows());
            for r in 0..map.nrows() {
                for c in 0..map.ncols() {
                    assert_relative_eq!(map[(r, c)], expected[(r, c)], epsilon = 1e-6);
                }
            }
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_read_rejects_truncated_value_block() {
        let dir = temp_dir("truncated");
        let path = dir.join("bad.optimal_fluence");
        std::fs::write(
            &path,
            "optimalfluence\nsizex 2\nsizey 2\nspacingx 2.5\nspacingy 2.5\noriginx 0\noriginy 0\nvalues\n1.0\t2.0\n",
        )
        .unwrap();
        assert!(read_fluence_file(&path).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
