use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::io::open_sniffed_reader;

/// One calc voxel belonging to a structure, with its fractional volume.
///
/// Voxel indices refer to the 1-D dose grid the influence matrix maps into.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct StructVoxel {
    pub voxel_idx: usize,
    pub volume_cc: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    pub name: String,
    pub voxels: Vec<StructVoxel>,
}

impl Structure {
    pub fn volume_cc(&self) -> f64 {
        self.voxels.iter().map(|v| v.volume_cc).sum()
    }

    pub fn voxel_count(&self) -> usize {
        self.voxels.len()
    }
}

/// Named anatomical structures of one patient (targets, organs at risk and
/// any optimization rings the protocol defines).
#[derive(Debug, Clone)]
pub struct StructureSet {
    pub structures: Vec<Structure>,
}

#[derive(Debug, Deserialize)]
struct StructRow {
    structure: String,
    voxel_idx: usize,
    volume_cc: f64,
}

impl StructureSet {
    /// Loads the structure set from a `structure,voxel_idx,volume_cc` file.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut rdr = open_sniffed_reader(&path)?;
        let mut groups: HashMap<String, Vec<StructVoxel>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for result in rdr.deserialize() {
            let row: StructRow = result
                .with_context(|| format!("invalid structure row in {:?}", path.as_ref()))?;
            if row.volume_cc <= 0.0 {
                bail!(
                    "structure {} voxel {} has non-positive volume {}",
                    row.structure,
                    row.voxel_idx,
                    row.volume_cc
                );
            }
            if !groups.contains_key(&row.structure) {
                order.push(row.structure.clone());
            }
            groups.entry(row.structure).or_default().push(StructVoxel {
                voxel_idx: row.voxel_idx,
                volume_cc: row.volume_cc,
            });
        }

        if order.is_empty() {
            bail!(
                "structure file {:?} was empty, this data is required",
                path.as_ref()
            );
        }

        let structures = order
            .into_iter()
            .map(|name| {
                let voxels = groups.remove(&name).unwrap_or_default();
                Structure { name, voxels }
            })
            .collect();

        Ok(Self { structures })
    }

    pub fn get(&self, name: &str) -> Option<&Structure> {
        self.structures.iter().find(|s| s.name == name)
    }

    /// Like [`get`](Self::get) but fails with the available names listed,
    /// since a typo in a structure name is the most common config mistake.
    pub fn require(&self, name: &str) -> anyhow::Result<&Structure> {
        match self.get(name) {
            Some(s) => Ok(s),
            None => bail!(
                "structure {:?} not found, available: {:?}",
                name,
                self.names()
            ),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.structures.iter().map(|s| s.name.as_str()).collect()
    }

    /// Highest voxel index referenced by any structure.
    pub fn max_voxel_idx(&self) -> Option<usize> {
        self.structures
            .iter()
            .flat_map(|s| s.voxels.iter().map(|v| v.voxel_idx))
            .max()
    }
}
