pub mod beams;
pub mod influence;
pub mod structures;

use anyhow::{bail, Context};

use crate::data::protocol::Protocol;
use crate::data::{PatientData, PatientMeta};
use beams::Beams;
use influence::SparseInfluence;
use structures::StructureSet;

/// Everything the optimizer and the correction loop need for one patient:
/// metadata, structure set, beams, the truncated influence matrix and the
/// clinical protocol.
#[derive(Debug, Clone)]
pub struct Plan {
    pub meta: PatientMeta,
    pub structures: StructureSet,
    pub beams: Beams,
    pub inf_matrix: SparseInfluence,
    pub protocol: Protocol,
}

impl Plan {
    /// Assembles a plan from pre-loaded parts, validating that the pieces
    /// agree on voxel and beamlet counts.
    pub fn new(
        meta: PatientMeta,
        structures: StructureSet,
        beams: Beams,
        inf_matrix: SparseInfluence,
        protocol: Protocol,
    ) -> anyhow::Result<Self> {
        if beams.num_beamlets() != inf_matrix.num_beamlets() {
            bail!(
                "beam set has {} beamlets but the influence matrix has {} columns",
                beams.num_beamlets(),
                inf_matrix.num_beamlets()
            );
        }
        if let Some(max_idx) = structures.max_voxel_idx() {
            if max_idx >= inf_matrix.num_voxels() {
                bail!(
                    "structure set references voxel {} but the dose grid has only {} voxels",
                    max_idx,
                    inf_matrix.num_voxels()
                );
            }
        }
        Ok(Self {
            meta,
            structures,
            beams,
            inf_matrix,
            protocol,
        })
    }

    /// Loads all plan components for one patient from the curated data
    /// directory. `num_voxels` is taken from the structure set extent, so the
    /// influence files must cover at least those voxels.
    pub fn load(data: &PatientData, protocol: Protocol) -> anyhow::Result<Self> {
        let meta = data.load_meta()?;

        let structures = StructureSet::from_csv(data.structures_path())
            .with_context(|| format!("failed to load structures for {}", data.patient_id))?;
        println!("Loaded structures: {:?}", structures.names());

        let beams = Beams::from_files(data.beams_path(), data.beamlets_path())
            .with_context(|| format!("failed to load beams for {}", data.patient_id))?;
        println!(
            "Loaded {} beams with {} beamlets",
            beams.num_beams(),
            beams.num_beamlets()
        );

        let num_voxels = structures
            .max_voxel_idx()
            .map(|m| m + 1)
            .unwrap_or_default();
        let inf_matrix =
            SparseInfluence::from_csv(data.influence_path(false), num_voxels, beams.num_beamlets())
                .with_context(|| {
                    format!("failed to load sparse influence matrix for {}", data.patient_id)
                })?;
        println!(
            "Loaded sparse influence matrix: {} voxels x {} beamlets, {} nonzeros",
            inf_matrix.num_voxels(),
            inf_matrix.num_beamlets(),
            inf_matrix.nnz()
        );

        Self::new(meta, structures, beams, inf_matrix, protocol)
    }

    /// Prescription dose per fraction, in Gy.
    pub fn prescription_gy(&self) -> f64 {
        self.protocol.pres_per_fraction_gy
    }

    /// Total prescription over the whole course, in Gy.
    pub fn total_prescription_gy(&self) -> f64 {
        self.protocol.total_prescription_gy()
    }

    pub fn num_fractions(&self) -> u32 {
        self.protocol.num_of_fractions
    }
}
