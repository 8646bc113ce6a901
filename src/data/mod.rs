pub mod protocol;

use anyhow::{bail, Context};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};

use protocol::Protocol;

/// CT grid geometry of one patient, from `meta.json`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CtGrid {
    /// Grid dimensions as (x, y, z) sample counts.
    pub dims: [usize; 3],
    pub origin_mm: [f64; 3],
    pub spacing_mm: [f64; 3],
}

impl CtGrid {
    pub fn num_voxels(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }
}

/// Patient metadata stored alongside the curated data files.
#[derive(Debug, Clone, Deserialize)]
pub struct PatientMeta {
    pub patient_id: String,
    pub disease_site: String,
    pub ct: CtGrid,
    /// Reference into the public imaging archive holding the original
    /// CT/RTSTRUCT series, which the external planning system needs and the
    /// curated dataset does not carry.
    pub tcia_collection_id: Option<String>,
    pub tcia_subject_id: Option<String>,
}

/// Entry point into the curated patient database on disk.
///
/// Layout per patient directory:
/// `meta.json`, `structures.csv`, `beams.csv`, `beamlets.csv`,
/// `voxels.csv`, `influence_sparse.csv`, `influence_full.csv`.
/// Protocols live next to the patients in `protocols/<name>.json`.
#[derive(Debug, Clone)]
pub struct PatientData {
    data_dir: PathBuf,
    pub patient_id: String,
}

impl PatientData {
    pub fn new<P: AsRef<Path>>(data_dir: P, patient_id: &str) -> anyhow::Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let patient_dir = data_dir.join(patient_id);
        if !patient_dir.is_dir() {
            bail!(
                "patient directory {:?} does not exist, available patients: {:?}",
                patient_dir,
                Self::list_patients(&data_dir).unwrap_or_default()
            );
        }
        Ok(Self {
            data_dir,
            patient_id: patient_id.to_string(),
        })
    }

    /// Enumerates patient ids (subdirectories carrying a `meta.json`).
    pub fn list_patients<P: AsRef<Path>>(data_dir: P) -> anyhow::Result<Vec<String>> {
        let mut patients = Vec::new();
        let entries = std::fs::read_dir(&data_dir)
            .with_context(|| format!("failed to read data directory {:?}", data_dir.as_ref()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && path.join("meta.json").is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    patients.push(name.to_string());
                }
            }
        }
        patients.sort();
        Ok(patients)
    }

    pub fn display_list_of_patients<P: AsRef<Path>>(data_dir: P) -> anyhow::Result<()> {
        let patients = Self::list_patients(&data_dir)?;
        println!("Patients in {:?}:", data_dir.as_ref());
        for p in &patients {
            println!("  {}", p);
        }
        Ok(())
    }

    pub fn load_meta(&self) -> anyhow::Result<PatientMeta> {
        let path = self.patient_dir().join("meta.json");
        let file = File::open(&path)
            .with_context(|| format!("failed to open patient metadata {:?}", path))?;
        let meta: PatientMeta = serde_json::from_reader(file)
            .with_context(|| format!("failed to parse patient metadata {:?}", path))?;
        if meta.patient_id != self.patient_id {
            bail!(
                "metadata patient id {:?} does not match directory {:?}",
                meta.patient_id,
                self.patient_id
            );
        }
        Ok(meta)
    }

    pub fn display_patient_metadata(&self) -> anyhow::Result<()> {
        let meta = self.load_meta()?;
        println!("Patient {}", meta.patient_id);
        println!("  disease site: {}", meta.disease_site);
        println!(
            "  ct grid: {}x{}x{} at {:?} mm spacing",
            meta.ct.dims[0], meta.ct.dims[1], meta.ct.dims[2], meta.ct.spacing_mm
        );
        if let (Some(coll), Some(subj)) = (&meta.tcia_collection_id, &meta.tcia_subject_id) {
            println!("  tcia: collection {} subject {}", coll, subj);
        }
        Ok(())
    }

    pub fn load_protocol(&self, name: &str) -> anyhow::Result<Protocol> {
        Protocol::from_json_file(self.data_dir.join("protocols").join(format!("{}.json", name)))
    }

    pub fn patient_dir(&self) -> PathBuf {
        self.data_dir.join(&self.patient_id)
    }

    pub fn structures_path(&self) -> PathBuf {
        self.patient_dir().join("structures.csv")
    }

    pub fn beams_path(&self) -> PathBuf {
        self.patient_dir().join("beams.csv")
    }

    pub fn beamlets_path(&self) -> PathBuf {
        self.patient_dir().join("beamlets.csv")
    }

    pub fn voxels_path(&self) -> PathBuf {
        self.patient_dir().join("voxels.csv")
    }

    /// Path of the influence matrix file at the requested fidelity.
    pub fn influence_path(&self, full: bool) -> PathBuf {
        if full {
            self.patient_dir().join("influence_full.csv")
        } else {
            self.patient_dir().join("influence_sparse.csv")
        }
    }
}

#[cfg(test)]
mod data_tests {
    use super::*;
    use std::io::Write;

    fn make_patient_dir(meta_id: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "rtplan_data_{}_{}",
            std::process::id(),
            meta_id
        ));
        let dir = root.join(meta_id);
        std::fs::create_dir_all(&dir).unwrap();
        let meta = format!(
            r#"{{"patient_id": "{}", "disease_site": "Lung",
                "ct": {{"dims": [4, 4, 2], "origin_mm": [0.0, 0.0, 0.0], "spacing_mm": [2.5, 2.5, 3.0]}},
                "tcia_collection_id": "NSCLC-Cetuximab", "tcia_subject_id": "0001"}}"#,
            meta_id
        );
        let mut f = File::create(dir.join("meta.json")).unwrap();
        f.write_all(meta.as_bytes()).unwrap();
        root
    }

    #[test]
    fn test_list_and_load_meta() {
        let root = make_patient_dir("Lung_Patient_2");
        let patients = PatientData::list_patients(&root).unwrap();
        assert_eq!(patients, vec!["Lung_Patient_2"]);

        let data = PatientData::new(&root, "Lung_Patient_2").unwrap();
        let meta = data.load_meta().unwrap();
        assert_eq!(meta.disease_site, "Lung");
        assert_eq!(meta.ct.num_voxels(), 32);

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_unknown_patient_is_an_error() {
        let root = make_patient_dir("Lung_Patient_3");
        let result = PatientData::new(&root, "Lung_Patient_9");
        assert!(result.unwrap_err().to_string().contains("Lung_Patient_3"));
        std::fs::remove_dir_all(&root).ok();
    }
}
