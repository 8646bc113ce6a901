pub mod dose;
pub mod fluence;
pub mod output;

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Utility: detect whether the file uses comma or tab as delimiter.
fn detect_delimiter<P: AsRef<Path>>(path: P) -> Result<u8> {
    let file = File::open(&path).with_context(|| {
        format!(
            "failed to open file for delimiter sniffing: {:?}",
            path.as_ref()
        )
    })?;
    let mut reader = BufReader::new(file);
    let mut first_line = String::new();
    reader
        .read_line(&mut first_line)
        .with_context(|| "failed to read first line for delimiter detection")?;

    let tabs = first_line.matches('\t').count();
    let commas = first_line.matches(',').count();

    if tabs > commas {
        Ok(b'\t')
    } else {
        // default to comma
        Ok(b',')
    }
}

/// Opens a headered CSV reader with the sniffed delimiter.
pub fn open_sniffed_reader<P: AsRef<Path>>(path: P) -> Result<csv::Reader<File>> {
    let delim = detect_delimiter(&path)?;
    let file =
        File::open(&path).with_context(|| format!("failed to open {:?}", path.as_ref()))?;
    Ok(csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delim)
        .from_reader(file))
}
