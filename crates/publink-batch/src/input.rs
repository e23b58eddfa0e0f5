//! Driving-dataset reader.
//!
//! The input table needs one column whose name (case-insensitively)
//! matches a trial-id alias; a `dataset` column additionally selects the
//! max-date cutoff on validation runs.

use std::path::Path;

use publink_common::{normalize_trial_id, PublinkError, Result};

const TRIAL_ID_ALIASES: &[&str] = &["nct_id", "nctid", "trial_id", "trialid"];

/// Validation cutoff per dataset tag; publications on or after this date
/// are invisible to the run.
pub fn cutoff_for_dataset(dataset: Option<&str>) -> &'static str {
    match dataset {
        Some("iv") => "2020-11-17",
        _ => "2023-02-15",
    }
}

#[derive(Debug, Clone)]
pub struct InputRow {
    pub trial_id: Option<String>,
    pub dataset: Option<String>,
}

pub fn read_input(path: &Path, delimiter: u8) -> Result<Vec<InputRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let trial_col = headers.iter().position(|h| {
        let h = h.trim().to_lowercase();
        TRIAL_ID_ALIASES.contains(&h.as_str())
    });
    let Some(trial_col) = trial_col else {
        return Err(PublinkError::Config(format!(
            "{}: no trial-id column found (looked for {})",
            path.display(),
            TRIAL_ID_ALIASES.join(", ")
        )));
    };
    let dataset_col = headers
        .iter()
        .position(|h| h.trim().to_lowercase() == "dataset");

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let trial_id = record
            .get(trial_col)
            .map(normalize_trial_id)
            .filter(|id| !id.is_empty());
        let dataset = dataset_col
            .and_then(|i| record.get(i))
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        rows.push(InputRow { trial_id, dataset });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_reads_nct_id_column_case_insensitively() {
        let f = write_csv("NCT_ID,other\nnct00000001,x\n,y\nNCT00000002,z\n");
        let rows = read_input(f.path(), b',').unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].trial_id.as_deref(), Some("NCT00000001"));
        assert_eq!(rows[1].trial_id, None);
        assert_eq!(rows[2].trial_id.as_deref(), Some("NCT00000002"));
    }

    #[test]
    fn test_alternate_aliases_and_delimiter() {
        let f = write_csv("trialid;dataset\nDRKS00004744;iv\n2004-000446-20;\n");
        let rows = read_input(f.path(), b';').unwrap();
        assert_eq!(rows[0].trial_id.as_deref(), Some("DRKS00004744"));
        assert_eq!(rows[0].dataset.as_deref(), Some("iv"));
        assert_eq!(rows[1].trial_id.as_deref(), Some("2004-000446-20"));
        assert_eq!(rows[1].dataset, None);
    }

    #[test]
    fn test_missing_trial_column_is_config_error() {
        let f = write_csv("id,name\n1,x\n");
        let err = read_input(f.path(), b',').unwrap_err();
        assert!(matches!(err, PublinkError::Config(_)));
    }

    #[test]
    fn test_cutoffs() {
        assert_eq!(cutoff_for_dataset(Some("iv")), "2020-11-17");
        assert_eq!(cutoff_for_dataset(Some("other")), "2023-02-15");
        assert_eq!(cutoff_for_dataset(None), "2023-02-15");
    }
}
