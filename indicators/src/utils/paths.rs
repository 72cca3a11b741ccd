use chrono::NaiveDate;
use common::{Error, Result};
use std::path::{Path, PathBuf};

pub const INDICATOR_TABLE_FILE: &str = "indicator_table.parquet";
pub const FEATURES_FILE: &str = "features.parquet";
pub const MARKER_FILE: &str = "_SUCCESS";

/// File stem without extension, e.g. `tbEstabelecimento202212`.
pub fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::InvalidInput(format!("Path has no file name: {}", path.display())))
}

/// Logical table a monthly extract belongs to: the alphabetic characters of
/// the stem, lowercased (`tbEstabelecimento202212` -> `tbestabelecimento`).
pub fn logical_table_name(stem: &str) -> String {
    stem.chars()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Parses the trailing `YYYYMM` token of a stem into the first day of that month.
pub fn snapshot_period(stem: &str) -> Result<NaiveDate> {
    let invalid = || {
        Error::InvalidInput(format!(
            "File name '{}' does not end with a YYYYMM snapshot token",
            stem
        ))
    };

    if stem.len() < 6 || !stem.is_char_boundary(stem.len() - 6) {
        return Err(invalid());
    }
    let token = &stem[stem.len() - 6..];
    if !token.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let year: i32 = token[..4].parse().map_err(|_| invalid())?;
    let month: u32 = token[4..].parse().map_err(|_| invalid())?;
    NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)
}

pub struct ArtifactPaths {
    output_dir: PathBuf,
}

impl ArtifactPaths {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
        }
    }

    pub fn indicator_table(&self) -> PathBuf {
        self.output_dir.join(INDICATOR_TABLE_FILE)
    }

    pub fn features(&self) -> PathBuf {
        self.output_dir.join(FEATURES_FILE)
    }

    pub fn marker(&self) -> PathBuf {
        self.output_dir.join(MARKER_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_table_name() {
        assert_eq!(logical_table_name("tbEstabelecimento202212"), "tbestabelecimento");
        assert_eq!(logical_table_name("rlEstabComplementar202201"), "rlestabcomplementar");
        assert_eq!(logical_table_name("taxa_de_alfabetizacao"), "taxadealfabetizacao");
    }

    #[test]
    fn test_snapshot_period() {
        assert_eq!(
            snapshot_period("tbMunicipio202203").unwrap(),
            NaiveDate::from_ymd_opt(2022, 3, 1).unwrap()
        );
        assert!(snapshot_period("tbMunicipio").is_err());
        assert!(snapshot_period("tbMunicipio202213").is_err());
        assert!(snapshot_period("2022").is_err());
    }

    #[test]
    fn test_artifact_paths() {
        let paths = ArtifactPaths::new(Path::new("data/tabela_final"));
        assert_eq!(
            paths.indicator_table(),
            Path::new("data/tabela_final/indicator_table.parquet")
        );
        assert_eq!(paths.marker(), Path::new("data/tabela_final/_SUCCESS"));
    }
}
