use crate::{Error, Result};
use config::{Config, ConfigError, FileFormat};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Target year; only monthly snapshots of this year are read.
    pub year: i32,
    pub dirs: Directories,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Filesystem location of every directory role the pipeline knows about.
#[derive(Debug, Deserialize, Clone)]
pub struct Directories {
    pub cnes: PathBuf,
    pub cities: PathBuf,
    pub mortality: PathBuf,
    pub ibge: PathBuf,
    pub output: PathBuf,
    #[serde(default)]
    pub staging: Option<PathBuf>,
    #[serde(default)]
    pub hospitalizations: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectoryRole {
    Cnes,
    Cities,
    Mortality,
    Ibge,
    Output,
    Staging,
    Hospitalizations,
}

impl DirectoryRole {
    pub const ALL: [DirectoryRole; 7] = [
        DirectoryRole::Cnes,
        DirectoryRole::Cities,
        DirectoryRole::Mortality,
        DirectoryRole::Ibge,
        DirectoryRole::Output,
        DirectoryRole::Staging,
        DirectoryRole::Hospitalizations,
    ];

    /// Input roles that must exist before a run starts.
    pub fn is_required_input(&self) -> bool {
        matches!(
            self,
            DirectoryRole::Cnes | DirectoryRole::Cities | DirectoryRole::Mortality | DirectoryRole::Ibge
        )
    }
}

impl fmt::Display for DirectoryRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DirectoryRole::Cnes => "cnes",
            DirectoryRole::Cities => "cities",
            DirectoryRole::Mortality => "mortality",
            DirectoryRole::Ibge => "ibge",
            DirectoryRole::Output => "output",
            DirectoryRole::Staging => "staging",
            DirectoryRole::Hospitalizations => "hospitalizations",
        };
        f.write_str(name)
    }
}

impl Directories {
    pub fn path(&self, role: DirectoryRole) -> Option<&Path> {
        match role {
            DirectoryRole::Cnes => Some(&self.cnes),
            DirectoryRole::Cities => Some(&self.cities),
            DirectoryRole::Mortality => Some(&self.mortality),
            DirectoryRole::Ibge => Some(&self.ibge),
            DirectoryRole::Output => Some(&self.output),
            DirectoryRole::Staging => self.staging.as_deref(),
            DirectoryRole::Hospitalizations => self.hospitalizations.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaderConfig {
    /// Rows sampled for CSV schema inference before the window is widened.
    #[serde(default = "default_infer_rows")]
    pub infer_rows: usize,
    /// Rows skipped above the header line of spreadsheet sources.
    #[serde(default)]
    pub spreadsheet_skip_rows: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            infer_rows: default_infer_rows(),
            spreadsheet_skip_rows: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_infer_rows() -> usize {
    10_000
}

fn default_api_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn new(path: &str) -> std::result::Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let config = builder.build()?;
        let settings: Settings = config.try_deserialize()?;

        debug!(year = settings.year, dirs = ?settings.dirs, "Loaded settings");

        Ok(settings)
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Fails when a required input directory is missing or the year is implausible.
    pub fn validate(&self) -> Result<()> {
        if !(1900..=2100).contains(&self.year) {
            return Err(Error::InvalidInput(format!(
                "year {} is outside the supported range",
                self.year
            )));
        }

        for role in DirectoryRole::ALL {
            let Some(path) = self.dirs.path(role) else {
                continue;
            };
            let must_exist = role.is_required_input() || role == DirectoryRole::Hospitalizations;
            if must_exist && !path.exists() {
                return Err(Error::MissingDirectory {
                    role: role.to_string(),
                    path: path.display().to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        year = 2022

        [dirs]
        cnes = "data/raw"
        cities = "data/cidades"
        mortality = "data/sim"
        ibge = "data/ibge"
        output = "data/tabela_final"
    "#;

    #[test]
    fn test_defaults_are_applied() {
        let settings = Settings::from_toml(MINIMAL).unwrap();
        assert_eq!(settings.year, 2022);
        assert_eq!(settings.reader.infer_rows, 10_000);
        assert_eq!(settings.reader.spreadsheet_skip_rows, 0);
        assert_eq!(settings.api.port, 3000);
        assert_eq!(settings.logging.format, LogFormat::Pretty);
        assert!(settings.dirs.staging.is_none());
        assert_eq!(
            settings.dirs.path(DirectoryRole::Output),
            Some(Path::new("data/tabela_final"))
        );
    }

    #[test]
    fn test_missing_required_directory_is_fatal() {
        let settings = Settings::from_toml(MINIMAL).unwrap();
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, Error::MissingDirectory { .. }));
    }

    #[test]
    fn test_validate_accepts_existing_directories() {
        let root = tempfile::tempdir().unwrap();
        for dir in ["raw", "cidades", "sim", "ibge"] {
            std::fs::create_dir(root.path().join(dir)).unwrap();
        }
        let toml = format!(
            r#"
            year = 2022
            [dirs]
            cnes = "{0}/raw"
            cities = "{0}/cidades"
            mortality = "{0}/sim"
            ibge = "{0}/ibge"
            output = "{0}/out"
            [logging]
            format = "json"
            "#,
            root.path().display()
        );
        let settings = Settings::from_toml(&toml).unwrap();
        assert_eq!(settings.logging.format, LogFormat::Json);
        settings.validate().unwrap();
    }

    #[test]
    fn test_rejects_implausible_year() {
        let settings = Settings::from_toml(&MINIMAL.replace("2022", "22")).unwrap();
        assert!(matches!(settings.validate(), Err(Error::InvalidInput(_))));
    }
}
