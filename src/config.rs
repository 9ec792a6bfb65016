use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use directories::BaseDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{DownloadMode, SearchArea};
use crate::error::KiraError;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub run: String,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub taxonomy: TaxonomySection,
    #[serde(default)]
    pub backbone: BackboneSection,
    pub occurrence: OccurrenceSection,
    #[serde(default)]
    pub environment: EnvironmentSection,
    pub join: JoinSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TaxonomySection {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub params: Vec<(String, String)>,
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub start_offset: Option<u64>,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    #[serde(default)]
    pub species_ranks: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct BackboneSection {
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OccurrenceSection {
    pub region: Vec<(f64, f64)>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub mode: Option<DownloadMode>,
    #[serde(default)]
    pub licenses: Option<Vec<String>>,
    #[serde(default)]
    pub excluded_basis_of_record: Option<Vec<String>>,
    #[serde(default)]
    pub max_uncertainty_m: Option<f64>,
    #[serde(default)]
    pub min_centroid_distance_m: Option<f64>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub max_concurrent_jobs: Option<usize>,
    #[serde(default)]
    pub job_attempts: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EnvironmentSection {
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub datasets: Vec<DatasetEntry>,
    #[serde(default)]
    pub expected_files: Option<usize>,
    #[serde(default)]
    pub drop_layers: Vec<String>,
    #[serde(default)]
    pub filename_pattern: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetEntry {
    pub variable: String,
    pub dataset_id: String,
    #[serde(default)]
    pub timescale: Option<String>,
}

impl DatasetEntry {
    /// Entries without a timescale are taken to be monthly.
    pub fn is_monthly(&self) -> bool {
        self.timescale.as_deref().is_none_or(|timescale| {
            matches!(
                timescale.trim().to_ascii_lowercase().as_str(),
                "monthly" | "month" | "p1m"
            )
        })
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct JoinSection {
    pub target_taxon_keys: Vec<i64>,
    #[serde(default)]
    pub background_taxon_keys: Option<Vec<i64>>,
    pub start_date: String,
}

#[derive(Debug, Clone)]
pub struct TaxonomySettings {
    pub endpoint: String,
    pub params: Vec<(String, String)>,
    pub page_size: u64,
    pub start_offset: u64,
    pub cooldown: Duration,
    pub species_ranks: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct BackboneSettings {
    pub chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct OccurrenceSettings {
    pub region: SearchArea,
    pub batch_size: usize,
    pub seed: u64,
    pub mode: DownloadMode,
    pub licenses: Vec<String>,
    pub excluded_basis_of_record: Vec<String>,
    pub max_uncertainty_m: f64,
    pub min_centroid_distance_m: f64,
    pub poll_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub job_attempts: usize,
}

#[derive(Debug, Clone)]
pub struct EnvironmentSettings {
    pub root: Utf8PathBuf,
    pub datasets: Vec<DatasetEntry>,
    pub expected_files: usize,
    pub drop_layers: Vec<String>,
    pub filename_pattern: Regex,
}

impl EnvironmentSettings {
    /// Number of covariate columns a complete month stack yields.
    pub fn covariate_count(&self) -> usize {
        self.expected_files.saturating_sub(self.drop_layers.len())
    }
}

#[derive(Debug, Clone)]
pub struct JoinSettings {
    pub target_taxon_keys: BTreeSet<i64>,
    pub background_taxon_keys: Option<BTreeSet<i64>>,
    pub start_date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub run: String,
    pub workspace: Utf8PathBuf,
    pub taxonomy: TaxonomySettings,
    pub backbone: BackboneSettings,
    pub occurrence: OccurrenceSettings,
    pub environment: EnvironmentSettings,
    pub join: JoinSettings,
}

pub const DEFAULT_FILENAME_PATTERN: &str = r"(?P<layer>[A-Za-z0-9]+)_(?P<year_month>\d{6})\.[A-Za-z0-9]+$";

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("kira-sdm.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(KiraError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let run = config.run.trim().to_string();
        if run.is_empty() || run.contains(['/', '\\']) || run.starts_with('.') {
            return Err(KiraError::ConfigInvalid(format!(
                "run name must be a plain directory name: {:?}",
                config.run
            )));
        }

        let taxonomy = TaxonomySettings {
            endpoint: config
                .taxonomy
                .endpoint
                .unwrap_or_else(|| "AphiaRecordsByDate".to_string()),
            params: if config.taxonomy.params.is_empty() {
                default_taxonomy_params()
            } else {
                config.taxonomy.params
            },
            page_size: positive(config.taxonomy.page_size.unwrap_or(50), "taxonomy.page_size")?,
            start_offset: config.taxonomy.start_offset.unwrap_or(1),
            cooldown: Duration::from_secs(config.taxonomy.cooldown_secs.unwrap_or(60)),
            species_ranks: config
                .taxonomy
                .species_ranks
                .unwrap_or_else(default_species_ranks)
                .into_iter()
                .collect(),
        };

        let backbone = BackboneSettings {
            chunk_size: positive(config.backbone.chunk_size.unwrap_or(1000), "backbone.chunk_size")?,
        };

        let occ = config.occurrence;
        let max_uncertainty_m = occ.max_uncertainty_m.unwrap_or(1000.0);
        let min_centroid_distance_m = occ.min_centroid_distance_m.unwrap_or(2000.0);
        if !max_uncertainty_m.is_finite() || max_uncertainty_m <= 0.0 {
            return Err(KiraError::ConfigInvalid(
                "occurrence.max_uncertainty_m must be a positive number".to_string(),
            ));
        }
        if !min_centroid_distance_m.is_finite() || min_centroid_distance_m < 0.0 {
            return Err(KiraError::ConfigInvalid(
                "occurrence.min_centroid_distance_m must be a non-negative number".to_string(),
            ));
        }
        let occurrence = OccurrenceSettings {
            region: SearchArea::new(&occ.region)?,
            batch_size: positive(occ.batch_size.unwrap_or(20_000), "occurrence.batch_size")?,
            seed: occ.seed.unwrap_or(42),
            mode: occ.mode.unwrap_or(DownloadMode::Materialize),
            licenses: occ.licenses.unwrap_or_else(default_licenses),
            excluded_basis_of_record: occ
                .excluded_basis_of_record
                .unwrap_or_else(default_excluded_basis_of_record),
            max_uncertainty_m,
            min_centroid_distance_m,
            poll_interval: Duration::from_secs(occ.poll_interval_secs.unwrap_or(60)),
            max_concurrent_jobs: positive(
                occ.max_concurrent_jobs.unwrap_or(3),
                "occurrence.max_concurrent_jobs",
            )?,
            job_attempts: positive(occ.job_attempts.unwrap_or(2), "occurrence.job_attempts")?,
        };

        let env = config.environment;
        let pattern = env
            .filename_pattern
            .unwrap_or_else(|| DEFAULT_FILENAME_PATTERN.to_string());
        let filename_pattern = Regex::new(&pattern)
            .map_err(|err| KiraError::ConfigInvalid(format!("environment.filename_pattern: {err}")))?;
        for group in ["layer", "year_month"] {
            if !filename_pattern.capture_names().flatten().any(|name| name == group) {
                return Err(KiraError::ConfigInvalid(format!(
                    "environment.filename_pattern must define a `{group}` group"
                )));
            }
        }
        let expected_files = positive(env.expected_files.unwrap_or(19), "environment.expected_files")?;
        if env.drop_layers.len() >= expected_files {
            return Err(KiraError::ConfigInvalid(
                "environment.drop_layers leaves no covariate layers".to_string(),
            ));
        }
        if let Some(entry) = env.datasets.iter().find(|entry| !entry.is_monthly()) {
            return Err(KiraError::ConfigInvalid(format!(
                "environment dataset {} ({}) has timescale {:?}; only monthly products align with year-month keys",
                entry.dataset_id,
                entry.variable,
                entry.timescale.as_deref().unwrap_or_default()
            )));
        }
        let environment = EnvironmentSettings {
            root: match env.root {
                Some(root) => Utf8PathBuf::from(root),
                None => default_environment_root()?,
            },
            datasets: env.datasets,
            expected_files,
            drop_layers: env.drop_layers,
            filename_pattern,
        };

        if config.join.target_taxon_keys.is_empty() {
            return Err(KiraError::ConfigInvalid(
                "join.target_taxon_keys must name at least one taxon".to_string(),
            ));
        }
        let join = JoinSettings {
            target_taxon_keys: config.join.target_taxon_keys.into_iter().collect(),
            background_taxon_keys: config
                .join
                .background_taxon_keys
                .map(|keys| keys.into_iter().collect()),
            start_date: NaiveDate::parse_from_str(config.join.start_date.trim(), "%Y-%m-%d")
                .map_err(|_| KiraError::InvalidDate(config.join.start_date.clone()))?,
        };

        Ok(ResolvedConfig {
            schema_version,
            run,
            workspace: Utf8PathBuf::from(config.workspace.unwrap_or_else(|| ".kira-sdm".to_string())),
            taxonomy,
            backbone,
            occurrence,
            environment,
            join,
        })
    }
}

fn positive<T: PartialOrd + Default + Copy>(value: T, field: &str) -> Result<T, KiraError> {
    if value <= T::default() {
        return Err(KiraError::ConfigInvalid(format!("{field} must be positive")));
    }
    Ok(value)
}

fn default_environment_root() -> Result<Utf8PathBuf, KiraError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(
                dirs.home_dir()
                    .join(".cache")
                    .join("kira-sdm")
                    .join("environment"),
            )
            .ok()
        })
        .ok_or_else(|| KiraError::Filesystem("unable to resolve environment directory".to_string()))
}

pub fn default_taxonomy_params() -> Vec<(String, String)> {
    vec![
        ("startdate".to_string(), "1900-01-01T00:00:00+00:00".to_string()),
        ("marine_only".to_string(), "false".to_string()),
        ("extant_only".to_string(), "false".to_string()),
    ]
}

pub fn default_species_ranks() -> Vec<String> {
    vec![
        "Species".to_string(),
        "Subspecies".to_string(),
        "Variety".to_string(),
        "Forma".to_string(),
    ]
}

pub fn default_licenses() -> Vec<String> {
    vec![
        "CC0_1_0".to_string(),
        "CC_BY_4_0".to_string(),
        "CC_BY_NC_4_0".to_string(),
    ]
}

pub fn default_excluded_basis_of_record() -> Vec<String> {
    vec![
        "FOSSIL_SPECIMEN".to_string(),
        "LIVING_SPECIMEN".to_string(),
        "PRESERVED_SPECIMEN".to_string(),
        "MATERIAL_SAMPLE".to_string(),
        "MATERIAL_CITATION".to_string(),
    ]
}
