use std::collections::BTreeMap;
use std::fs::File;

use camino::Utf8Path;
use chrono::NaiveDate;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{ObservationClass, YearMonth};
use crate::error::KiraError;
use crate::joiner::JoinedObservation;
use crate::store::Store;

const FIXED_COLUMNS: [&str; 6] = ["class", "taxon_key", "event_date", "year_month", "lon", "lat"];

/// Writes a typed table as CSV, replacing any previous file at `path`.
pub fn write_records<T: Serialize>(path: &Utf8Path, rows: &[T]) -> Result<(), KiraError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer
            .serialize(row)
            .map_err(|err| KiraError::Table(err.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| KiraError::Table(err.to_string()))?;
    Store::write_bytes_atomic(path, &bytes)
}

pub fn read_records<T: DeserializeOwned>(path: &Utf8Path) -> Result<Vec<T>, KiraError> {
    let file = open(path)?;
    let mut reader = csv::Reader::from_reader(file);
    reader
        .deserialize()
        .map(|row| row.map_err(|err| KiraError::Table(format!("{path}: {err}"))))
        .collect()
}

/// Joined observations with one column per covariate, in `covariates`
/// order.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationTable {
    pub covariates: Vec<String>,
    pub rows: Vec<JoinedObservation>,
}

pub fn write_observations(path: &Utf8Path, table: &ObservationTable) -> Result<(), KiraError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let header = FIXED_COLUMNS
        .iter()
        .map(|name| name.to_string())
        .chain(table.covariates.iter().cloned())
        .collect::<Vec<_>>();
    writer
        .write_record(&header)
        .map_err(|err| KiraError::Table(err.to_string()))?;

    for row in &table.rows {
        let mut record = vec![
            row.class.label().to_string(),
            row.taxon_key.to_string(),
            row.event_date.format("%Y-%m-%d").to_string(),
            row.year_month.to_string(),
            row.lon.to_string(),
            row.lat.to_string(),
        ];
        for name in &table.covariates {
            let value = row.covariates.get(name).ok_or_else(|| {
                KiraError::Table(format!("observation is missing covariate {name}"))
            })?;
            record.push(value.to_string());
        }
        writer
            .write_record(&record)
            .map_err(|err| KiraError::Table(err.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| KiraError::Table(err.to_string()))?;
    Store::write_bytes_atomic(path, &bytes)
}

pub fn read_observations(path: &Utf8Path) -> Result<ObservationTable, KiraError> {
    let file = open(path)?;
    let mut reader = csv::Reader::from_reader(file);
    let header = reader
        .headers()
        .map_err(|err| KiraError::Table(format!("{path}: {err}")))?
        .clone();
    let fixed = header.iter().take(FIXED_COLUMNS.len()).collect::<Vec<_>>();
    if fixed != FIXED_COLUMNS {
        return Err(KiraError::Table(format!(
            "{path}: unexpected leading columns {fixed:?}"
        )));
    }
    let covariates = header
        .iter()
        .skip(FIXED_COLUMNS.len())
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| KiraError::Table(format!("{path}: {err}")))?;
        let field = |index: usize| record.get(index).unwrap_or_default();
        let label = field(0)
            .parse::<u8>()
            .map_err(|err| KiraError::Table(format!("{path}: class: {err}")))?;
        let mut values = BTreeMap::new();
        for (offset, name) in covariates.iter().enumerate() {
            let value = parse_f64(field(FIXED_COLUMNS.len() + offset), name, path)?;
            values.insert(name.clone(), value);
        }
        rows.push(JoinedObservation {
            class: ObservationClass::from_label(label)?,
            taxon_key: field(1)
                .parse()
                .map_err(|err| KiraError::Table(format!("{path}: taxon_key: {err}")))?,
            event_date: NaiveDate::parse_from_str(field(2), "%Y-%m-%d")
                .map_err(|err| KiraError::Table(format!("{path}: event_date: {err}")))?,
            year_month: field(3).parse::<YearMonth>()?,
            lon: parse_f64(field(4), "lon", path)?,
            lat: parse_f64(field(5), "lat", path)?,
            covariates: values,
        });
    }
    Ok(ObservationTable { covariates, rows })
}

fn parse_f64(value: &str, column: &str, path: &Utf8Path) -> Result<f64, KiraError> {
    value
        .parse::<f64>()
        .map_err(|err| KiraError::Table(format!("{path}: {column}: {err}")))
}

fn open(path: &Utf8Path) -> Result<File, KiraError> {
    if !path.as_std_path().exists() {
        return Err(KiraError::ArtifactNotFound(path.to_string()));
    }
    File::open(path.as_std_path()).map_err(|err| KiraError::Filesystem(err.to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;

    fn observation(covariates: &[(&str, f64)]) -> JoinedObservation {
        JoinedObservation {
            class: ObservationClass::Background,
            taxon_key: 7,
            event_date: NaiveDate::from_ymd_opt(2020, 3, 1).unwrap(),
            year_month: "202003".parse().unwrap(),
            lon: -1.5,
            lat: 50.25,
            covariates: covariates
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
        }
    }

    #[test]
    fn observation_header_lists_covariates_after_fixed_columns() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("obs.csv")).unwrap();
        let table = ObservationTable {
            covariates: vec!["sal".to_string(), "temp".to_string()],
            rows: vec![observation(&[("sal", 35.0), ("temp", 8.5)])],
        };
        write_observations(&path, &table).unwrap();

        let text = std::fs::read_to_string(path.as_std_path()).unwrap();
        assert_eq!(
            text.lines().next(),
            Some("class,taxon_key,event_date,year_month,lon,lat,sal,temp")
        );
        assert_eq!(text.lines().nth(1), Some("0,7,2020-03-01,202003,-1.5,50.25,35,8.5"));
    }

    #[test]
    fn row_without_a_listed_covariate_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("obs.csv")).unwrap();
        let table = ObservationTable {
            covariates: vec!["sal".to_string(), "temp".to_string()],
            rows: vec![observation(&[("sal", 35.0)])],
        };
        let err = write_observations(&path, &table).unwrap_err();
        assert_matches!(err, KiraError::Table(message) if message.contains("temp"));
        assert!(!path.as_std_path().exists());
    }

    #[test]
    fn foreign_csv_is_not_read_as_observations() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("other.csv")).unwrap();
        std::fs::write(path.as_std_path(), "name,value\na,1\n").unwrap();
        assert_matches!(read_observations(&path), Err(KiraError::Table(_)));
        assert_matches!(
            read_observations(&path.with_file_name("absent.csv")),
            Err(KiraError::ArtifactNotFound(_))
        );
    }
}
