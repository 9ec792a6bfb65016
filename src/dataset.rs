use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use camino::Utf8Path;
use chrono::{DateTime, NaiveDate};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, Row};
use serde::Serialize;
use tracing::debug;

use crate::domain::{ObservationClass, OccurrenceStatus, YearMonth, clean_dates};
use crate::error::KiraError;
use crate::store::walk_dir;

/// Occurrence row after coercion and labelling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OccurrenceRecord {
    pub taxon_key: i64,
    pub event_date: NaiveDate,
    pub lon: f64,
    pub lat: f64,
    pub status: OccurrenceStatus,
    pub class: ObservationClass,
    pub year_month: YearMonth,
}

/// Row as stored in a partition, before any coercion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOccurrence {
    pub taxon_key: Option<i64>,
    pub event_date: Option<String>,
    pub lon: Option<f64>,
    pub lat: Option<f64>,
    pub status: Option<String>,
}

impl RawOccurrence {
    fn from_row(row: &Row) -> Self {
        let mut raw = RawOccurrence::default();
        for (name, field) in row.get_column_iter() {
            match name.to_ascii_lowercase().as_str() {
                "taxonkey" => raw.taxon_key = field_i64(field),
                "eventdate" => raw.event_date = field_date_text(field),
                "decimallongitude" => raw.lon = field_f64(field),
                "decimallatitude" => raw.lat = field_f64(field),
                "occurrencestatus" => raw.status = field_text(field),
                _ => {}
            }
        }
        raw
    }
}

fn field_i64(field: &Field) -> Option<i64> {
    match field {
        Field::Int(value) => Some(i64::from(*value)),
        Field::Long(value) => Some(*value),
        Field::UInt(value) => Some(i64::from(*value)),
        Field::Str(value) => value.trim().parse().ok(),
        _ => None,
    }
}

fn field_f64(field: &Field) -> Option<f64> {
    match field {
        Field::Double(value) => Some(*value),
        Field::Float(value) => Some(f64::from(*value)),
        Field::Int(value) => Some(f64::from(*value)),
        Field::Long(value) => Some(*value as f64),
        Field::Str(value) => value.trim().parse().ok(),
        _ => None,
    }
    .filter(|value| value.is_finite())
}

fn field_text(field: &Field) -> Option<String> {
    match field {
        Field::Str(value) => Some(value.clone()),
        _ => None,
    }
}

/// Event dates arrive either as ISO text or as typed temporal columns; the
/// typed forms are rendered as `YYYY-MM-DD` so one coercion rule applies.
fn field_date_text(field: &Field) -> Option<String> {
    let date = match field {
        Field::Str(value) => return Some(value.clone()),
        Field::Date(days) => NaiveDate::from_num_days_from_ce_opt(719_163 + *days)?,
        Field::TimestampMillis(ms) => DateTime::from_timestamp_millis(*ms)?.date_naive(),
        Field::TimestampMicros(us) => DateTime::from_timestamp_micros(*us)?.date_naive(),
        _ => return None,
    };
    Some(date.format("%Y-%m-%d").to_string())
}

/// Which taxon keys count as target and which as background.
#[derive(Debug, Clone)]
pub struct TaxonSplit {
    pub target: BTreeSet<i64>,
    /// `None` means every non-target taxon in the dataset is background.
    pub background: Option<BTreeSet<i64>>,
}

impl TaxonSplit {
    pub fn classify(&self, taxon_key: i64) -> Option<ObservationClass> {
        if self.target.contains(&taxon_key) {
            return Some(ObservationClass::Target);
        }
        match &self.background {
            Some(keys) if !keys.contains(&taxon_key) => None,
            _ => Some(ObservationClass::Background),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanFilter {
    pub split: TaxonSplit,
    pub start_date: NaiveDate,
}

/// Row attrition during a scan, in the order filters are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub files: usize,
    pub rows_scanned: usize,
    pub missing_fields: usize,
    pub outside_taxa: usize,
    pub not_present: usize,
    pub unparseable_dates: usize,
    pub before_start: usize,
    pub target_rows: usize,
    pub background_rows: usize,
}

impl ScanFilter {
    /// Applies the filter chain to one raw row, charging a rejection to
    /// `stats`.
    pub fn admit(&self, raw: RawOccurrence, stats: &mut ScanStats) -> Option<OccurrenceRecord> {
        let (Some(taxon_key), Some(lon), Some(lat)) = (raw.taxon_key, raw.lon, raw.lat) else {
            stats.missing_fields += 1;
            return None;
        };
        let Some(class) = self.split.classify(taxon_key) else {
            stats.outside_taxa += 1;
            return None;
        };
        let status = raw
            .status
            .as_deref()
            .and_then(|status| status.parse::<OccurrenceStatus>().ok());
        if status != Some(OccurrenceStatus::Present) {
            stats.not_present += 1;
            return None;
        }
        let Some(event_date) = raw.event_date.as_deref().and_then(clean_dates) else {
            stats.unparseable_dates += 1;
            return None;
        };
        if event_date < self.start_date {
            stats.before_start += 1;
            return None;
        }
        match class {
            ObservationClass::Target => stats.target_rows += 1,
            ObservationClass::Background => stats.background_rows += 1,
        }
        Some(OccurrenceRecord {
            taxon_key,
            event_date,
            lon,
            lat,
            status: OccurrenceStatus::Present,
            class,
            year_month: YearMonth::from_date(event_date),
        })
    }
}

/// Partitioned occurrence dataset: `batch-*/` directories of parquet parts.
#[derive(Debug, Clone)]
pub struct OccurrenceDataset {
    files: Vec<PathBuf>,
}

impl OccurrenceDataset {
    pub fn open(root: &Utf8Path) -> Result<Self, KiraError> {
        if !root.as_std_path().exists() {
            return Err(KiraError::ArtifactNotFound(root.to_string()));
        }
        let files = walk_dir(root.as_std_path())?
            .into_iter()
            .filter(|path| path.is_file() && is_partition_part(root.as_std_path(), path))
            .collect();
        Ok(Self { files })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Streams every row through `filter`, keeping only admitted records in
    /// memory.
    pub fn scan(&self, filter: &ScanFilter) -> Result<(Vec<OccurrenceRecord>, ScanStats), KiraError> {
        let mut stats = ScanStats::default();
        let mut records = Vec::new();
        for path in &self.files {
            let file = File::open(path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let reader = SerializedFileReader::new(file)
                .map_err(|err| KiraError::Parquet(format!("{}: {err}", path.display())))?;
            let rows = reader
                .get_row_iter(None)
                .map_err(|err| KiraError::Parquet(format!("{}: {err}", path.display())))?;
            for row in rows {
                let row = row.map_err(|err| KiraError::Parquet(format!("{}: {err}", path.display())))?;
                stats.rows_scanned += 1;
                if let Some(record) = filter.admit(RawOccurrence::from_row(&row), &mut stats) {
                    records.push(record);
                }
            }
            stats.files += 1;
            debug!(file = %path.display(), kept = records.len(), "partition scanned");
        }
        Ok((records, stats))
    }
}

fn is_partition_part(root: &Path, path: &Path) -> bool {
    let in_batch = path
        .strip_prefix(root)
        .ok()
        .and_then(|relative| relative.components().next())
        .and_then(|first| first.as_os_str().to_str())
        .is_some_and(|name| name.starts_with("batch-"));
    in_batch
        && path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("parquet"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(background: Option<BTreeSet<i64>>) -> ScanFilter {
        ScanFilter {
            split: TaxonSplit {
                target: BTreeSet::from([1]),
                background,
            },
            start_date: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
        }
    }

    fn raw(taxon_key: i64, date: &str) -> RawOccurrence {
        RawOccurrence {
            taxon_key: Some(taxon_key),
            event_date: Some(date.to_string()),
            lon: Some(4.5),
            lat: Some(52.1),
            status: Some("PRESENT".to_string()),
        }
    }

    #[test]
    fn admits_and_labels_rows() {
        let mut stats = ScanStats::default();
        let filter = filter(None);
        let target = filter.admit(raw(1, "2020-01-15"), &mut stats).unwrap();
        assert_eq!(target.class, ObservationClass::Target);
        assert_eq!(target.year_month.to_string(), "202001");
        let background = filter.admit(raw(2, "2020-02"), &mut stats).unwrap();
        assert_eq!(background.class, ObservationClass::Background);
        assert_eq!(stats.target_rows, 1);
        assert_eq!(stats.background_rows, 1);
    }

    #[test]
    fn rejections_are_counted_by_reason() {
        let mut stats = ScanStats::default();
        let filter = filter(Some(BTreeSet::from([2])));
        assert!(filter.admit(raw(3, "2020-01-01"), &mut stats).is_none());
        assert!(filter.admit(raw(2, "sometime"), &mut stats).is_none());
        assert!(filter.admit(raw(2, "1999-12-31"), &mut stats).is_none());
        let mut absent = raw(1, "2020-01-01");
        absent.status = Some("ABSENT".to_string());
        assert!(filter.admit(absent, &mut stats).is_none());
        let mut no_coords = raw(1, "2020-01-01");
        no_coords.lat = None;
        assert!(filter.admit(no_coords, &mut stats).is_none());

        assert_eq!(stats.outside_taxa, 1);
        assert_eq!(stats.unparseable_dates, 1);
        assert_eq!(stats.before_start, 1);
        assert_eq!(stats.not_present, 1);
        assert_eq!(stats.missing_fields, 1);
    }

    #[test]
    fn typed_dates_render_as_iso_text() {
        assert_eq!(field_date_text(&Field::Date(18_262)).as_deref(), Some("2020-01-01"));
        assert_eq!(
            field_date_text(&Field::TimestampMillis(1_579_046_400_000)).as_deref(),
            Some("2020-01-15")
        );
    }
}
