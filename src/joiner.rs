use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{EnvironmentSettings, JoinSettings};
use crate::dataset::{OccurrenceDataset, OccurrenceRecord, ScanFilter, ScanStats, TaxonSplit};
use crate::domain::{ObservationClass, YearMonth};
use crate::environment::{EnvironmentIndex, GridReader, StackLoader};
use crate::error::KiraError;
use crate::store::{Store, walk_dir};
use crate::table::{ObservationTable, read_observations, write_observations};

/// One occurrence paired with its own month's covariates. Only complete
/// rows exist; a point missing any covariate never becomes one.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedObservation {
    pub class: ObservationClass,
    pub taxon_key: i64,
    pub event_date: NaiveDate,
    pub year_month: YearMonth,
    pub lon: f64,
    pub lat: f64,
    pub covariates: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthReport {
    pub year_month: YearMonth,
    pub points: usize,
    pub extracted: usize,
    pub dropped_missing: usize,
    pub retained: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthFailure {
    pub year_month: YearMonth,
    pub points: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinReport {
    pub scan: ScanStats,
    pub months: Vec<MonthReport>,
    pub failures: Vec<MonthFailure>,
    pub rows_extracted: usize,
    pub rows_dropped_missing: usize,
    /// Rows in the rebuilt observation table, across every partition on
    /// disk (not only the months joined in this run).
    pub rows_written: usize,
    pub covariates: Vec<String>,
}

impl JoinReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct EnvironmentalJoiner<'a, R: GridReader + ?Sized> {
    store: &'a Store,
    reader: &'a R,
    environment: &'a EnvironmentSettings,
    join: &'a JoinSettings,
}

impl<'a, R: GridReader + ?Sized> EnvironmentalJoiner<'a, R> {
    pub fn new(
        store: &'a Store,
        reader: &'a R,
        environment: &'a EnvironmentSettings,
        join: &'a JoinSettings,
    ) -> Self {
        Self {
            store,
            reader,
            environment,
            join,
        }
    }

    /// Joins every year-month present in the filtered occurrence set, or
    /// only `only` when given. Each month is written as its own partition;
    /// the observation table is then rebuilt from all partitions on disk.
    /// A month whose stack cannot be assembled is reported in `failures`
    /// and leaves no partition behind.
    pub fn run(&self, only: Option<&BTreeSet<YearMonth>>) -> Result<JoinReport, KiraError> {
        let dataset = OccurrenceDataset::open(&self.store.occurrences_dir())?;
        let filter = ScanFilter {
            split: TaxonSplit {
                target: self.join.target_taxon_keys.clone(),
                background: self.join.background_taxon_keys.clone(),
            },
            start_date: self.join.start_date,
        };
        let (records, scan) = dataset.scan(&filter)?;
        info!(
            files = scan.files,
            scanned = scan.rows_scanned,
            target = scan.target_rows,
            background = scan.background_rows,
            "occurrence scan finished"
        );

        let mut by_month: BTreeMap<YearMonth, Vec<OccurrenceRecord>> = BTreeMap::new();
        for record in records {
            if only.is_none_or(|months| months.contains(&record.year_month)) {
                by_month.entry(record.year_month).or_default().push(record);
            }
        }
        if let Some(months) = only {
            for missing in months.iter().filter(|month| !by_month.contains_key(month)) {
                warn!(year_month = %missing, "requested month has no occurrences");
            }
        }

        let months_dir = self.store.joined_months_dir();
        if only.is_none() {
            Store::clear_dir(&months_dir)?;
        }
        Store::ensure_dir(&months_dir)?;

        let index = EnvironmentIndex::build(
            &self.environment.root,
            &self.environment.filename_pattern,
            &self.environment.datasets,
        )?;
        let loader = StackLoader::new(&index, self.reader, self.environment);

        let outcomes: Vec<(YearMonth, usize, Result<MonthReport, KiraError>)> = by_month
            .into_par_iter()
            .map(|(year_month, points)| {
                let count = points.len();
                (year_month, count, self.join_month(&loader, year_month, points))
            })
            .collect();

        let mut months = Vec::new();
        let mut failures = Vec::new();
        for (year_month, points, outcome) in outcomes {
            match outcome {
                Ok(report) => months.push(report),
                Err(err) => {
                    warn!(%year_month, error = %err, "month join failed");
                    self.discard_partition(year_month)?;
                    failures.push(MonthFailure {
                        year_month,
                        points,
                        message: err.to_string(),
                    });
                }
            }
        }

        let table = self.rebuild_observations()?;
        let report = JoinReport {
            scan,
            rows_extracted: months.iter().map(|month| month.extracted).sum(),
            rows_dropped_missing: months.iter().map(|month| month.dropped_missing).sum(),
            rows_written: table.rows.len(),
            covariates: table.covariates,
            months,
            failures,
        };
        Store::write_json(&self.store.join_report_path(), &report)?;
        Ok(report)
    }

    fn join_month(
        &self,
        loader: &StackLoader<'_, R>,
        year_month: YearMonth,
        mut points: Vec<OccurrenceRecord>,
    ) -> Result<MonthReport, KiraError> {
        let stack = loader.load(year_month)?;
        // Targets first, then background; order within each class is scan order.
        points.sort_by_key(|point| std::cmp::Reverse(point.class.label()));

        let extracted = points
            .iter()
            .map(|point| (point, stack.extract(point.lon, point.lat)))
            .collect::<Vec<_>>();
        let extracted_count = extracted.len();

        let rows = extracted
            .into_iter()
            .filter_map(|(point, values)| {
                let covariates = values
                    .into_iter()
                    .map(|(name, value)| value.map(|value| (name, value)))
                    .collect::<Option<BTreeMap<_, _>>>()?;
                Some(JoinedObservation {
                    class: point.class,
                    taxon_key: point.taxon_key,
                    event_date: point.event_date,
                    year_month,
                    lon: point.lon,
                    lat: point.lat,
                    covariates,
                })
            })
            .collect::<Vec<_>>();

        let report = MonthReport {
            year_month,
            points: points.len(),
            extracted: extracted_count,
            dropped_missing: extracted_count - rows.len(),
            retained: rows.len(),
        };
        write_observations(
            &self.store.month_partition_path(year_month),
            &ObservationTable {
                covariates: stack.layer_names(),
                rows,
            },
        )?;
        info!(
            %year_month,
            points = report.points,
            retained = report.retained,
            dropped = report.dropped_missing,
            "month joined"
        );
        Ok(report)
    }

    fn discard_partition(&self, year_month: YearMonth) -> Result<(), KiraError> {
        let path = self.store.month_partition_path(year_month);
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path()).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    /// Concatenates every month partition into the observation table: all
    /// target rows, then all background rows, each in year-month order.
    fn rebuild_observations(&self) -> Result<ObservationTable, KiraError> {
        let mut covariates: Option<Vec<String>> = None;
        let mut rows = Vec::new();
        for path in walk_dir(self.store.joined_months_dir().as_std_path())? {
            if path.extension().is_none_or(|ext| ext != "csv") {
                continue;
            }
            let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
                continue;
            };
            let partition = read_observations(&path)?;
            match &covariates {
                Some(expected) if *expected != partition.covariates => {
                    return Err(KiraError::Table(format!(
                        "{path}: covariates {:?} differ from {:?}",
                        partition.covariates, expected
                    )));
                }
                Some(_) => {}
                None => covariates = Some(partition.covariates.clone()),
            }
            rows.extend(partition.rows);
        }
        rows.sort_by_key(|row| (std::cmp::Reverse(row.class.label()), row.year_month));
        let table = ObservationTable {
            covariates: covariates.unwrap_or_default(),
            rows,
        };
        write_observations(&self.store.observations_path(), &table)?;
        Ok(table)
    }
}
