use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::OccurrenceSettings;
use crate::domain::{DownloadMode, JobStatus};
use crate::error::KiraError;
use crate::fs_util;
use crate::gbif::{DownloadRequest, OccurrenceDownloadClient};
use crate::store::Store;

/// Occurrence-archive predicate language, serialized as the archive's JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Predicate {
    And { predicates: Vec<Predicate> },
    Or { predicates: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
    Equals { key: String, value: String },
    In { key: String, values: Vec<String> },
    Within { geometry: String },
    LessThan { key: String, value: String },
    GreaterThan { key: String, value: String },
    IsNull { parameter: String },
}

impl Predicate {
    fn equals(key: &str, value: &str) -> Self {
        Predicate::Equals {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn any_of<T: ToString>(key: &str, values: &[T]) -> Self {
        Predicate::In {
            key: key.to_string(),
            values: values.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Full predicate for one batch of taxon keys. Thresholds stay numeric until
/// here; the archive's predicate language carries every value as text.
pub fn build_predicate(taxon_keys: &[i64], settings: &OccurrenceSettings) -> Predicate {
    Predicate::And {
        predicates: vec![
            Predicate::equals("OCCURRENCE_STATUS", "PRESENT"),
            Predicate::any_of("TAXON_KEY", taxon_keys),
            Predicate::Within {
                geometry: settings.region.to_wkt(),
            },
            Predicate::any_of("LICENSE", &settings.licenses),
            Predicate::Not {
                predicate: Box::new(Predicate::any_of(
                    "BASIS_OF_RECORD",
                    &settings.excluded_basis_of_record,
                )),
            },
            Predicate::equals("HAS_GEOSPATIAL_ISSUE", "false"),
            Predicate::equals("HAS_COORDINATE", "true"),
            Predicate::Or {
                predicates: vec![
                    Predicate::LessThan {
                        key: "COORDINATE_UNCERTAINTY_IN_METERS".to_string(),
                        value: settings.max_uncertainty_m.to_string(),
                    },
                    Predicate::IsNull {
                        parameter: "COORDINATE_UNCERTAINTY_IN_METERS".to_string(),
                    },
                ],
            },
            Predicate::GreaterThan {
                key: "DISTANCE_FROM_CENTROID_IN_METERS".to_string(),
                value: settings.min_centroid_distance_m.to_string(),
            },
        ],
    }
}

/// Shuffles the key universe with a seeded RNG, then slices it into
/// batches. The universe is sorted first so the plan depends only on the
/// key set, the seed and the batch size.
pub fn plan_batches(keys: &BTreeSet<i64>, batch_size: usize, seed: u64) -> Vec<Vec<i64>> {
    let mut shuffled = keys.iter().copied().collect::<Vec<_>>();
    let mut rng = StdRng::seed_from_u64(seed);
    shuffled.shuffle(&mut rng);
    shuffled
        .chunks(batch_size.max(1))
        .map(<[i64]>::to_vec)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub batch_index: usize,
    pub taxon_keys: Vec<i64>,
    pub status: JobStatus,
    pub attempts: usize,
    pub download_key: Option<String>,
    pub result_location: Option<String>,
    pub message: Option<String>,
}

impl DownloadJob {
    fn pending(batch_index: usize, taxon_keys: Vec<i64>) -> Self {
        Self {
            batch_index,
            taxon_keys,
            status: JobStatus::Pending,
            attempts: 0,
            download_key: None,
            result_location: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    pub seed: u64,
    pub batch_size: usize,
    pub universe_size: usize,
    pub mode: DownloadMode,
    pub jobs: Vec<DownloadJob>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub jobs: Vec<DownloadJob>,
    pub failures: Vec<BatchFailure>,
}

impl DownloadReport {
    fn from_jobs(jobs: Vec<DownloadJob>) -> Self {
        let failures = jobs
            .iter()
            .filter(|job| job.status == JobStatus::Failed)
            .map(|job| BatchFailure {
                batch_index: job.batch_index,
                message: job.message.clone().unwrap_or_default(),
            })
            .collect();
        Self { jobs, failures }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.jobs.iter().all(|job| job.status.is_terminal())
    }
}

#[derive(Debug, Clone)]
pub struct RequestIdentity {
    pub creator: String,
    pub email: String,
}

pub struct OccurrenceDownloader<'a, C: OccurrenceDownloadClient + ?Sized> {
    client: &'a C,
    store: &'a Store,
    settings: &'a OccurrenceSettings,
    identity: RequestIdentity,
}

impl<'a, C: OccurrenceDownloadClient + ?Sized> OccurrenceDownloader<'a, C> {
    pub fn new(
        client: &'a C,
        store: &'a Store,
        settings: &'a OccurrenceSettings,
        identity: RequestIdentity,
    ) -> Self {
        Self {
            client,
            store,
            settings,
            identity,
        }
    }

    /// Plans batches over `keys` and runs every job (or only `only` when
    /// given), at most `max_concurrent_jobs` at a time. Failed batches are
    /// reported, never dropped, and never stop their siblings.
    pub fn run(
        &self,
        keys: &BTreeSet<i64>,
        only: Option<&BTreeSet<usize>>,
    ) -> Result<DownloadReport, KiraError> {
        let plan = plan_batches(keys, self.settings.batch_size, self.settings.seed);
        let previous = match only {
            Some(set) => {
                if let Some(index) = set.iter().find(|index| **index >= plan.len()) {
                    return Err(KiraError::ConfigInvalid(format!(
                        "batch {index} does not exist; the plan has {} batches",
                        plan.len()
                    )));
                }
                self.load_compatible_manifest(&plan)?
            }
            None => BTreeMap::new(),
        };
        if only.is_none() {
            Store::clear_dir(&self.store.occurrences_dir())?;
        }

        let (to_run, mut kept): (Vec<DownloadJob>, Vec<DownloadJob>) = plan
            .into_iter()
            .enumerate()
            .map(|(index, batch)| match previous.get(&index) {
                Some(job) if !only.is_some_and(|set| set.contains(&index)) => job.clone(),
                _ => DownloadJob::pending(index, batch),
            })
            .partition(|job| only.is_none_or(|set| set.contains(&job.batch_index)));
        info!(batches = to_run.len(), keys = keys.len(), "submitting download batches");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.max_concurrent_jobs)
            .build()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let finished: Vec<DownloadJob> =
            pool.install(|| to_run.into_par_iter().map(|job| self.run_batch(job)).collect());

        kept.extend(finished);
        kept.sort_by_key(|job| job.batch_index);
        self.write_manifest(keys.len(), &kept)?;
        Ok(DownloadReport::from_jobs(kept))
    }

    /// Downloads and extracts every completed job that so far only has an
    /// archive key.
    pub fn materialize_pending(&self) -> Result<DownloadReport, KiraError> {
        let manifest: JobManifest = Store::read_json(&self.store.jobs_manifest_path())?;
        let universe_size = manifest.universe_size;
        let jobs = manifest
            .jobs
            .into_iter()
            .map(|mut job| {
                let pending = job.status == JobStatus::Done && job.result_location.is_none();
                if let (true, Some(key)) = (pending, job.download_key.clone()) {
                    match self.materialize(job.batch_index, &key) {
                        Ok(location) => job.result_location = Some(location),
                        Err(err) => {
                            warn!(batch = job.batch_index, error = %err, "materialization failed");
                            job.status = JobStatus::Failed;
                            job.message = Some(err.to_string());
                        }
                    }
                }
                job
            })
            .collect::<Vec<_>>();
        self.write_manifest(universe_size, &jobs)?;
        Ok(DownloadReport::from_jobs(jobs))
    }

    fn run_batch(&self, mut job: DownloadJob) -> DownloadJob {
        while job.attempts < self.settings.job_attempts {
            job.attempts += 1;
            match self.attempt(&mut job) {
                Ok(()) => {
                    job.status = JobStatus::Done;
                    job.message = None;
                    info!(batch = job.batch_index, attempts = job.attempts, "download batch done");
                    return job;
                }
                Err(err) => {
                    warn!(batch = job.batch_index, attempt = job.attempts, error = %err, "download batch failed");
                    job.status = JobStatus::Failed;
                    job.message = Some(
                        KiraError::DownloadJob {
                            batch: job.batch_index,
                            message: err.to_string(),
                        }
                        .to_string(),
                    );
                }
            }
        }
        job
    }

    fn attempt(&self, job: &mut DownloadJob) -> Result<(), KiraError> {
        let request = DownloadRequest {
            creator: self.identity.creator.clone(),
            notification_addresses: vec![self.identity.email.clone()],
            send_notification: false,
            format: "SIMPLE_PARQUET".to_string(),
            predicate: build_predicate(&job.taxon_keys, self.settings),
        };
        let key = self.client.submit(&request)?;
        job.download_key = Some(key.clone());
        job.result_location = None;
        job.status = JobStatus::Running;

        let status = self.poll(&key)?;
        if status == JobStatus::Failed {
            return Err(KiraError::DownloadJob {
                batch: job.batch_index,
                message: format!("archive job {key} ended unsuccessfully"),
            });
        }
        if self.settings.mode == DownloadMode::Materialize {
            job.result_location = Some(self.materialize(job.batch_index, &key)?);
        }
        Ok(())
    }

    fn poll(&self, key: &str) -> Result<JobStatus, KiraError> {
        loop {
            let status = self.client.status(key)?;
            if status.is_terminal() {
                return Ok(status);
            }
            thread::sleep(self.settings.poll_interval);
        }
    }

    fn materialize(&self, batch_index: usize, key: &str) -> Result<String, KiraError> {
        let dest = self.store.batch_dir(batch_index);
        let scratch = Store::staging_dir_for(&dest)?;
        let archive = scratch.path().join(format!("{key}.zip"));
        self.client.fetch_archive(key, &archive)?;

        let staging = Store::staging_dir_for(&dest)?;
        let files = fs_util::extract_parquet_parts(&archive, staging.path())?;
        Store::commit_partition(staging, &dest)?;
        info!(batch = batch_index, files, "batch partition written");
        Ok(dest.to_string())
    }

    /// Loads the previous manifest for a targeted rerun. Every batch must
    /// hold exactly the keys the current plan assigns it, otherwise keys
    /// would be lost or downloaded twice.
    fn load_compatible_manifest(
        &self,
        plan: &[Vec<i64>],
    ) -> Result<BTreeMap<usize, DownloadJob>, KiraError> {
        let path = self.store.jobs_manifest_path();
        if !path.as_std_path().exists() {
            return Ok(BTreeMap::new());
        }
        let manifest: JobManifest = Store::read_json(&path)?;
        let universe_size = plan.iter().map(Vec::len).sum::<usize>();
        let same_batches = manifest.jobs.len() == plan.len()
            && manifest
                .jobs
                .iter()
                .all(|job| plan.get(job.batch_index) == Some(&job.taxon_keys));
        if manifest.seed != self.settings.seed
            || manifest.batch_size != self.settings.batch_size
            || manifest.universe_size != universe_size
            || !same_batches
        {
            return Err(KiraError::ConfigInvalid(
                "batch plan changed since the last download; rerun all batches".to_string(),
            ));
        }
        Ok(manifest
            .jobs
            .into_iter()
            .map(|job| (job.batch_index, job))
            .collect())
    }

    fn write_manifest(&self, universe_size: usize, jobs: &[DownloadJob]) -> Result<(), KiraError> {
        let manifest = JobManifest {
            seed: self.settings.seed,
            batch_size: self.settings.batch_size,
            universe_size,
            mode: self.settings.mode,
            jobs: jobs.to_vec(),
        };
        Store::write_json(&self.store.jobs_manifest_path(), &manifest)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::SearchArea;

    fn settings() -> OccurrenceSettings {
        OccurrenceSettings {
            region: SearchArea::new(&[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)]).unwrap(),
            batch_size: 3,
            seed: 7,
            mode: DownloadMode::Materialize,
            licenses: vec!["CC0_1_0".to_string()],
            excluded_basis_of_record: vec!["FOSSIL_SPECIMEN".to_string()],
            max_uncertainty_m: 1000.0,
            min_centroid_distance_m: 2000.0,
            poll_interval: std::time::Duration::ZERO,
            max_concurrent_jobs: 2,
            job_attempts: 2,
        }
    }

    #[test]
    fn batches_cover_universe_exactly_once() {
        let keys = (1..=10).collect::<BTreeSet<i64>>();
        let plan = plan_batches(&keys, 3, 7);
        assert_eq!(plan.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3, 3, 1]);
        let flattened = plan.iter().flatten().copied().collect::<BTreeSet<_>>();
        assert_eq!(flattened, keys);
        assert_eq!(plan, plan_batches(&keys, 3, 7));
    }

    #[test]
    fn predicate_serializes_to_archive_json() {
        let predicate = build_predicate(&[11, 12], &settings());
        let value = serde_json::to_value(&predicate).unwrap();
        assert_eq!(value["type"], "and");
        let parts = value["predicates"].as_array().unwrap();
        assert_eq!(parts[1], json!({ "type": "in", "key": "TAXON_KEY", "values": ["11", "12"] }));
        assert_eq!(parts[4]["type"], "not");
        assert_eq!(parts[4]["predicate"]["key"], "BASIS_OF_RECORD");
        assert_eq!(
            parts[7]["predicates"][1],
            json!({ "type": "isNull", "parameter": "COORDINATE_UNCERTAINTY_IN_METERS" })
        );
        assert_eq!(
            parts[8],
            json!({ "type": "greaterThan", "key": "DISTANCE_FROM_CENTROID_IN_METERS", "value": "2000" })
        );
    }
}
