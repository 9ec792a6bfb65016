mod common;

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use assert_matches::assert_matches;
use serde_json::Value;
use zip::write::SimpleFileOptions;

use kira_sdm_pipeline::domain::JobStatus;
use kira_sdm_pipeline::error::KiraError;
use kira_sdm_pipeline::gbif::{DownloadRequest, OccurrenceDownloadClient};
use kira_sdm_pipeline::occurrence::{OccurrenceDownloader, RequestIdentity};
use kira_sdm_pipeline::store::Store;

use common::{config_json, resolve};

fn taxon_keys(predicate: &Value) -> Option<Vec<i64>> {
    match predicate {
        Value::Object(map) if map.get("key") == Some(&Value::from("TAXON_KEY")) => map
            .get("values")?
            .as_array()?
            .iter()
            .map(|value| value.as_str()?.parse().ok())
            .collect(),
        Value::Object(map) => map.values().find_map(taxon_keys),
        Value::Array(items) => items.iter().find_map(taxon_keys),
        _ => None,
    }
}

/// Jobs whose batch holds a poisoned key end FAILED on the service side.
#[derive(Default)]
struct ArchiveService {
    poisoned: Mutex<BTreeSet<i64>>,
    submissions: Mutex<Vec<Vec<i64>>>,
}

impl OccurrenceDownloadClient for ArchiveService {
    fn submit(&self, request: &DownloadRequest) -> Result<String, KiraError> {
        assert_eq!(request.format, "SIMPLE_PARQUET");
        assert_eq!(request.notification_addresses, vec!["ops@example.org".to_string()]);
        let predicate = serde_json::to_value(&request.predicate).unwrap();
        let keys = taxon_keys(&predicate).unwrap();
        self.submissions.lock().unwrap().push(keys.clone());
        let first = keys.iter().min().unwrap();
        let doomed = keys
            .iter()
            .any(|key| self.poisoned.lock().unwrap().contains(key));
        Ok(if doomed {
            format!("job-{first}-doomed")
        } else {
            format!("job-{first}")
        })
    }

    fn status(&self, key: &str) -> Result<JobStatus, KiraError> {
        Ok(if key.ends_with("-doomed") {
            JobStatus::Failed
        } else {
            JobStatus::Done
        })
    }

    fn fetch_archive(&self, key: &str, destination: &Path) -> Result<(), KiraError> {
        let file = fs::File::create(destination).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        writer.start_file("occurrence.parquet/000000", options).unwrap();
        writer.write_all(format!("PAR1 {key}").as_bytes()).unwrap();
        writer.start_file("metadata.xml", options).unwrap();
        writer.write_all(b"<eml/>").unwrap();
        writer.finish().unwrap();
        Ok(())
    }
}

fn identity() -> RequestIdentity {
    RequestIdentity {
        creator: "ops".to_string(),
        email: "ops@example.org".to_string(),
    }
}

#[test]
fn failed_batch_is_reported_and_siblings_finish() {
    let temp = tempfile::tempdir().unwrap();
    let config = resolve(config_json(temp.path()));
    let store = Store::new(&config.workspace, &config.run);
    let service = ArchiveService::default();
    service.poisoned.lock().unwrap().insert(3);
    let keys = (1..=5).collect::<BTreeSet<i64>>();

    let downloader = OccurrenceDownloader::new(&service, &store, &config.occurrence, identity());
    let report = downloader.run(&keys, None).unwrap();

    assert_eq!(report.jobs.len(), 3);
    assert!(!report.is_complete());
    assert_eq!(report.failures.len(), 1);
    let failed = report.failures[0].batch_index;
    let failed_job = &report.jobs[failed];
    assert!(failed_job.taxon_keys.contains(&3));
    assert_eq!(failed_job.status, JobStatus::Failed);
    assert_eq!(failed_job.attempts, 2);
    assert!(report.failures[0].message.contains(&format!("batch {failed}")));

    for job in report.jobs.iter().filter(|job| job.batch_index != failed) {
        assert_eq!(job.status, JobStatus::Done);
        let part = store.batch_dir(job.batch_index).join("part-00000.parquet");
        assert!(part.as_std_path().exists());
    }
    assert!(!store.batch_dir(failed).as_std_path().exists());
    assert_eq!(service.submissions.lock().unwrap().len(), 4);

    service.poisoned.lock().unwrap().clear();
    let only = BTreeSet::from([failed]);
    let rerun = downloader.run(&keys, Some(&only)).unwrap();
    assert!(rerun.is_complete());
    assert!(store.batch_dir(failed).as_std_path().exists());
    assert_eq!(service.submissions.lock().unwrap().len(), 5);
    assert_eq!(
        rerun.jobs.iter().flat_map(|job| job.taxon_keys.clone()).collect::<BTreeSet<_>>(),
        keys
    );
}

#[test]
fn handle_mode_defers_archives_until_materialized() {
    let temp = tempfile::tempdir().unwrap();
    let mut value = config_json(temp.path());
    value["occurrence"]["mode"] = Value::from("handle");
    let config = resolve(value);
    let store = Store::new(&config.workspace, &config.run);
    let service = ArchiveService::default();
    let keys = (1..=4).collect::<BTreeSet<i64>>();

    let downloader = OccurrenceDownloader::new(&service, &store, &config.occurrence, identity());
    let report = downloader.run(&keys, None).unwrap();
    assert!(report.is_complete());
    assert!(report.jobs.iter().all(|job| job.download_key.is_some()));
    assert!(report.jobs.iter().all(|job| job.result_location.is_none()));
    assert!(!store.batch_dir(0).as_std_path().exists());

    let materialized = downloader.materialize_pending().unwrap();
    assert!(materialized.is_complete());
    for job in &materialized.jobs {
        assert_eq!(
            job.result_location.as_deref(),
            Some(store.batch_dir(job.batch_index).as_str())
        );
        assert!(store.batch_dir(job.batch_index).join("part-00000.parquet").as_std_path().exists());
    }
}

#[test]
fn targeted_rerun_refuses_a_changed_plan() {
    let temp = tempfile::tempdir().unwrap();
    let config = resolve(config_json(temp.path()));
    let store = Store::new(&config.workspace, &config.run);
    let service = ArchiveService::default();
    let keys = (1..=4).collect::<BTreeSet<i64>>();
    OccurrenceDownloader::new(&service, &store, &config.occurrence, identity())
        .run(&keys, None)
        .unwrap();

    let mut reseeded = config.occurrence.clone();
    reseeded.seed = 99;
    let only = BTreeSet::from([0]);
    let err = OccurrenceDownloader::new(&service, &store, &reseeded, identity())
        .run(&keys, Some(&only))
        .unwrap_err();
    assert_matches!(err, KiraError::ConfigInvalid(_));
}

#[test]
fn targeted_rerun_refuses_a_swapped_key_of_equal_count() {
    let temp = tempfile::tempdir().unwrap();
    let config = resolve(config_json(temp.path()));
    let store = Store::new(&config.workspace, &config.run);
    let service = ArchiveService::default();
    let downloader = OccurrenceDownloader::new(&service, &store, &config.occurrence, identity());
    downloader
        .run(&BTreeSet::from([1, 2, 3, 4]), None)
        .unwrap();

    let swapped = BTreeSet::from([1, 2, 3, 50]);
    for batch in 0..2 {
        let err = downloader
            .run(&swapped, Some(&BTreeSet::from([batch])))
            .unwrap_err();
        assert_matches!(err, KiraError::ConfigInvalid(_));
    }
    assert_eq!(service.submissions.lock().unwrap().len(), 2);

    let full = downloader.run(&swapped, None).unwrap();
    assert!(full.is_complete());
    assert_eq!(
        full.jobs.iter().flat_map(|job| job.taxon_keys.clone()).collect::<BTreeSet<_>>(),
        swapped
    );
}

#[test]
fn targeted_rerun_rejects_unknown_batch_index() {
    let temp = tempfile::tempdir().unwrap();
    let config = resolve(config_json(temp.path()));
    let store = Store::new(&config.workspace, &config.run);
    let service = ArchiveService::default();
    let keys = (1..=4).collect::<BTreeSet<i64>>();
    let downloader = OccurrenceDownloader::new(&service, &store, &config.occurrence, identity());
    downloader.run(&keys, None).unwrap();

    let err = downloader
        .run(&keys, Some(&BTreeSet::from([0, 7])))
        .unwrap_err();
    assert_matches!(err, KiraError::ConfigInvalid(message) if message.contains("batch 7"));
    assert_eq!(service.submissions.lock().unwrap().len(), 2);
}
