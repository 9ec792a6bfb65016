use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::backbone::{BackboneMatch, BackboneMatcher, ChunkFailure, taxon_key_universe};
use crate::config::ResolvedConfig;
use crate::domain::{DownloadMode, YearMonth};
use crate::environment::GridReader;
use crate::error::KiraError;
use crate::gbif::{NameMatchClient, OccurrenceDownloadClient};
use crate::joiner::{EnvironmentalJoiner, JoinReport};
use crate::occurrence::{DownloadReport, OccurrenceDownloader, RequestIdentity};
use crate::paging::{FetchSummary, PageSource, PagedFetcher, load_pages};
use crate::store::Store;
use crate::table::{read_records, write_records};
use crate::taxonomy::{CurationReport, TaxonRecord, curate, records_from_pages};

#[derive(Debug, Clone, Default)]
pub struct TaxonomyOptions {
    /// Continue after the highest page on disk instead of starting over.
    pub resume: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaxonomyResult {
    pub fetch: FetchSummary,
    pub pages_on_disk: usize,
    pub curation: CurationReport,
    pub shortlist_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub queries: usize,
    pub chunks: usize,
    pub raw_rows: usize,
    pub retained_rows: usize,
    pub taxon_keys: usize,
    pub unmatched: usize,
    pub chunk_failures: Vec<ChunkFailure>,
    pub matches_path: String,
}

impl MatchResult {
    /// True when every name chunk was answered; queries without a match
    /// do not count against completeness.
    pub fn is_complete(&self) -> bool {
        self.chunk_failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub mode: DownloadMode,
    pub taxon_keys: usize,
    pub report: DownloadReport,
    pub manifest_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinResult {
    pub report: JoinReport,
    pub observations_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub taxonomy: TaxonomyResult,
    pub matching: MatchResult,
    /// Absent when any backbone chunk failed.
    pub download: Option<DownloadResult>,
    /// Absent when downloads are missing, incomplete or only job keys were
    /// kept.
    pub join: Option<JoinResult>,
}

#[derive(Debug, Clone, Serialize)]
struct BackboneFailures<'a> {
    chunk_failures: &'a [ChunkFailure],
    unmatched_query_indices: &'a [usize],
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Stage orchestrator. Each stage reads the artifact the previous stage
/// persisted under the run directory, so any stage can be rerun alone.
pub struct Pipeline<T, M, D, G>
where
    T: PageSource,
    M: NameMatchClient,
    D: OccurrenceDownloadClient,
    G: GridReader,
{
    config: ResolvedConfig,
    store: Store,
    taxonomy: T,
    names: M,
    downloads: D,
    grids: G,
    identity: Option<RequestIdentity>,
}

impl<T, M, D, G> Pipeline<T, M, D, G>
where
    T: PageSource,
    M: NameMatchClient,
    D: OccurrenceDownloadClient,
    G: GridReader,
{
    pub fn new(config: ResolvedConfig, taxonomy: T, names: M, downloads: D, grids: G) -> Self {
        let store = Store::new(&config.workspace, &config.run);
        Self {
            config,
            store,
            taxonomy,
            names,
            downloads,
            grids,
            identity: None,
        }
    }

    /// Identity submitted with download requests. Downloads fail with
    /// `MissingCredentials` until one is set.
    pub fn with_identity(mut self, identity: RequestIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn curate_taxonomy(
        &self,
        options: &TaxonomyOptions,
        sink: &dyn ProgressSink,
    ) -> Result<TaxonomyResult, KiraError> {
        let settings = &self.config.taxonomy;
        let started = Instant::now();
        let start_offset = if options.resume {
            self.store
                .next_page_offset(settings.page_size)?
                .unwrap_or(settings.start_offset)
        } else {
            Store::clear_dir(&self.store.taxonomy_pages_dir())?;
            settings.start_offset
        };
        sink.event(ProgressEvent {
            message: format!("phase=Taxonomy; fetching pages from offset {start_offset}"),
            elapsed: None,
        });

        let fetch = PagedFetcher::new(
            &self.taxonomy,
            start_offset,
            settings.page_size,
            settings.cooldown,
        )
        .fetch_all(&self.store)?;

        let pages = load_pages(&self.store)?;
        let records = records_from_pages(&pages)?;
        let curation = curate(records, &settings.species_ranks);
        let shortlist_path = self.store.shortlist_path();
        write_records(&shortlist_path, &curation.shortlist)?;
        info!(
            pages = pages.len(),
            raw = curation.report.raw_records,
            retained = curation.report.retained,
            "taxonomy shortlist written"
        );
        sink.event(ProgressEvent {
            message: format!("phase=Taxonomy; {} species shortlisted", curation.report.retained),
            elapsed: Some(started.elapsed()),
        });

        Ok(TaxonomyResult {
            fetch,
            pages_on_disk: pages.len(),
            curation: curation.report,
            shortlist_path: shortlist_path.to_string(),
        })
    }

    pub fn match_backbone(&self, sink: &dyn ProgressSink) -> Result<MatchResult, KiraError> {
        let started = Instant::now();
        let shortlist: Vec<TaxonRecord> = read_records(&self.store.shortlist_path())?;
        let names = shortlist.iter().map(TaxonRecord::query_name).collect::<Vec<_>>();
        sink.event(ProgressEvent {
            message: format!("phase=Match; reconciling {} names", names.len()),
            elapsed: None,
        });

        let reconciliation =
            BackboneMatcher::new(&self.names, self.config.backbone.chunk_size).reconcile(&names);
        let matches_path = self.store.matches_path();
        write_records(&matches_path, &reconciliation.matches)?;
        Store::write_json(
            &self.store.backbone_failures_path(),
            &BackboneFailures {
                chunk_failures: &reconciliation.chunk_failures,
                unmatched_query_indices: &reconciliation.unmatched,
            },
        )?;
        let taxon_keys = reconciliation.taxon_keys();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Match; {} taxon keys, {} failed chunks",
                taxon_keys.len(),
                reconciliation.chunk_failures.len()
            ),
            elapsed: Some(started.elapsed()),
        });

        Ok(MatchResult {
            queries: names.len(),
            chunks: names.len().div_ceil(self.config.backbone.chunk_size.max(1)),
            raw_rows: reconciliation.raw_rows,
            retained_rows: reconciliation.matches.len(),
            taxon_keys: taxon_keys.len(),
            unmatched: reconciliation.unmatched.len(),
            chunk_failures: reconciliation.chunk_failures,
            matches_path: matches_path.to_string(),
        })
    }

    /// Submits download jobs for the matched taxon keys. `only` restricts a
    /// rerun to the listed batch indices of the existing plan.
    pub fn download(
        &self,
        only: Option<&BTreeSet<usize>>,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, KiraError> {
        let started = Instant::now();
        let matches: Vec<BackboneMatch> = read_records(&self.store.matches_path())?;
        let keys = taxon_key_universe(&matches);
        sink.event(ProgressEvent {
            message: format!("phase=Download; {} taxon keys", keys.len()),
            elapsed: None,
        });

        let report = self.downloader()?.run(&keys, only)?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Download; {} batches, {} failed",
                report.jobs.len(),
                report.failures.len()
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(DownloadResult {
            mode: self.config.occurrence.mode,
            taxon_keys: keys.len(),
            report,
            manifest_path: self.store.jobs_manifest_path().to_string(),
        })
    }

    /// Fetches archives for finished jobs recorded by a handle-mode download.
    pub fn materialize(&self, sink: &dyn ProgressSink) -> Result<DownloadResult, KiraError> {
        let started = Instant::now();
        sink.event(ProgressEvent {
            message: "phase=Materialize; fetching finished archives".to_string(),
            elapsed: None,
        });
        let report = self.downloader()?.materialize_pending()?;
        let keys = report
            .jobs
            .iter()
            .map(|job| job.taxon_keys.len())
            .sum();
        sink.event(ProgressEvent {
            message: format!("phase=Materialize; {} failed", report.failures.len()),
            elapsed: Some(started.elapsed()),
        });
        Ok(DownloadResult {
            mode: DownloadMode::Materialize,
            taxon_keys: keys,
            report,
            manifest_path: self.store.jobs_manifest_path().to_string(),
        })
    }

    pub fn join(
        &self,
        only: Option<&BTreeSet<YearMonth>>,
        sink: &dyn ProgressSink,
    ) -> Result<JoinResult, KiraError> {
        let started = Instant::now();
        sink.event(ProgressEvent {
            message: "phase=Join; scanning occurrence partitions".to_string(),
            elapsed: None,
        });
        let report = EnvironmentalJoiner::new(
            &self.store,
            &self.grids,
            &self.config.environment,
            &self.config.join,
        )
        .run(only)?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Join; {} rows, {} failed months",
                report.rows_written,
                report.failures.len()
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(JoinResult {
            report,
            observations_path: self.store.observations_path().to_string(),
        })
    }

    /// Runs every stage in order. Downloads are skipped when any backbone
    /// chunk failed, since the taxon universe would be incomplete. The join
    /// is skipped when any download batch failed or when only job keys were
    /// kept.
    pub fn run(&self, sink: &dyn ProgressSink) -> Result<RunResult, KiraError> {
        let taxonomy = self.curate_taxonomy(&TaxonomyOptions::default(), sink)?;
        let matching = self.match_backbone(sink)?;
        if !matching.is_complete() {
            return Ok(RunResult {
                taxonomy,
                matching,
                download: None,
                join: None,
            });
        }
        let download = self.download(None, sink)?;
        let join = if download.report.is_complete() && download.mode == DownloadMode::Materialize {
            Some(self.join(None, sink)?)
        } else {
            None
        };
        Ok(RunResult {
            taxonomy,
            matching,
            download: Some(download),
            join,
        })
    }

    fn downloader(&self) -> Result<OccurrenceDownloader<'_, D>, KiraError> {
        let identity = self.identity.clone().ok_or_else(|| {
            KiraError::MissingCredentials("no download identity configured".to_string())
        })?;
        Ok(OccurrenceDownloader::new(
            &self.downloads,
            &self.store,
            &self.config.occurrence,
            identity,
        ))
    }
}
