use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::{Builder, TempDir};

use crate::domain::YearMonth;
use crate::error::KiraError;

/// Run-scoped artifact layout. Every stage writes whole artifacts or whole
/// partitions; nothing here appends to an existing file.
#[derive(Debug, Clone)]
pub struct Store {
    workspace: Utf8PathBuf,
    run_root: Utf8PathBuf,
}

impl Store {
    pub fn new(workspace: &Utf8Path, run: &str) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            run_root: workspace.join(run),
        }
    }

    pub fn workspace(&self) -> &Utf8Path {
        &self.workspace
    }

    pub fn run_root(&self) -> &Utf8Path {
        &self.run_root
    }

    pub fn taxonomy_pages_dir(&self) -> Utf8PathBuf {
        self.run_root.join("taxonomy").join("pages")
    }

    pub fn page_path(&self, offset: u64) -> Utf8PathBuf {
        self.taxonomy_pages_dir()
            .join(format!("offset-{offset:010}.json"))
    }

    pub fn shortlist_path(&self) -> Utf8PathBuf {
        self.run_root.join("taxonomy").join("shortlist.csv")
    }

    pub fn matches_path(&self) -> Utf8PathBuf {
        self.run_root.join("backbone").join("matches.csv")
    }

    pub fn backbone_failures_path(&self) -> Utf8PathBuf {
        self.run_root.join("backbone").join("failures.json")
    }

    pub fn occurrences_dir(&self) -> Utf8PathBuf {
        self.run_root.join("occurrences")
    }

    pub fn batch_dir(&self, batch_index: usize) -> Utf8PathBuf {
        self.occurrences_dir()
            .join(format!("batch-{batch_index:05}"))
    }

    pub fn jobs_manifest_path(&self) -> Utf8PathBuf {
        self.occurrences_dir().join("jobs.json")
    }

    pub fn joined_months_dir(&self) -> Utf8PathBuf {
        self.run_root.join("joined").join("months")
    }

    pub fn month_partition_path(&self, year_month: YearMonth) -> Utf8PathBuf {
        self.joined_months_dir().join(format!("{year_month}.csv"))
    }

    pub fn observations_path(&self) -> Utf8PathBuf {
        self.run_root.join("joined").join("observations.csv")
    }

    pub fn join_report_path(&self) -> Utf8PathBuf {
        self.run_root.join("joined").join("report.json")
    }

    pub fn ensure_dir(path: &Utf8Path) -> Result<(), KiraError> {
        fs::create_dir_all(path.as_std_path()).map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn clear_dir(path: &Utf8Path) -> Result<(), KiraError> {
        if path.as_std_path().exists() {
            fs::remove_dir_all(path.as_std_path())
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    /// Page files on disk, ordered by offset.
    pub fn list_pages(&self) -> Result<Vec<(u64, Utf8PathBuf)>, KiraError> {
        let dir = self.taxonomy_pages_dir();
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut pages = Vec::new();
        let entries =
            fs::read_dir(dir.as_std_path()).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let name = entry.file_name();
            let Some(offset) = name
                .to_str()
                .and_then(|name| name.strip_prefix("offset-"))
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|digits| digits.parse::<u64>().ok())
            else {
                continue;
            };
            pages.push((offset, self.page_path(offset)));
        }
        pages.sort_by_key(|(offset, _)| *offset);
        Ok(pages)
    }

    /// Offset the next page fetch should start from, recovered from the
    /// highest persisted page. `None` when no page has been written.
    pub fn next_page_offset(&self, page_size: u64) -> Result<Option<u64>, KiraError> {
        Ok(self
            .list_pages()?
            .last()
            .map(|(offset, _)| offset + page_size))
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn write_json<T: Serialize + ?Sized>(path: &Utf8Path, value: &T) -> Result<(), KiraError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, KiraError> {
        if !path.as_std_path().exists() {
            return Err(KiraError::ArtifactNotFound(path.to_string()));
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        serde_json::from_str(&content).map_err(|err| {
            KiraError::Filesystem(format!("failed to parse {path}: {err}"))
        })
    }

    /// Scratch directory beside `dest`, so the final rename stays on one
    /// filesystem.
    pub fn staging_dir_for(dest: &Utf8Path) -> Result<TempDir, KiraError> {
        let parent = dest
            .parent()
            .ok_or_else(|| KiraError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Builder::new()
            .prefix(".kira-sdm-staging")
            .tempdir_in(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    /// Replaces the partition at `dest` with the contents of `staging`.
    pub fn commit_partition(staging: TempDir, dest: &Utf8Path) -> Result<(), KiraError> {
        let staged = staging.keep();
        atomic_rename_dir(&staged, dest.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }
}

pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, KiraError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    items.sort();
    Ok(items)
}

pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    fs::rename(from, to)
}
