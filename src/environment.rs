use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8Path;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::config::{DatasetEntry, EnvironmentSettings};
use crate::domain::YearMonth;
use crate::error::KiraError;
use crate::store::walk_dir;

/// One environmental file, keyed by the layer name and year-month encoded in
/// its file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerFile {
    pub path: PathBuf,
    pub layer: String,
    pub year_month: YearMonth,
}

/// Environmental files grouped by year-month.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentIndex {
    by_month: BTreeMap<YearMonth, Vec<LayerFile>>,
}

impl EnvironmentIndex {
    /// Indexes every file under `root` whose name matches `pattern`. When
    /// `datasets` is non-empty only their `root/<dataset_id>/` directories
    /// are searched.
    pub fn build(
        root: &Utf8Path,
        pattern: &Regex,
        datasets: &[DatasetEntry],
    ) -> Result<Self, KiraError> {
        let roots = if datasets.is_empty() {
            vec![root.as_std_path().to_path_buf()]
        } else {
            datasets
                .iter()
                .map(|entry| root.as_std_path().join(&entry.dataset_id))
                .collect()
        };

        let mut by_month: BTreeMap<YearMonth, Vec<LayerFile>> = BTreeMap::new();
        for dir in roots {
            if !dir.exists() {
                return Err(KiraError::ArtifactNotFound(dir.display().to_string()));
            }
            for path in walk_dir(&dir)? {
                if !path.is_file() {
                    continue;
                }
                let Some(file) = parse_layer_file(&path, pattern) else {
                    continue;
                };
                by_month.entry(file.year_month).or_default().push(file);
            }
        }
        for files in by_month.values_mut() {
            files.sort_by(|a, b| a.layer.cmp(&b.layer).then_with(|| a.path.cmp(&b.path)));
        }
        Ok(Self { by_month })
    }

    pub fn months(&self) -> impl Iterator<Item = &YearMonth> {
        self.by_month.keys()
    }

    pub fn files(&self, year_month: YearMonth) -> &[LayerFile] {
        self.by_month
            .get(&year_month)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

pub fn parse_layer_file(path: &Path, pattern: &Regex) -> Option<LayerFile> {
    let name = path.file_name()?.to_str()?;
    let captures = pattern.captures(name)?;
    let layer = captures.name("layer")?.as_str().to_string();
    let year_month = captures.name("year_month")?.as_str().parse().ok()?;
    Some(LayerFile {
        path: path.to_path_buf(),
        layer,
        year_month,
    })
}

/// Single-level 2-D grid, row-major over (lat, lon). `None` marks cells
/// without data (land, ice, fill values).
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    lon: Vec<f64>,
    lat: Vec<f64>,
    values: Vec<Option<f64>>,
}

impl Grid {
    pub fn new(lon: Vec<f64>, lat: Vec<f64>, values: Vec<Option<f64>>) -> Result<Self, String> {
        if lon.is_empty() || lat.is_empty() {
            return Err("grid has an empty axis".to_string());
        }
        if values.len() != lon.len() * lat.len() {
            return Err(format!(
                "grid has {} values for {} x {} cells",
                values.len(),
                lat.len(),
                lon.len()
            ));
        }
        if !is_monotonic(&lon) || !is_monotonic(&lat) {
            return Err("grid axes must be strictly monotonic".to_string());
        }
        Ok(Self { lon, lat, values })
    }

    /// Value of the cell containing (`lon`, `lat`), or `None` outside the
    /// grid or on a missing cell.
    pub fn sample(&self, lon: f64, lat: f64) -> Option<f64> {
        let col = nearest(&self.lon, lon)?;
        let row = nearest(&self.lat, lat)?;
        self.values[row * self.lon.len() + col].filter(|value| value.is_finite())
    }
}

fn is_monotonic(axis: &[f64]) -> bool {
    axis.windows(2).all(|pair| pair[0] < pair[1]) || axis.windows(2).all(|pair| pair[0] > pair[1])
}

fn nearest(axis: &[f64], x: f64) -> Option<usize> {
    if !x.is_finite() {
        return None;
    }
    let n = axis.len();
    let ascending = n < 2 || axis[0] < axis[n - 1];
    let split = if ascending {
        axis.partition_point(|value| *value < x)
    } else {
        axis.partition_point(|value| *value > x)
    };
    let best = [split.checked_sub(1), (split < n).then_some(split)]
        .into_iter()
        .flatten()
        .min_by(|a, b| {
            (axis[*a] - x)
                .abs()
                .total_cmp(&(axis[*b] - x).abs())
        })?;
    let spacing = match n {
        1 => 0.0,
        _ if best == 0 => (axis[1] - axis[0]).abs(),
        _ => (axis[best] - axis[best - 1]).abs(),
    };
    let distance = (axis[best] - x).abs();
    (distance <= spacing / 2.0 + 1e-9).then_some(best)
}

/// Reads one environmental file as a single-level grid. Files with a depth
/// dimension yield their first (shallowest) level.
pub trait GridReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<Grid, KiraError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GridValues {
    Surface(Vec<Vec<Option<f64>>>),
    Layered(Vec<Vec<Vec<Option<f64>>>>),
}

#[derive(Debug, Deserialize)]
struct GridDocument {
    lon: Vec<f64>,
    lat: Vec<f64>,
    #[serde(default)]
    depth: Option<Vec<f64>>,
    values: GridValues,
}

/// Reader for JSON grid documents:
/// `{ "lon": [..], "lat": [..], "depth": [..]?, "values": [[..]] | [[[..]]] }`
/// with `values` indexed `[depth][lat][lon]` when `depth` is present.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonGridReader;

impl GridReader for JsonGridReader {
    fn read(&self, path: &Path) -> Result<Grid, KiraError> {
        let fail = |message: String| KiraError::GridRead {
            path: path.to_path_buf(),
            message,
        };
        let content = fs::read_to_string(path).map_err(|err| fail(err.to_string()))?;
        let document: GridDocument =
            serde_json::from_str(&content).map_err(|err| fail(err.to_string()))?;

        let rows = match (document.depth, document.values) {
            (None, GridValues::Surface(rows)) => rows,
            (Some(depth), GridValues::Layered(levels)) => {
                if depth.len() != levels.len() {
                    return Err(fail(format!(
                        "{} depth levels declared, {} present",
                        depth.len(),
                        levels.len()
                    )));
                }
                levels
                    .into_iter()
                    .next()
                    .ok_or_else(|| fail("grid has no depth levels".to_string()))?
            }
            (Some(_), GridValues::Surface(_)) => {
                return Err(fail("depth axis given for 2-D values".to_string()));
            }
            (None, GridValues::Layered(_)) => {
                return Err(fail("3-D values without a depth axis".to_string()));
            }
        };
        if rows.len() != document.lat.len() || rows.iter().any(|row| row.len() != document.lon.len()) {
            return Err(fail("values do not match the lat/lon axes".to_string()));
        }
        Grid::new(document.lon, document.lat, rows.into_iter().flatten().collect()).map_err(fail)
    }
}

/// Picks a reader by file extension: `.nc`/`.nc4` through NetCDF, `.json`
/// through [`JsonGridReader`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GridFileReader;

impl GridReader for GridFileReader {
    fn read(&self, path: &Path) -> Result<Grid, KiraError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            #[cfg(feature = "netcdf")]
            Some("nc" | "nc4") => crate::netcdf_grid::NetcdfGridReader.read(path),
            Some("json") => JsonGridReader.read(path),
            other => Err(KiraError::GridRead {
                path: path.to_path_buf(),
                message: format!("unsupported grid file extension {}", other.unwrap_or("(none)")),
            }),
        }
    }
}

/// All covariate layers for one year-month, keyed by layer name.
#[derive(Debug, Clone)]
pub struct EnvironmentalStack {
    pub year_month: YearMonth,
    pub layers: BTreeMap<String, Grid>,
}

impl EnvironmentalStack {
    pub fn layer_names(&self) -> Vec<String> {
        self.layers.keys().cloned().collect()
    }

    /// Samples every layer at one point.
    pub fn extract(&self, lon: f64, lat: f64) -> BTreeMap<String, Option<f64>> {
        self.layers
            .iter()
            .map(|(name, grid)| (name.clone(), grid.sample(lon, lat)))
            .collect()
    }
}

/// Assembles month stacks, enforcing the configured file and layer counts.
pub struct StackLoader<'a, R: GridReader + ?Sized> {
    index: &'a EnvironmentIndex,
    reader: &'a R,
    expected_files: usize,
    drop_layers: &'a [String],
}

impl<'a, R: GridReader + ?Sized> StackLoader<'a, R> {
    pub fn new(index: &'a EnvironmentIndex, reader: &'a R, settings: &'a EnvironmentSettings) -> Self {
        Self {
            index,
            reader,
            expected_files: settings.expected_files,
            drop_layers: &settings.drop_layers,
        }
    }

    pub fn covariate_count(&self) -> usize {
        self.expected_files - self.drop_layers.len()
    }

    pub fn load(&self, year_month: YearMonth) -> Result<EnvironmentalStack, KiraError> {
        let files = self.index.files(year_month);
        if files.len() != self.expected_files {
            return Err(KiraError::LayerCount {
                year_month: year_month.to_string(),
                expected: self.expected_files,
                found: files.len(),
            });
        }

        let mut layers = BTreeMap::new();
        for file in files {
            if self.drop_layers.contains(&file.layer) {
                continue;
            }
            let grid = self.reader.read(&file.path)?;
            if layers.insert(file.layer.clone(), grid).is_some() {
                return Err(KiraError::DuplicateLayer {
                    year_month: year_month.to_string(),
                    layer: file.layer.clone(),
                });
            }
        }
        if layers.len() != self.covariate_count() {
            return Err(KiraError::LayerCount {
                year_month: year_month.to_string(),
                expected: self.covariate_count(),
                found: layers.len(),
            });
        }
        debug!(%year_month, layers = layers.len(), "environmental stack assembled");
        Ok(EnvironmentalStack { year_month, layers })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::config::DEFAULT_FILENAME_PATTERN;

    #[test]
    fn file_names_encode_layer_and_month() {
        let pattern = Regex::new(DEFAULT_FILENAME_PATTERN).unwrap();
        let file = parse_layer_file(
            Path::new("/env/cmems_mod_glo_phy/glo12_rg_1m_thetao_202001.json"),
            &pattern,
        )
        .unwrap();
        assert_eq!(file.layer, "thetao");
        assert_eq!(file.year_month.to_string(), "202001");
        assert!(parse_layer_file(Path::new("/env/readme.txt"), &pattern).is_none());
    }

    #[test]
    fn nearest_cell_sampling() {
        let grid = Grid::new(
            vec![0.0, 1.0, 2.0],
            vec![10.0, 11.0],
            vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0), None, Some(6.0)],
        )
        .unwrap();
        assert_eq!(grid.sample(0.2, 10.1), Some(1.0));
        assert_eq!(grid.sample(1.9, 10.6), Some(6.0));
        assert_eq!(grid.sample(1.1, 11.0), None);
        assert_eq!(grid.sample(2.4, 10.0), Some(3.0));
        assert_eq!(grid.sample(2.6, 10.0), None);
        assert_eq!(grid.sample(0.0, 9.0), None);
    }

    #[test]
    fn descending_latitude_axis() {
        let grid = Grid::new(
            vec![0.0, 1.0],
            vec![11.0, 10.0],
            vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)],
        )
        .unwrap();
        assert_eq!(grid.sample(0.0, 10.9), Some(1.0));
        assert_eq!(grid.sample(1.0, 10.1), Some(4.0));
    }

    #[test]
    fn json_reader_takes_first_depth_level() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("so_202001.json");
        fs::write(
            &path,
            r#"{ "lon": [0, 1], "lat": [0], "depth": [0.5, 10],
                 "values": [[[35.1, null]], [[36.0, 36.2]]] }"#,
        )
        .unwrap();
        let grid = JsonGridReader.read(&path).unwrap();
        assert_eq!(grid.sample(0.0, 0.0), Some(35.1));
        assert_eq!(grid.sample(1.0, 0.0), None);
    }

    #[test]
    fn file_reader_dispatches_on_extension() {
        let temp = tempfile::tempdir().unwrap();
        let json = temp.path().join("so_202001.json");
        fs::write(&json, r#"{ "lon": [0], "lat": [0], "values": [[2.5]] }"#).unwrap();
        assert_eq!(GridFileReader.read(&json).unwrap().sample(0.0, 0.0), Some(2.5));

        let csv = temp.path().join("so_202001.csv");
        fs::write(&csv, "0,0,2.5\n").unwrap();
        assert_matches!(
            GridFileReader.read(&csv),
            Err(KiraError::GridRead { message, .. }) if message.contains("csv")
        );
    }

    #[test]
    fn json_reader_rejects_shape_mismatch() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("so_202001.json");
        fs::write(&path, r#"{ "lon": [0, 1], "lat": [0], "values": [[1.0]] }"#).unwrap();
        assert_matches!(JsonGridReader.read(&path), Err(KiraError::GridRead { .. }));
    }
}
