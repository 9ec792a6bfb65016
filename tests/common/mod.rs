#![allow(dead_code)]

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use camino::Utf8PathBuf;
use parquet::data_type::{ByteArray, ByteArrayType, DoubleType, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::parser::parse_message_type;
use serde_json::{Value, json};

use kira_sdm_pipeline::config::{Config, ConfigLoader, ResolvedConfig};

pub fn utf8(path: &Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}

/// Config JSON rooted in `root`, with every wait set to zero.
pub fn config_json(root: &Path) -> Value {
    json!({
        "run": "copepods",
        "workspace": root.join("ws").to_str().unwrap(),
        "taxonomy": { "cooldown_secs": 0 },
        "backbone": { "chunk_size": 2 },
        "occurrence": {
            "region": [[-10.0, 40.0], [10.0, 40.0], [10.0, 60.0], [-10.0, 60.0]],
            "batch_size": 2,
            "seed": 11,
            "poll_interval_secs": 0,
            "max_concurrent_jobs": 2,
            "job_attempts": 2
        },
        "environment": {
            "root": root.join("env").to_str().unwrap(),
            "expected_files": 3,
            "drop_layers": ["mask"]
        },
        "join": {
            "target_taxon_keys": [100],
            "start_date": "2000-01-01"
        }
    })
}

pub fn resolve(value: Value) -> ResolvedConfig {
    let config: Config = serde_json::from_value(value).unwrap();
    ConfigLoader::resolve_config(config).unwrap()
}

pub struct OccurrenceRow<'a> {
    pub taxon_key: i64,
    pub event_date: &'a str,
    pub lon: f64,
    pub lat: f64,
    pub status: &'a str,
}

/// Writes rows with the column names of the archive's simple parquet
/// export.
pub fn write_occurrence_parquet(path: &Path, rows: &[OccurrenceRow<'_>]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let schema = Arc::new(
        parse_message_type(
            "message occurrence {
                REQUIRED INT64 taxonkey;
                REQUIRED BINARY eventdate (UTF8);
                REQUIRED DOUBLE decimallongitude;
                REQUIRED DOUBLE decimallatitude;
                REQUIRED BINARY occurrencestatus (UTF8);
            }",
        )
        .unwrap(),
    );
    let props = Arc::new(WriterProperties::builder().build());
    let file = File::create(path).unwrap();
    let mut writer = SerializedFileWriter::new(file, schema, props).unwrap();
    let mut row_group = writer.next_row_group().unwrap();

    if let Some(mut column) = row_group.next_column().unwrap() {
        let values = rows.iter().map(|row| row.taxon_key).collect::<Vec<_>>();
        column.typed::<Int64Type>().write_batch(&values, None, None).unwrap();
        column.close().unwrap();
    }
    if let Some(mut column) = row_group.next_column().unwrap() {
        let values = rows
            .iter()
            .map(|row| ByteArray::from(row.event_date))
            .collect::<Vec<_>>();
        column.typed::<ByteArrayType>().write_batch(&values, None, None).unwrap();
        column.close().unwrap();
    }
    if let Some(mut column) = row_group.next_column().unwrap() {
        let values = rows.iter().map(|row| row.lon).collect::<Vec<_>>();
        column.typed::<DoubleType>().write_batch(&values, None, None).unwrap();
        column.close().unwrap();
    }
    if let Some(mut column) = row_group.next_column().unwrap() {
        let values = rows.iter().map(|row| row.lat).collect::<Vec<_>>();
        column.typed::<DoubleType>().write_batch(&values, None, None).unwrap();
        column.close().unwrap();
    }
    if let Some(mut column) = row_group.next_column().unwrap() {
        let values = rows
            .iter()
            .map(|row| ByteArray::from(row.status))
            .collect::<Vec<_>>();
        column.typed::<ByteArrayType>().write_batch(&values, None, None).unwrap();
        column.close().unwrap();
    }

    assert!(row_group.next_column().unwrap().is_none());
    row_group.close().unwrap();
    writer.close().unwrap();
}

/// Writes a 3x3 one-degree JSON grid centred on (`lon`, `lat`) filled with
/// `value`.
pub fn write_grid(path: &Path, lon: f64, lat: f64, value: Option<f64>) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let row = vec![value; 3];
    let document = json!({
        "lon": [lon - 1.0, lon, lon + 1.0],
        "lat": [lat - 1.0, lat, lat + 1.0],
        "values": [row.clone(), row.clone(), row],
    });
    fs::write(path, serde_json::to_vec(&document).unwrap()).unwrap();
}
