use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::app::{DownloadResult, JoinResult, MatchResult, ProgressEvent, ProgressSink, RunResult, TaxonomyResult};

/// Stage results go to stdout as pretty JSON; progress goes to the log.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_taxonomy(result: &TaxonomyResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_match(result: &MatchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_download(result: &DownloadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_join(result: &JoinResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_run(result: &RunResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn render<T: Serialize>(value: &T) -> io::Result<String> {
        serde_json::to_string_pretty(value).map_err(io::Error::other)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = Self::render(value)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
