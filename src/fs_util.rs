use std::fs;
use std::io;
use std::path::Path;

use zip::ZipArchive;

use crate::error::KiraError;

/// Extracts the parquet parts of a download archive into `target_dir` as
/// `part-NNNNN.parquet`, returning how many were written.
///
/// Simple-parquet archives store parts as extensionless files inside an
/// `occurrence.parquet/` directory, so both that layout and plain `.parquet`
/// entries are accepted. Everything else in the archive (citations, rights,
/// metadata) is skipped.
pub fn extract_parquet_parts(zip_path: &Path, target_dir: &Path) -> Result<usize, KiraError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| KiraError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    fs::create_dir_all(target_dir).map_err(|err| KiraError::Filesystem(err.to_string()))?;

    let mut written = 0usize;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let Some(entry_path) = entry.enclosed_name() else {
            return Err(KiraError::Filesystem(
                "zip entry path traversal detected".to_string(),
            ));
        };
        let is_part = entry_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("parquet"))
            || entry_path
                .parent()
                .and_then(|parent| parent.file_name())
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(".parquet"));
        if !is_part || entry.size() == 0 {
            continue;
        }

        let target = target_dir.join(format!("part-{written:05}.parquet"));
        let mut outfile =
            fs::File::create(&target).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        written += 1;
    }
    Ok(written)
}
