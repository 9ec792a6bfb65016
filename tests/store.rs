use std::fs;

use camino::Utf8PathBuf;

use kira_sdm_pipeline::store::{Store, walk_dir};

#[test]
fn partition_commit_replaces_previous_contents() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = Store::new(&root, "run");
    let dest = store.batch_dir(0);

    let first = Store::staging_dir_for(&dest).unwrap();
    fs::write(first.path().join("part-00000.parquet"), b"old").unwrap();
    fs::write(first.path().join("part-00001.parquet"), b"old").unwrap();
    Store::commit_partition(first, &dest).unwrap();

    let second = Store::staging_dir_for(&dest).unwrap();
    fs::write(second.path().join("part-00000.parquet"), b"new").unwrap();
    Store::commit_partition(second, &dest).unwrap();

    let files = walk_dir(store.occurrences_dir().as_std_path()).unwrap();
    assert_eq!(files, vec![dest.as_std_path().to_path_buf(), dest.join("part-00000.parquet").into_std_path_buf()]);
    assert_eq!(fs::read(dest.join("part-00000.parquet").as_std_path()).unwrap(), b"new");
}

#[test]
fn json_artifacts_round_trip_without_temp_leftovers() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = Store::new(&root, "run");
    let path = store.join_report_path();

    Store::write_json(&path, &vec![1, 2, 3]).unwrap();
    Store::write_json(&path, &vec![4]).unwrap();
    let value: Vec<i32> = Store::read_json(&path).unwrap();
    assert_eq!(value, vec![4]);
    let siblings = fs::read_dir(path.parent().unwrap().as_std_path()).unwrap().count();
    assert_eq!(siblings, 1);
}
