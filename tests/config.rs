mod common;

use assert_matches::assert_matches;
use serde_json::Value;

use kira_sdm_pipeline::config::ConfigLoader;
use kira_sdm_pipeline::domain::DownloadMode;
use kira_sdm_pipeline::error::KiraError;

use common::config_json;

#[test]
fn loads_config_file_from_path() {
    let temp = tempfile::tempdir().unwrap();
    let mut value = config_json(temp.path());
    value["occurrence"]["mode"] = Value::from("handle");
    value["environment"]["datasets"] = serde_json::json!([
        { "variable": "thetao", "dataset_id": "cmems_mod_glo_phy-thetao_anfc_0.083deg_P1M-m", "timescale": "monthly" }
    ]);
    let path = temp.path().join("kira-sdm.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();

    let resolved = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap();
    assert_eq!(resolved.run, "copepods");
    assert_eq!(resolved.occurrence.mode, DownloadMode::Handle);
    assert_eq!(resolved.environment.datasets.len(), 1);
    assert_eq!(resolved.environment.covariate_count(), 2);
    assert!(resolved.join.background_taxon_keys.is_none());
    assert!(resolved.occurrence.region.is_counter_clockwise());
}

#[test]
fn clockwise_region_is_reversed() {
    let temp = tempfile::tempdir().unwrap();
    let mut value = config_json(temp.path());
    value["occurrence"]["region"] =
        serde_json::json!([[-10.0, 40.0], [-10.0, 60.0], [10.0, 60.0], [10.0, 40.0], [-10.0, 40.0]]);
    let resolved = common::resolve(value);
    assert!(resolved.occurrence.region.is_counter_clockwise());
    assert_eq!(resolved.occurrence.region.vertices().len(), 4);
    assert!(resolved.occurrence.region.to_wkt().starts_with("POLYGON((10 40"));
}

#[test]
fn unreadable_or_invalid_configs_are_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(Some(missing.to_str().unwrap())),
        Err(KiraError::ConfigRead(_))
    );

    let broken = temp.path().join("broken.json");
    std::fs::write(&broken, b"{ not json").unwrap();
    assert_matches!(
        ConfigLoader::resolve(Some(broken.to_str().unwrap())),
        Err(KiraError::ConfigParse(_))
    );

    let mut value = config_json(temp.path());
    value["run"] = Value::from("../escape");
    let config = serde_json::from_value(value).unwrap();
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(KiraError::ConfigInvalid(_))
    );

    let mut value = config_json(temp.path());
    value["occurrence"]["region"] = serde_json::json!([[0.0, 0.0], [10.0, 10.0], [10.0, 0.0], [0.0, 12.0]]);
    let config = serde_json::from_value(value).unwrap();
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(KiraError::InvalidSearchArea(_))
    );
}
