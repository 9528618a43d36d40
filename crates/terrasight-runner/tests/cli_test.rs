//! Runs the `terrasight` binary as a subprocess against an offline SRTM
//! cache, with `cp` standing in for the analysis tools.

use std::path::Path;
use std::process::{Command, Output};

// ============================================================================
// Fixtures
// ============================================================================

fn write_hgt(dir: &Path, name: &str, base: i16) {
    let bytes: Vec<u8> = (0..121)
        .flat_map(|i: i16| (base + i % 11 + i / 11).to_be_bytes())
        .collect();
    std::fs::write(dir.join(name), bytes).unwrap();
}

/// Config with an offline cache holding N00E000 and N00E001.
fn write_config(root: &Path) -> std::path::PathBuf {
    let cache = root.join("srtm");
    std::fs::create_dir_all(&cache).unwrap();
    write_hgt(&cache, "N00E000.hgt", 100);
    write_hgt(&cache, "N00E001.hgt", 200);

    let copy = r#"["cp", "{input}", "{output}"]"#;
    let yaml = format!(
        "data_dir: {data}\n\
         srtm:\n  cache_dir: {cache}\n  offline: true\n\
         scheduler:\n  workers: 4\n  timeout_secs: 60\n\
         engine:\n  commands:\n    slope: {copy}\n    aspect: {copy}\n    hillshade: {copy}\n    \
         geomorphons: {copy}\n    drainage: {copy}\n    contours: {copy}\n",
        data = root.join("data").display(),
        cache = cache.display(),
    );
    let path = root.join("pipeline.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

fn write_aoi(root: &Path, name: &str, x0: f64, y0: f64, x1: f64, y1: f64) -> std::path::PathBuf {
    let geojson = format!(
        r#"{{"type":"Feature","properties":{{}},"geometry":{{"type":"Polygon","coordinates":[[[{x0},{y0}],[{x1},{y0}],[{x1},{y1}],[{x0},{y1}],[{x0},{y0}]]]}}}}"#
    );
    let path = root.join(format!("{name}.geojson"));
    std::fs::write(&path, geojson).unwrap();
    path
}

fn terrasight(args: &[&str]) -> Output {
    let output = Command::new(env!("CARGO_BIN_EXE_terrasight"))
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("TERRASIGHT_DATA_DIR")
        .output()
        .expect("failed to execute terrasight binary");
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        eprintln!("terrasight stderr:\n{}", stderr);
    }
    output
}

fn status_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let start = stdout.find('{').expect("no JSON in output");
    serde_json::from_str(&stdout[start..]).expect("invalid status JSON")
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_sources_lists_every_source() {
    let output = terrasight(&["sources"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for id in ["srtm", "lidar", "usgs-dem"] {
        assert!(stdout.contains(id), "{id} missing from:\n{stdout}");
    }
}

#[cfg(unix)]
#[test]
fn test_run_two_tile_aoi_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let aoi = write_aoi(dir.path(), "pair", 0.3, 0.2, 1.7, 0.8);
    let status_file = dir.path().join("status.json");

    let output = terrasight(&[
        "run",
        "--config",
        config.to_str().unwrap(),
        "--aoi",
        aoi.to_str().unwrap(),
        "--output",
        status_file.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(0));

    let status = status_json(&output);
    assert_eq!(status["state"], "succeeded");
    assert_eq!(status["progress"], 100);
    assert_eq!(status["aoi_id"], "pair");
    let artifacts = status["artifacts"].as_object().unwrap();
    assert_eq!(artifacts.len(), 13);
    for path in artifacts.values() {
        assert!(Path::new(path.as_str().unwrap()).exists());
    }
    assert!(dir.path().join("data/sessions/pair/analysis.json").exists());
    assert!(status_file.exists());
}

#[test]
fn test_run_without_tiles_exits_failed() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let aoi = write_aoi(dir.path(), "sea", 10.2, 10.2, 10.8, 10.8);

    let output = terrasight(&[
        "run",
        "--config",
        config.to_str().unwrap(),
        "--aoi",
        aoi.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(1));
    let status = status_json(&output);
    assert_eq!(status["state"], "failed");
    assert_eq!(status["failure"], "acquisition");
    assert_eq!(status["progress"], 20);
}

#[test]
fn test_tiles_reports_cached_and_missing() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let aoi = write_aoi(dir.path(), "edge", 1.5, 0.5, 2.5, 0.8);

    let output = terrasight(&[
        "tiles",
        "--config",
        config.to_str().unwrap(),
        "--aoi",
        aoi.to_str().unwrap(),
    ]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("N00E001.hgt"), "{stdout}");
    assert!(stdout.contains("missing\tN00E002"), "{stdout}");
}

#[test]
fn test_bad_source_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let aoi = write_aoi(dir.path(), "x", 0.3, 0.2, 0.6, 0.5);
    let output = terrasight(&["tiles", "--aoi", aoi.to_str().unwrap(), "--source", "landsat"]);
    assert_eq!(output.status.code(), Some(3));
}
