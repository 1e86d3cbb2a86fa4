mod common;

use common::{raw_config, run_config, ScriptedBackend};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tuneforge_training::manifest::sha256_file;
use tuneforge_training::{
    export_model, import_snapshot, ConfigSnapshot, ExportManifest, RawRunConfig, RunConfig, RunLayout, RunSupervisor,
};

#[tokio::test]
async fn test_export_after_run_copies_best_model_and_hashes_files() {
    let temp = TempDir::new().unwrap();
    let config = run_config(&temp, 3);
    let supervisor = RunSupervisor::new(Arc::new(ScriptedBackend::with_losses(&[2.0, 1.0, 1.5])));
    supervisor.start_from_config(config.clone()).unwrap();
    supervisor.wait().await.unwrap();

    let report = export_model(&config).unwrap();
    let layout = RunLayout::new(&config.output_dir);

    assert_eq!(report.source, layout.best_dir());
    assert_eq!(report.export_dir, layout.export_dir());
    assert_eq!(
        std::fs::read_to_string(report.export_dir.join("model.txt")).unwrap(),
        "epochs_trained=2"
    );

    let snapshot: ConfigSnapshot =
        serde_json::from_slice(&std::fs::read(report.export_dir.join("config.json")).unwrap()).unwrap();
    assert_eq!(snapshot, ConfigSnapshot::from(&config));
    assert_eq!(snapshot.base_model, "org/tiny-model");
    assert_eq!(snapshot.precision, "fp16");

    let manifest: ExportManifest =
        serde_json::from_slice(&std::fs::read(report.export_dir.join("export_manifest.json")).unwrap()).unwrap();
    let paths: Vec<PathBuf> = manifest.files.iter().map(|f| f.path.clone()).collect();
    assert_eq!(paths, vec![PathBuf::from("model.txt"), PathBuf::from("config.json")]);
    for file in &manifest.files {
        assert_eq!(sha256_file(&report.export_dir.join(&file.path)).unwrap(), file.sha256);
    }
}

#[test]
fn test_reexport_replaces_previous_export() {
    let temp = TempDir::new().unwrap();
    let config = run_config(&temp, 2);
    let layout = RunLayout::new(&config.output_dir);
    std::fs::create_dir_all(layout.epoch_dir(1)).unwrap();
    std::fs::write(layout.epoch_dir(1).join("weights.bin"), b"w1").unwrap();
    export_model(&config).unwrap();

    std::fs::create_dir_all(layout.export_dir().join("extra")).unwrap();
    std::fs::write(layout.export_dir().join("extra").join("leftover.bin"), b"old").unwrap();
    std::fs::remove_file(layout.epoch_dir(1).join("weights.bin")).unwrap();
    std::fs::write(layout.epoch_dir(1).join("adapter.bin"), b"a1").unwrap();

    let report = export_model(&config).unwrap();

    assert!(!report.export_dir.join("weights.bin").exists());
    assert!(!report.export_dir.join("extra").exists());
    assert!(report.export_dir.join("adapter.bin").is_file());
    let paths: Vec<PathBuf> = report.files.iter().map(|f| f.path.clone()).collect();
    assert_eq!(paths, vec![PathBuf::from("adapter.bin"), PathBuf::from("config.json")]);
}

#[test]
fn test_export_without_checkpoints_fails() {
    let temp = TempDir::new().unwrap();
    let config = run_config(&temp, 1);
    assert!(export_model(&config).is_err());
}

#[test]
fn test_exported_snapshot_imports_back() {
    let temp = TempDir::new().unwrap();
    let mut raw = raw_config(&temp, 7);
    raw.learning_rate = "0.0003".to_string();
    raw.lora_rank = "16".to_string();
    raw.precision = "bf16".to_string();
    let config = RunConfig::from_raw(&raw).unwrap();

    let layout = RunLayout::new(&config.output_dir);
    std::fs::create_dir_all(layout.epoch_dir(1)).unwrap();
    std::fs::write(layout.epoch_dir(1).join("weights.bin"), b"w").unwrap();
    let report = export_model(&config).unwrap();
    assert_eq!(report.source, layout.epoch_dir(1));

    let mut imported = RawRunConfig::default();
    import_snapshot(&report.export_dir, &mut imported).unwrap();

    assert_eq!(imported.model_id, "org/tiny-model");
    assert_eq!(imported.epochs, "7");
    assert_eq!(imported.lora_rank, "16");
    assert_eq!(imported.precision, "bf16");
    assert_eq!(imported.learning_rate.parse::<f64>().unwrap(), 0.0003);
    assert_eq!(PathBuf::from(&imported.output_dir), config.output_dir);
}
