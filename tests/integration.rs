//! Integration tests for statprobe
//!
//! Note: Tests marked with #[ignore] require GPU and model download.
//! Run them explicitly with: cargo test -- --ignored

use std::io::Write;

use candle_core::{Device, Tensor};
use statprobe::{
    acts_dir, load_acts, save_batch, split_indices, Dataset, ProbeTrainer, ACTS_BATCH_SIZE,
};
use tempfile::NamedTempFile;

fn write_dataset_csv(rows: &[(&str, u8)]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "statement,label").unwrap();
    for (statement, label) in rows {
        writeln!(file, "{statement},{label}").unwrap();
    }
    file
}

/// Test dataset loading from CSV
#[test]
fn test_dataset_loading() {
    let file = write_dataset_csv(&[
        ("The Eiffel Tower is in Paris.", 1),
        ("The Eiffel Tower is in Rome.", 0),
        ("Spiders have eight legs.", 1),
    ]);

    let dataset = Dataset::from_csv(file.path(), "cities").unwrap();
    assert_eq!(dataset.len(), 3);
    assert_eq!(dataset.true_count(), 2);
    assert_eq!(dataset.false_count(), 1);
    assert_eq!(dataset.name(), "cities");
}

/// Quoted statements containing commas survive CSV parsing
#[test]
fn test_dataset_quoted_statements() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "statement,label").unwrap();
    writeln!(file, "\"Lima, not Cusco, is the capital of Peru.\",1").unwrap();

    let dataset = Dataset::from_csv(file.path(), "peru").unwrap();
    assert_eq!(dataset.len(), 1);
    assert_eq!(
        dataset.statements()[0],
        "Lima, not Cusco, is the capital of Peru."
    );
}

/// Test deterministic split with same seed
#[test]
fn test_split_deterministic() {
    let (train1, test1) = split_indices(50, 0.8, 42);
    let (train2, test2) = split_indices(50, 0.8, 42);

    assert_eq!(train1, train2);
    assert_eq!(test1, test2);
    assert_eq!(train1.len(), 40);
    assert_eq!(test1.len(), 10);
}

/// Activations written across multiple batch files reload as one
/// row-ordered tensor
#[test]
fn test_store_multi_batch_round_trip() {
    let device = Device::Cpu;
    let out_dir = tempfile::tempdir().unwrap();
    let dir = acts_dir(out_dir.path(), "cities", 900);
    std::fs::create_dir_all(&dir).unwrap();

    // Three batches: 400 + 400 + 100 rows, 8 dims, row index encoded in column 0
    let dim = 8;
    let mut start = 0;
    for batch_len in [ACTS_BATCH_SIZE, ACTS_BATCH_SIZE, 100] {
        let mut data = vec![0.0f32; batch_len * dim];
        for row in 0..batch_len {
            data[row * dim] = (start + row) as f32;
        }
        let acts = Tensor::from_vec(data, (batch_len, dim), &device).unwrap();
        save_batch(&dir, "llama-2-7b", start, &acts).unwrap();
        start += batch_len;
    }

    let loaded = load_acts(&dir, "llama-2-7b", false, false, &device).unwrap();
    assert_eq!(loaded.dims(), &[900, dim]);

    let rows: Vec<Vec<f32>> = loaded.to_vec2().unwrap();
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row[0], i as f32);
    }
}

/// Centering and scaling produce zero-mean, unit-variance columns
#[test]
fn test_store_center_scale() {
    let device = Device::Cpu;
    let dir = tempfile::tempdir().unwrap();

    let n = 64;
    let data: Vec<f32> = (0..n).map(|i| 5.0 + i as f32).collect();
    let acts = Tensor::from_vec(data, (n, 1), &device).unwrap();
    save_batch(dir.path(), "m", 0, &acts).unwrap();

    let normed = load_acts(dir.path(), "m", true, true, &device).unwrap();
    let vals: Vec<f32> = normed.flatten_all().unwrap().to_vec1().unwrap();

    let mean: f32 = vals.iter().sum::<f32>() / n as f32;
    let var: f32 = vals.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / (n as f32 - 1.0);

    assert!(mean.abs() < 1e-5);
    assert!((var - 1.0).abs() < 1e-4);
}

/// End-to-end: stored activations plus dataset labels train a probe
#[test]
fn test_probe_on_stored_acts() {
    let device = Device::Cpu;
    let dir = tempfile::tempdir().unwrap();

    // Synthetic activations: true statements cluster high on feature 0
    let n = 80;
    let dim = 4;
    let mut data = vec![0.0f32; n * dim];
    let mut labels = Vec::with_capacity(n);
    for row in 0..n {
        let is_true = row % 2 == 0;
        data[row * dim] = if is_true { 3.0 } else { -3.0 };
        data[row * dim + 1] = (row as f32 * 0.37).sin();
        labels.push(is_true);
    }
    let acts = Tensor::from_vec(data, (n, dim), &device).unwrap();
    save_batch(dir.path(), "m", 0, &acts).unwrap();

    let loaded = load_acts(dir.path(), "m", true, false, &device).unwrap();
    let trainer = ProbeTrainer::new();
    let results = trainer.probe_stored_acts(&loaded, &labels, 0.8, 42).unwrap();

    assert_eq!(results.total, 16);
    assert!(results.accuracy > 0.9);
}

/// Mismatched label count is rejected
#[test]
fn test_probe_rejects_label_mismatch() {
    let device = Device::Cpu;
    let acts = Tensor::zeros((10, 4), candle_core::DType::F32, &device).unwrap();
    let labels = vec![true; 9];

    let trainer = ProbeTrainer::new();
    assert!(trainer.probe_stored_acts(&acts, &labels, 0.8, 42).is_err());
}

/// GPU-dependent test: model loading
#[test]
#[ignore = "requires GPU and model download"]
fn test_model_loading() {
    use statprobe::ProbeModel;

    let model = ProbeModel::from_pretrained("meta-llama/Llama-2-7b-hf").unwrap();
    assert_eq!(model.n_layers(), 32);
    assert_eq!(model.d_model(), 4096);
    assert_eq!(model.vocab_size(), 32000);
}

/// GPU-dependent test: lm-head capture shape
#[test]
#[ignore = "requires GPU and model download"]
fn test_lm_head_capture() {
    use statprobe::{CapturePoint, ProbeModel};

    let model = ProbeModel::from_pretrained("meta-llama/Llama-2-7b-hf").unwrap();

    let act = model
        .capture("The sky is blue.", CapturePoint::LmHead)
        .unwrap();
    assert_eq!(act.dims(), &[32000]);

    let act = model
        .capture("The sky is blue.", CapturePoint::Layer(12))
        .unwrap();
    assert_eq!(act.dims(), &[4096]);
}
