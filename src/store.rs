//! Batched activation persistence
//!
//! Activations are written in fixed-size row batches, one safetensors
//! file per batch, named `<tag>_<batch_start>.safetensors` under a
//! per-dataset directory. Batch start is the dataset row index of the
//! first row in the file, so lexically unordered directories still
//! reload in row order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::debug;

/// Number of statements per activation file
pub const ACTS_BATCH_SIZE: usize = 400;

/// Tensor name used inside each batch file
const ACTS_TENSOR: &str = "acts";

/// Directory holding one dataset's activation files
pub fn acts_dir(out_dir: &Path, dataset: &str, limit: usize) -> PathBuf {
    out_dir.join(format!("{dataset}-{limit}"))
}

/// File path for the batch starting at row `batch_start`
pub fn batch_path(dir: &Path, tag: &str, batch_start: usize) -> PathBuf {
    dir.join(format!("{tag}_{batch_start}.safetensors"))
}

/// Write one batch of activations, shape `[batch_len, dim]`, as F32
pub fn save_batch(dir: &Path, tag: &str, batch_start: usize, acts: &Tensor) -> Result<PathBuf> {
    let path = batch_path(dir, tag, batch_start);
    let acts = acts.to_dtype(DType::F32)?;

    let mut tensors = HashMap::new();
    tensors.insert(ACTS_TENSOR.to_string(), acts);
    candle_core::safetensors::save(&tensors, &path)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    debug!("Wrote batch file {}", path.display());
    Ok(path)
}

/// Find every batch file for `tag` in `dir`, ordered by batch start index.
///
/// Files whose name does not parse as `<tag>_<index>.safetensors` are
/// ignored.
pub fn list_batches(dir: &Path, tag: &str) -> Result<Vec<(usize, PathBuf)>> {
    let prefix = format!("{tag}_");
    let mut batches = Vec::new();

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read activation directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".safetensors") else {
            continue;
        };
        let Some(index) = stem.strip_prefix(&prefix) else {
            continue;
        };
        if let Ok(start) = index.parse::<usize>() {
            batches.push((start, path));
        }
    }

    batches.sort_by_key(|(start, _)| *start);
    Ok(batches)
}

/// Load every stored batch for `tag`, concatenated in row order.
///
/// `center` subtracts the per-column mean; `scale` divides by the
/// unbiased per-column standard deviation.
pub fn load_acts(
    dir: &Path,
    tag: &str,
    center: bool,
    scale: bool,
    device: &Device,
) -> Result<Tensor> {
    let batches = list_batches(dir, tag)?;
    anyhow::ensure!(
        !batches.is_empty(),
        "No activation files for tag '{tag}' in {}",
        dir.display()
    );

    let mut parts = Vec::with_capacity(batches.len());
    for (start, path) in &batches {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        let acts = tensors
            .get(ACTS_TENSOR)
            .with_context(|| format!("No '{ACTS_TENSOR}' tensor in {}", path.display()))?
            .clone();
        debug!("Loaded batch {} ({:?})", start, acts.dims());
        parts.push(acts);
    }

    let refs: Vec<&Tensor> = parts.iter().collect();
    let mut acts = Tensor::cat(&refs, 0)?;

    let n = acts.dim(0)?;
    let mean = acts.mean_keepdim(0)?;
    let centered = acts.broadcast_sub(&mean)?;

    if scale {
        anyhow::ensure!(n > 1, "Scaling needs at least two rows, got {n}");
    }
    if center {
        acts = centered.clone();
    }
    if scale {
        let var = (centered.sqr()?.sum_keepdim(0)? / (n as f64 - 1.0))?;
        let std = var.sqrt()?;
        acts = acts.broadcast_div(&std)?;
    }

    Ok(acts)
}
