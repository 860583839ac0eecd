//! Extraction run: statements in, activation files out
//!
//! Coordinates dataset loading, per-statement forward passes, and
//! batched persistence.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Tensor;
use tracing::{info, warn};

use crate::dataset::Dataset;
use crate::model::{CapturePoint, ProbeModel};
use crate::store::{self, ACTS_BATCH_SIZE};

/// Configuration for an extraction run
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Dataset names (CSV file stems under `data_dir`)
    pub datasets: Vec<String>,
    /// Directory holding dataset CSVs
    pub data_dir: PathBuf,
    /// Directory to write activation files under
    pub output_dir: PathBuf,
    /// Tag used in activation file names
    pub tag: String,
    /// Statements taken from the head of each dataset
    pub limit: usize,
    /// Where the activation is captured
    pub capture: CapturePoint,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            datasets: vec!["truthfulqa".to_string()],
            data_dir: PathBuf::from("datasets"),
            output_dir: PathBuf::from("activations"),
            tag: "llama-2-7b".to_string(),
            limit: 300,
            capture: CapturePoint::LmHead,
        }
    }
}

/// Per-dataset row counts from a finished run
#[derive(Debug)]
pub struct ExtractSummary {
    pub per_dataset: Vec<(String, usize)>,
}

/// Extraction runner
pub struct Extractor {
    config: ExtractConfig,
    model: ProbeModel,
}

impl Extractor {
    /// Create a new extraction run
    pub fn new(model: ProbeModel, config: ExtractConfig) -> Self {
        Self { config, model }
    }

    /// Process every configured dataset
    pub fn run(&self) -> Result<ExtractSummary> {
        self.model.validate_capture(self.config.capture)?;

        info!(
            "Extracting {:?} activations with tag '{}'",
            self.config.capture, self.config.tag
        );

        let mut per_dataset = Vec::with_capacity(self.config.datasets.len());
        for name in &self.config.datasets {
            let n = self
                .extract_dataset(name)
                .with_context(|| format!("Extraction failed for dataset '{name}'"))?;
            per_dataset.push((name.clone(), n));
        }

        Ok(ExtractSummary { per_dataset })
    }

    /// Run one dataset: load, truncate, forward, write batch files
    fn extract_dataset(&self, name: &str) -> Result<usize> {
        let mut dataset = Dataset::load(&self.config.data_dir, name)?;
        info!(
            "Dataset '{}': {} statements ({} true, {} false)",
            name,
            dataset.len(),
            dataset.true_count(),
            dataset.false_count()
        );

        dataset.truncate(self.config.limit);
        if dataset.is_empty() {
            warn!("Dataset '{}' is empty, nothing to extract", name);
            return Ok(0);
        }

        let dir = store::acts_dir(&self.config.output_dir, name, self.config.limit);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let statements = dataset.statements();
        for (batch_idx, chunk) in statements.chunks(ACTS_BATCH_SIZE).enumerate() {
            let batch_start = batch_idx * ACTS_BATCH_SIZE;

            let mut captured = Vec::with_capacity(chunk.len());
            for (i, statement) in chunk.iter().enumerate() {
                let act = self.model.capture(statement, self.config.capture)?;
                captured.push(act);

                let done = batch_start + i + 1;
                if done % 50 == 0 {
                    info!("  {}/{} statements", done, statements.len());
                }
            }

            let refs: Vec<&Tensor> = captured.iter().collect();
            let acts = Tensor::stack(&refs, 0)?;
            info!("Batch {}: acts shape {:?}", batch_start, acts.dims());

            store::save_batch(&dir, &self.config.tag, batch_start, &acts)?;
        }

        info!(
            "Dataset '{}' done: {} rows under {}",
            name,
            statements.len(),
            dir.display()
        );
        Ok(statements.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ExtractConfig::default();
        assert_eq!(config.limit, 300);
        assert_eq!(config.datasets, vec!["truthfulqa".to_string()]);
        assert_eq!(config.capture, CapturePoint::LmHead);
    }
}
