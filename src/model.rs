//! ProbeModel wrapper for activation extraction
//!
//! Wraps a tokenizer plus a model backend (safetensors or GGUF) behind a
//! unified interface that turns a statement into one captured vector.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::cache::ActivationCache;
use crate::forward_llama::LlamaModel;
use crate::forward_quantized::QuantizedLlama;

/// Where in the network the activation is taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePoint {
    /// Output of the lm-head projection at the last token (`vocab_size` dims)
    LmHead,
    /// Residual stream after decoder layer `i` at the last token (`d_model` dims)
    Layer(usize),
}

impl CapturePoint {
    /// Dimension of the captured vector for a given backend
    pub fn dim(&self, backend: &dyn ActsBackend) -> usize {
        match self {
            CapturePoint::LmHead => backend.vocab_size(),
            CapturePoint::Layer(_) => backend.d_model(),
        }
    }
}

/// Where the model weights come from
#[derive(Debug, Clone)]
pub enum WeightSource {
    /// Full-precision safetensors from the model repo
    Safetensors,
    /// Quantized GGUF: a local file path
    GgufFile(PathBuf),
    /// Quantized GGUF: a file inside a hub repo
    GgufRepo { repo_id: String, filename: String },
}

/// Unified backend trait for activation extraction.
///
/// Implementing this is the only requirement for adding a new weight
/// format or architecture.
pub trait ActsBackend {
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn vocab_size(&self) -> usize;

    /// Run `input_ids` (shape `[1, seq_len]`) through the model.
    ///
    /// Returns the lm-head output at the last token position, shape
    /// `(vocab_size,)`, plus the per-layer last-token residual cache.
    fn forward_with_acts(&self, input_ids: &Tensor) -> Result<(Tensor, ActivationCache)>;
}

/// High-level model wrapper used by the extraction run
pub struct ProbeModel {
    model: Box<dyn ActsBackend>,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
}

impl ProbeModel {
    /// Load a model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        Self::load(model_id, WeightSource::Safetensors, None)
    }

    /// Load with an explicit weight source and device choice (None = auto-detect)
    pub fn load(
        model_id: &str,
        weights: WeightSource,
        force_cpu: Option<bool>,
    ) -> Result<Self> {
        let (device, dtype) = select_device(force_cpu)?;

        info!("Loading model: {}", model_id);
        info!("Device: {:?}", device);

        // Tokenizer always comes from the model repo
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let model: Box<dyn ActsBackend> = match weights {
            WeightSource::Safetensors => {
                info!("Dtype: {:?}", dtype);
                Box::new(LlamaModel::load(model_id, &device, dtype)?)
            }
            WeightSource::GgufFile(path) => Box::new(QuantizedLlama::load(&path, &device)?),
            WeightSource::GgufRepo { repo_id, filename } => {
                info!("Fetching GGUF {} from {}", filename, repo_id);
                let gguf_repo = api.repo(Repo::new(repo_id.clone(), RepoType::Model));
                let path = gguf_repo
                    .get(&filename)
                    .with_context(|| format!("Failed to download {filename} from {repo_id}"))?;
                Box::new(QuantizedLlama::load(&path, &device)?)
            }
        };

        Ok(Self {
            model,
            tokenizer,
            device,
            model_id: model_id.to_string(),
        })
    }

    /// Get the model ID
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Number of layers in the model
    pub fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    /// Hidden dimension of the model
    pub fn d_model(&self) -> usize {
        self.model.d_model()
    }

    /// Vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    /// Dimension of vectors captured at `point`
    pub fn capture_dim(&self, point: CapturePoint) -> usize {
        point.dim(self.model.as_ref())
    }

    /// Check that a capture point exists in this model
    pub fn validate_capture(&self, point: CapturePoint) -> Result<()> {
        if let CapturePoint::Layer(i) = point {
            anyhow::ensure!(
                i < self.n_layers(),
                "Capture layer {i} out of range (model has {} layers)",
                self.n_layers()
            );
        }
        Ok(())
    }

    /// Run one statement through the model and return the captured vector.
    ///
    /// The returned tensor is 1-D: `(vocab_size,)` for the lm-head point,
    /// `(d_model,)` for a layer point.
    pub fn capture(&self, statement: &str, point: CapturePoint) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(statement, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;

        let input_ids: Vec<u32> = encoding.get_ids().to_vec();
        anyhow::ensure!(!input_ids.is_empty(), "Statement tokenized to zero tokens");
        let input_tensor = Tensor::new(&input_ids[..], &self.device)?.unsqueeze(0)?;

        let (head_out, cache) = self.model.forward_with_acts(&input_tensor)?;

        match point {
            CapturePoint::LmHead => Ok(head_out),
            CapturePoint::Layer(i) => {
                let act = cache
                    .get_layer(i)
                    .ok_or_else(|| anyhow::anyhow!("Layer {i} not in cache"))?;
                Ok(act.squeeze(0)?)
            }
        }
    }
}

/// Pick device and dtype: CUDA/BF16 when available, CPU/F32 otherwise
fn select_device(force_cpu: Option<bool>) -> Result<(Device, DType)> {
    if force_cpu == Some(true) {
        info!("Forcing CPU mode");
        return Ok((Device::Cpu, DType::F32));
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            // BF16 matches the training dtype of current LLaMA checkpoints;
            // F16 clips the range and degrades captured values
            Ok((dev, DType::BF16))
        }
        _ => {
            info!("CUDA not available, using CPU");
            Ok((Device::Cpu, DType::F32))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeBackend;

    impl ActsBackend for FakeBackend {
        fn n_layers(&self) -> usize {
            4
        }
        fn d_model(&self) -> usize {
            16
        }
        fn vocab_size(&self) -> usize {
            100
        }
        fn forward_with_acts(&self, _input_ids: &Tensor) -> Result<(Tensor, ActivationCache)> {
            anyhow::bail!("not a real model")
        }
    }

    #[test]
    fn test_capture_point_dims() {
        let backend = FakeBackend;
        assert_eq!(CapturePoint::LmHead.dim(&backend), 100);
        assert_eq!(CapturePoint::Layer(2).dim(&backend), 16);
    }
}
