// Pedantic clippy configuration for ML/math code.
// These are acceptable in numerical work:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::many_single_char_names)] // x, q, k, v standard in math
#![allow(clippy::module_name_repetitions)] // ProbeModel in model.rs is fine
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! statprobe: statement activation harvesting and truth probing
//!
//! Runs a causal language model over labeled statement datasets,
//! captures the lm-head output (or a chosen layer's residual stream) at
//! the last token of each statement, stores the vectors in fixed-size
//! batches, and trains linear probes on the stored activations.
//!
//! ## Architecture
//!
//! - `model`: High-level ProbeModel wrapper and the backend trait
//! - `forward_llama`: LLaMA forward pass with activation capture (safetensors)
//! - `forward_quantized`: GGUF-quantized LLaMA forward pass with capture
//! - `cache`: ActivationCache for per-layer last-token residuals
//! - `masks`: Shared causal-mask utilities
//! - `dataset`: Statement CSV loading and seeded splits
//! - `store`: Batched activation files and the center/scale loader
//! - `extract`: Extraction runner coordinating datasets and batches
//! - `probe`: Logistic-regression truth probes over stored activations

pub mod cache;
pub mod dataset;
pub mod extract;
pub mod forward_llama;
pub mod forward_quantized;
pub mod masks;
pub mod model;
pub mod probe;
pub mod store;

pub use cache::ActivationCache;
pub use dataset::{split_indices, Dataset, Statement};
pub use extract::{ExtractConfig, ExtractSummary, Extractor};
pub use forward_llama::{LlamaConfig, LlamaModel};
pub use forward_quantized::QuantizedLlama;
pub use masks::{clear_mask_caches, create_causal_mask};
pub use model::{ActsBackend, CapturePoint, ProbeModel, WeightSource};
pub use probe::{ProbeResults, ProbeTrainer};
pub use store::{acts_dir, batch_path, list_batches, load_acts, save_batch, ACTS_BATCH_SIZE};
