//! Quantized LLaMA forward pass loaded from GGUF
//!
//! Same layer-by-layer structure as the safetensors backend, but the
//! projection weights stay in their quantized blocks and go through
//! `QMatMul`. This is the reduced-memory inference mode: a Q8_0 or
//! Q4_K file stands in for 8-bit / 4-bit loading.
//!
//! Computation runs in F32; only the matmul weights are quantized.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::quantized::{gguf_file, QMatMul};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Embedding, RmsNorm};
use tracing::info;

use crate::cache::ActivationCache;
use crate::forward_llama::{repeat_kv, RotaryEmbedding};
use crate::masks::create_causal_mask;
use crate::model::ActsBackend;

/// Multi-head attention over quantized projections
struct QAttention {
    q_proj: QMatMul,
    k_proj: QMatMul,
    v_proj: QMatMul,
    o_proj: QMatMul,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl QAttention {
    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        let q = q
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rotary.apply(&q, &k)?;

        let k = repeat_kv(k, self.num_heads / self.num_kv_heads)?;
        let v = repeat_kv(v, self.num_heads / self.num_kv_heads)?;

        let q = q.contiguous()?;
        let k = k.contiguous()?;
        let v = v.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;

        let mask = create_causal_mask(seq_len, x.device(), x.dtype())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;

        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

/// SwiGLU MLP over quantized projections
struct QMlp {
    gate_proj: QMatMul,
    up_proj: QMatMul,
    down_proj: QMatMul,
}

impl QMlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?;
        let gate = candle_nn::ops::silu(&gate)?;
        let up = self.up_proj.forward(x)?;
        let hidden = (gate * up)?;
        Ok(self.down_proj.forward(&hidden)?)
    }
}

/// Single decoder layer (norm weights are dequantized at load time)
struct QDecoderLayer {
    self_attn: QAttention,
    mlp: QMlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl QDecoderLayer {
    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self.self_attn.forward(&x, rotary)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        Ok((residual + x)?)
    }
}

/// LLaMA model loaded from a GGUF file, with activation capture
pub struct QuantizedLlama {
    embed_tokens: Embedding,
    layers: Vec<QDecoderLayer>,
    norm: RmsNorm,
    lm_head: QMatMul,
    rotary: RotaryEmbedding,
    n_layers: usize,
    hidden_size: usize,
    vocab_size: usize,
}

impl QuantizedLlama {
    /// Load a quantized model from a local GGUF file
    pub fn load(gguf_path: &Path, device: &Device) -> Result<Self> {
        info!("Loading quantized LLaMA from: {}", gguf_path.display());

        let mut file = std::fs::File::open(gguf_path)
            .with_context(|| format!("Failed to open GGUF file {}", gguf_path.display()))?;
        let content =
            gguf_file::Content::read(&mut file).context("Failed to parse GGUF header")?;

        let md = |key: &str| {
            content
                .metadata
                .get(key)
                .with_context(|| format!("GGUF metadata missing key {key}"))
        };

        let n_layers = md("llama.block_count")?.to_u32()? as usize;
        let hidden_size = md("llama.embedding_length")?.to_u32()? as usize;
        let num_heads = md("llama.attention.head_count")?.to_u32()? as usize;
        let num_kv_heads = md("llama.attention.head_count_kv")?.to_u32()? as usize;
        let rms_eps = f64::from(md("llama.attention.layer_norm_rms_epsilon")?.to_f32()?);
        let rope_theta = content
            .metadata
            .get("llama.rope.freq_base")
            .and_then(|v| v.to_f32().ok())
            .map_or(10_000.0, f64::from);
        let max_positions = content
            .metadata
            .get("llama.context_length")
            .and_then(|v| v.to_u32().ok())
            .map_or(4096, |v| v as usize);
        let head_dim = hidden_size / num_heads;

        info!(
            "GGUF config: {} layers, {} hidden, {} heads ({} kv)",
            n_layers, hidden_size, num_heads, num_kv_heads
        );

        // Embedding table is dequantized once; it is a lookup, not a matmul
        let embed_q = content.tensor(&mut file, "token_embd.weight", device)?;
        let embed_weight = embed_q.dequantize(device)?;
        let vocab_size = embed_weight.dim(0)?;
        let embed_tokens = Embedding::new(embed_weight, hidden_size);

        let mut layers = Vec::with_capacity(n_layers);
        for i in 0..n_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, n_layers);
            }
            let prefix = format!("blk.{i}");

            let q_proj = QMatMul::from_qtensor(content.tensor(
                &mut file,
                &format!("{prefix}.attn_q.weight"),
                device,
            )?)?;
            let k_proj = QMatMul::from_qtensor(content.tensor(
                &mut file,
                &format!("{prefix}.attn_k.weight"),
                device,
            )?)?;
            let v_proj = QMatMul::from_qtensor(content.tensor(
                &mut file,
                &format!("{prefix}.attn_v.weight"),
                device,
            )?)?;
            let o_proj = QMatMul::from_qtensor(content.tensor(
                &mut file,
                &format!("{prefix}.attn_output.weight"),
                device,
            )?)?;

            let gate_proj = QMatMul::from_qtensor(content.tensor(
                &mut file,
                &format!("{prefix}.ffn_gate.weight"),
                device,
            )?)?;
            let up_proj = QMatMul::from_qtensor(content.tensor(
                &mut file,
                &format!("{prefix}.ffn_up.weight"),
                device,
            )?)?;
            let down_proj = QMatMul::from_qtensor(content.tensor(
                &mut file,
                &format!("{prefix}.ffn_down.weight"),
                device,
            )?)?;

            let attn_norm = content
                .tensor(&mut file, &format!("{prefix}.attn_norm.weight"), device)?
                .dequantize(device)?;
            let ffn_norm = content
                .tensor(&mut file, &format!("{prefix}.ffn_norm.weight"), device)?
                .dequantize(device)?;

            layers.push(QDecoderLayer {
                self_attn: QAttention {
                    q_proj,
                    k_proj,
                    v_proj,
                    o_proj,
                    num_heads,
                    num_kv_heads,
                    head_dim,
                },
                mlp: QMlp {
                    gate_proj,
                    up_proj,
                    down_proj,
                },
                input_layernorm: RmsNorm::new(attn_norm, rms_eps),
                post_attention_layernorm: RmsNorm::new(ffn_norm, rms_eps),
            });
        }

        let norm_weight = content
            .tensor(&mut file, "output_norm.weight", device)?
            .dequantize(device)?;
        let norm = RmsNorm::new(norm_weight, rms_eps);

        let lm_head = QMatMul::from_qtensor(content.tensor(&mut file, "output.weight", device)?)?;

        let rotary =
            RotaryEmbedding::new(head_dim, max_positions, rope_theta, device, DType::F32)?;

        info!(
            "Quantized model loaded with {} layers (vocab_size: {})",
            n_layers, vocab_size
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            n_layers,
            hidden_size,
            vocab_size,
        })
    }

    /// Forward pass capturing the last-token residual after every layer.
    ///
    /// Same contract as the safetensors backend: returns the lm-head
    /// output at the final token position plus the per-layer cache.
    pub fn forward_with_acts(&self, input_ids: &Tensor) -> Result<(Tensor, ActivationCache)> {
        let mut cache = ActivationCache::with_capacity(self.n_layers);
        let seq_len = input_ids.dim(1)?;

        let mut hidden = self.embed_tokens.forward(input_ids)?;

        for layer in &self.layers {
            hidden = layer.forward(&hidden, &self.rotary)?;

            let last_token = hidden.i((.., seq_len - 1, ..))?.squeeze(1)?;
            cache.push(last_token);
        }

        let normed = self.norm.forward(&hidden)?;
        let last_hidden = normed.i((.., seq_len - 1, ..))?.squeeze(1)?;
        let head_out = self.lm_head.forward(&last_hidden)?.squeeze(0)?;

        Ok((head_out, cache))
    }
}

impl ActsBackend for QuantizedLlama {
    fn n_layers(&self) -> usize {
        self.n_layers
    }

    fn d_model(&self) -> usize {
        self.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn forward_with_acts(&self, input_ids: &Tensor) -> Result<(Tensor, ActivationCache)> {
        self.forward_with_acts(input_ids)
    }
}
