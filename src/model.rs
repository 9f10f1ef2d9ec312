//! GPT-2 causal language model used for loss measurements
//!
//! The module layout follows the Hugging Face checkpoint naming (`wte`, `wpe`,
//! `h.{i}.attn.c_attn`, ...) so that `model.safetensors` can be memory mapped
//! straight into a `VarBuilder`.

use crate::error::MeasurementError;
use anyhow::Context;
use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{embedding, ops::softmax, Embedding, Linear, VarBuilder};
use core::f64;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Label value excluded from the loss
pub const DEFAULT_IGNORE_INDEX: i64 = -100;

/// A model able to score a token sequence
pub trait CausalLanguageModel {
    /// Mean next-token negative log-likelihood.
    ///
    /// `labels[t]` is the token expected at position `t`; it is predicted from
    /// the logits at `t - 1`. Positions labelled `DEFAULT_IGNORE_INDEX` do not
    /// contribute.
    fn mean_nll(
        &self,
        input_ids: &[u32],
        labels: &[i64],
    ) -> std::result::Result<f64, MeasurementError>;

    /// Longest sequence the model accepts
    fn context_length(&self) -> usize;
}

/// Pairs each scored label with the logit row predicting it.
///
/// Returns `(logit_rows, targets)`. Empty when nothing is left to score.
pub fn shifted_targets(labels: &[i64]) -> (Vec<u32>, Vec<u32>) {
    labels
        .iter()
        .enumerate()
        .skip(1)
        .filter(|&(_, &label)| label != DEFAULT_IGNORE_INDEX)
        .map(|(pos, &label)| ((pos - 1) as u32, label as u32))
        .unzip()
}

/// Config for specifying parameters of a GPT-2 model
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    #[serde(rename = "n_positions")]
    pub context_length: usize,
    #[serde(rename = "n_embd")]
    pub emb_dim: usize,
    #[serde(rename = "n_head")]
    pub n_heads: usize,
    #[serde(rename = "n_layer")]
    pub n_layers: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Config {
    /// Returns configuration for GPT-2 small
    pub fn gpt2_124m() -> Self {
        Self {
            vocab_size: 50_257,
            context_length: 1_024,
            emb_dim: 768,
            n_heads: 12,
            n_layers: 12,
            layer_norm_epsilon: 1e-5,
        }
    }

    /// Returns a custom configuration for GPT-2 to be used in unit tests
    pub fn gpt_sm_test() -> Self {
        Self {
            vocab_size: 500,
            context_length: 10,
            emb_dim: 12,
            n_heads: 3,
            n_layers: 2,
            layer_norm_epsilon: 1e-5,
        }
    }
}

/// A layer normalization struct
#[derive(Clone, Debug)]
pub struct LayerNorm {
    eps: f64,
    scale: Tensor,
    shift: Tensor,
}

impl LayerNorm {
    pub fn new(emb_dim: usize, eps: f64, vb: VarBuilder<'_>) -> Result<Self> {
        let scale = vb.get_with_hints(emb_dim, "weight", candle_nn::Init::Const(1.))?;
        let shift = vb.get_with_hints(emb_dim, "bias", candle_nn::Init::Const(0.))?;
        Ok(Self { eps, scale, shift })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let var = xs.broadcast_sub(&mean)?.sqr()?.mean_keepdim(D::Minus1)?;
        let norm_xs = xs
            .broadcast_sub(&mean)?
            .broadcast_div(&(var + self.eps)?.sqrt()?)?;
        norm_xs.broadcast_mul(&self.scale)?.broadcast_add(&self.shift)
    }
}

/// Tanh approximation of GELU, as used by GPT-2
#[derive(Clone, Debug)]
pub struct GELU;

impl Module for GELU {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        (0.5_f64 * xs)?.mul(
            &((2_f64 / f64::consts::PI).sqrt() * (xs + (xs.mul(xs)?.mul(xs)? * 0.044715f64)?)?)?
                .tanh()?
                .affine(1., 1.)?,
        )
    }
}

/// GPT-2 checkpoints store projections as `Conv1D` with an `(in, out)`
/// weight, the transpose of what `Linear` expects.
fn conv1d(in_dim: usize, out_dim: usize, vb: VarBuilder<'_>) -> Result<Linear> {
    let weight = vb.get((in_dim, out_dim), "weight")?;
    let bias = vb.get(out_dim, "bias")?;
    Ok(Linear::new(weight.t()?.contiguous()?, Some(bias)))
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let shape = mask.shape();
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(shape.dims())?;
    mask.where_cond(&on_true, on_false)
}

/// Causal multi-head attention with a fused query/key/value projection
#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    c_attn: Linear,
    c_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        if cfg.emb_dim % cfg.n_heads != 0 {
            candle_core::bail!("emb_dim must be divisible by n_heads")
        }
        let c_attn = conv1d(cfg.emb_dim, 3 * cfg.emb_dim, vb.pp("c_attn"))?;
        let c_proj = conv1d(cfg.emb_dim, cfg.emb_dim, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            num_heads: cfg.n_heads,
            head_dim: cfg.emb_dim / cfg.n_heads,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, num_tokens, _) = xs.dims3()?;
        xs.reshape((b, num_tokens, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

impl Module for MultiHeadAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, num_tokens, d_out) = xs.dims3()?;
        let qkv = self.c_attn.forward(xs)?;
        let queries = self.split_heads(&qkv.narrow(D::Minus1, 0, d_out)?)?;
        let keys = self.split_heads(&qkv.narrow(D::Minus1, d_out, d_out)?)?;
        let values = self.split_heads(&qkv.narrow(D::Minus1, 2 * d_out, d_out)?)?;

        let attn_scores = queries.matmul(&keys.t()?)?;
        let mask: Vec<u32> = (0..num_tokens as u32)
            .flat_map(|i| (0..num_tokens as u32).map(move |j| u32::from(j > i)))
            .collect();
        let mask = Tensor::from_slice(&mask, (num_tokens, num_tokens), xs.device())?
            .broadcast_as(attn_scores.shape())?;
        let masked = masked_fill(&attn_scores, &mask, f32::NEG_INFINITY)?;
        let scaling = 1. / (self.head_dim as f64).sqrt();
        let attn_weights = softmax(&(masked * scaling)?, D::Minus1)?;

        let context_vec = attn_weights
            .matmul(&values)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, num_tokens, d_out))?;
        self.c_proj.forward(&context_vec)
    }
}

/// A feed forward neural network module
#[derive(Clone, Debug)]
pub struct FeedForward {
    c_fc: Linear,
    c_proj: Linear,
}

impl FeedForward {
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        let c_fc = conv1d(cfg.emb_dim, 4_usize * cfg.emb_dim, vb.pp("c_fc"))?;
        let c_proj = conv1d(4_usize * cfg.emb_dim, cfg.emb_dim, vb.pp("c_proj"))?;
        Ok(Self { c_fc, c_proj })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.c_fc.forward(xs)?;
        let xs = GELU.forward(&xs)?;
        self.c_proj.forward(&xs)
    }
}

/// The transformer block component of GPT
#[derive(Clone, Debug)]
pub struct TransformerBlock {
    att: MultiHeadAttention,
    ff: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
}

impl TransformerBlock {
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        let att = MultiHeadAttention::new(cfg, vb.pp("attn"))?;
        let ff = FeedForward::new(cfg, vb.pp("mlp"))?;
        let norm1 = LayerNorm::new(cfg.emb_dim, cfg.layer_norm_epsilon, vb.pp("ln_1"))?;
        let norm2 = LayerNorm::new(cfg.emb_dim, cfg.layer_norm_epsilon, vb.pp("ln_2"))?;
        Ok(Self {
            att,
            ff,
            norm1,
            norm2,
        })
    }
}

impl Module for TransformerBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let shortcut = xs.clone();
        let x = self.att.forward(&self.norm1.forward(xs)?)?;
        let x = (x + shortcut)?;

        let shortcut = x.clone();
        let x = self.ff.forward(&self.norm2.forward(&x)?)?;
        x + shortcut
    }
}

/// The GPT model architecture implementation
pub struct GPTModel {
    cfg: Config,
    tok_emb: Embedding,
    pos_emb: Embedding,
    trf_blocks: Vec<TransformerBlock>,
    final_norm: LayerNorm,
    out_head: Linear,
}

impl GPTModel {
    /// Creates a new `GPTModel`
    ///
    /// ```rust
    /// use candle_core::{Device, DType};
    /// use candle_nn::VarBuilder;
    /// use ifd_select_rs::model::{Config, GPTModel};
    ///
    /// let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    /// let cfg = Config::gpt_sm_test();
    /// let model = GPTModel::new(cfg, vb).unwrap();
    /// ```
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        let tok_emb = embedding(cfg.vocab_size, cfg.emb_dim, vb.pp("wte"))?;
        let pos_emb = embedding(cfg.context_length, cfg.emb_dim, vb.pp("wpe"))?;
        let trf_blocks = (0..cfg.n_layers)
            .map(|ix| TransformerBlock::new(cfg, vb.pp(format!("h.{ix}"))))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = LayerNorm::new(cfg.emb_dim, cfg.layer_norm_epsilon, vb.pp("ln_f"))?;
        // output head shares its weight with the token embedding
        let out_head = Linear::new(tok_emb.embeddings().clone(), None);
        Ok(Self {
            cfg,
            tok_emb,
            pos_emb,
            trf_blocks,
            final_norm,
            out_head,
        })
    }

    /// Loads a Hugging Face GPT-2 checkpoint from disk
    pub fn from_files(config_file: &Path, weights_file: &Path, dev: &Device) -> anyhow::Result<Self> {
        let config_str = std::fs::read_to_string(config_file)
            .with_context(|| format!("Unable to read {}", config_file.display()))?;
        let cfg: Config = serde_json::from_str(&config_str)
            .with_context(|| format!("Unable to parse {}", config_file.display()))?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_file.to_path_buf()], DType::F32, dev)?
        };
        // some checkpoints nest the weights under `transformer.`
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };
        Ok(Self::new(cfg, vb)?)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Returns logits of shape `(batch, seq_len, vocab_size)`
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_batch_size, seq_len) = xs.dims2()?;
        let tok_embeds = self.tok_emb.forward(xs)?;
        let pos_ids = Tensor::arange(0u32, seq_len as u32, xs.device())?;
        let pos_embeds = self.pos_emb.forward(&pos_ids)?;

        let mut x = tok_embeds.broadcast_add(&pos_embeds)?;
        for block in self.trf_blocks.iter() {
            x = block.forward(&x)?;
        }
        x = self.final_norm.forward(&x)?;
        self.out_head.forward(&x)
    }
}

impl CausalLanguageModel for GPTModel {
    fn mean_nll(
        &self,
        input_ids: &[u32],
        labels: &[i64],
    ) -> std::result::Result<f64, MeasurementError> {
        if input_ids.len() > self.cfg.context_length {
            return Err(MeasurementError::ContextOverflow {
                len: input_ids.len(),
                context_length: self.cfg.context_length,
            });
        }
        let (rows, targets) = shifted_targets(labels);
        if rows.is_empty() {
            return Err(MeasurementError::EmptyTarget);
        }

        let dev = self.tok_emb.embeddings().device();
        let inputs = Tensor::new(input_ids, dev)?.unsqueeze(0)?;
        let logits = self.forward(&inputs)?.squeeze(0)?;
        let rows = Tensor::new(&rows[..], dev)?;
        let targets = Tensor::new(&targets[..], dev)?;
        let logits = logits.index_select(&rows, 0)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &targets)?;
        let loss = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        Ok(loss)
    }

    fn context_length(&self) -> usize {
        self.cfg.context_length
    }
}

/// Files making up a GPT-2 checkpoint
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub weights: PathBuf,
    pub tokenizer: Option<PathBuf>,
}

impl ModelFiles {
    /// Resolves `model_name_or_path` as a local directory first, then as a
    /// repository id on the Hugging Face hub
    pub fn resolve(model_name_or_path: &str) -> anyhow::Result<Self> {
        let local = Path::new(model_name_or_path);
        if local.is_dir() {
            let tokenizer = local.join("tokenizer.json");
            return Ok(Self {
                config: local.join("config.json"),
                weights: local.join("model.safetensors"),
                tokenizer: tokenizer.is_file().then_some(tokenizer),
            });
        }

        let api = hf_hub::api::sync::Api::new()?;
        let repo = api.model(model_name_or_path.to_string());
        let config = repo
            .get("config.json")
            .with_context(|| format!("Unable to fetch config.json for {model_name_or_path}"))?;
        let weights = repo
            .get("model.safetensors")
            .with_context(|| format!("Unable to fetch weights for {model_name_or_path}"))?;
        let info = repo
            .info()
            .with_context(|| format!("Unable to list files of {model_name_or_path}"))?;
        let tokenizer = if info.siblings.iter().any(|f| f.rfilename == "tokenizer.json") {
            let file = repo
                .get("tokenizer.json")
                .with_context(|| format!("Unable to fetch tokenizer.json for {model_name_or_path}"))?;
            Some(file)
        } else {
            None
        };
        Ok(Self {
            config,
            weights,
            tokenizer,
        })
    }
}
