use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{embedding, linear_no_bias, rms_norm, rotary_emb::rope, Embedding, Linear, RmsNorm, VarBuilder};
use candle_transformers::utils::repeat_kv;

use super::config::{Phi4MmModelConfig, RopeScaling};
use super::lora::{Adapter, LoraLinear};

/// Partial rotary embedding with LongRoPE rescaling.
///
/// Only the first `dim` channels of every head are rotated. The short factors
/// are used while the sequence fits in the original context window, the long
/// factors beyond it.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    dim: usize,
    short_inv_freq: Tensor,
    long_inv_freq: Tensor,
    original_max_position_embeddings: usize,
    attention_factor: f64,
    dtype: DType,
}

impl RotaryEmbedding {
    pub fn new(
        dim: usize,
        rope_theta: f64,
        rope_scaling: Option<&RopeScaling>,
        max_position_embeddings: usize,
        original_max_position_embeddings: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq = |factors: Option<&[f64]>| -> Result<Tensor> {
            let values = (0..dim)
                .step_by(2)
                .enumerate()
                .map(|(i, d)| {
                    let factor = factors.and_then(|f| f.get(i)).copied().unwrap_or(1.0);
                    (1.0 / (factor * rope_theta.powf(d as f64 / dim as f64))) as f32
                })
                .collect::<Vec<_>>();
            Tensor::new(values, device)
        };

        let (short_inv_freq, long_inv_freq, attention_factor) = match rope_scaling {
            Some(scaling) => {
                let scale = max_position_embeddings as f64 / original_max_position_embeddings as f64;
                let attention_factor = if scale <= 1.0 {
                    1.0
                } else {
                    (1.0 + scale.ln() / (original_max_position_embeddings as f64).ln()).sqrt()
                };
                (
                    inv_freq(Some(&scaling.short_factor))?,
                    inv_freq(Some(&scaling.long_factor))?,
                    attention_factor,
                )
            }
            None => {
                let plain = inv_freq(None)?;
                (plain.clone(), plain, 1.0)
            }
        };

        Ok(Self {
            dim,
            short_inv_freq,
            long_inv_freq,
            original_max_position_embeddings,
            attention_factor,
            dtype,
        })
    }

    pub fn from_config(cfg: &Phi4MmModelConfig, dtype: DType, device: &Device) -> Result<Self> {
        Self::new(
            cfg.rotary_dim(),
            cfg.rope_theta,
            cfg.rope_scaling.as_ref(),
            cfg.max_position_embeddings,
            cfg.original_max_position_embeddings(),
            dtype,
            device,
        )
    }

    /// `[seq_len, dim / 2]` cos and sin tables for positions `index_pos..index_pos + seq_len`.
    pub fn cos_sin(&self, index_pos: usize, seq_len: usize) -> Result<(Tensor, Tensor)> {
        let inv_freq = if index_pos + seq_len > self.original_max_position_embeddings {
            &self.long_inv_freq
        } else {
            &self.short_inv_freq
        };
        let positions = Tensor::arange(index_pos as u32, (index_pos + seq_len) as u32, inv_freq.device())?
            .to_dtype(DType::F32)?
            .reshape((seq_len, 1))?;
        let freqs = positions.matmul(&inv_freq.reshape((1, self.dim / 2))?)?;
        let cos = (freqs.cos()? * self.attention_factor)?.to_dtype(self.dtype)?;
        let sin = (freqs.sin()? * self.attention_factor)?.to_dtype(self.dtype)?;
        Ok((cos, sin))
    }

    /// Rotate the leading `dim` channels of `x` with shape `[b, heads, seq, head_dim]`.
    pub fn apply(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let head_dim = x.dim(D::Minus1)?;
        let x_rot = rope(&x.narrow(D::Minus1, 0, self.dim)?.contiguous()?, cos, sin)?;
        if self.dim == head_dim {
            return Ok(x_rot);
        }
        let x_pass = x.narrow(D::Minus1, self.dim, head_dim - self.dim)?;
        Tensor::cat(&[&x_rot, &x_pass], D::Minus1)
    }
}

#[derive(Debug, Clone)]
struct Attention {
    qkv_proj: LoraLinear,
    o_proj: LoraLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn new(cfg: &Phi4MmModelConfig, vb: VarBuilder) -> Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let num_kv_heads = cfg.num_kv_heads();
        let head_dim = cfg.head_dim();
        let op_size = (num_heads + 2 * num_kv_heads) * head_dim;

        Ok(Self {
            qkv_proj: LoraLinear::new(
                cfg.hidden_size,
                op_size,
                cfg.vision_lora,
                cfg.speech_lora,
                vb.pp("qkv_proj"),
            )?,
            o_proj: LoraLinear::new(
                num_heads * head_dim,
                cfg.hidden_size,
                cfg.vision_lora,
                cfg.speech_lora,
                vb.pp("o_proj"),
            )?,
            num_heads,
            num_kv_heads,
            head_dim,
            kv_cache: None,
        })
    }

    fn forward(
        &mut self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        (cos, sin): (&Tensor, &Tensor),
        mask: Option<&Tensor>,
        adapter: Option<Adapter>,
    ) -> Result<Tensor> {
        let (b, seq_len, _hidden) = x.dims3()?;
        let qkv = self.qkv_proj.forward(x, adapter)?;

        let q_size = self.num_heads * self.head_dim;
        let kv_size = self.num_kv_heads * self.head_dim;
        let split = |start: usize, size: usize, heads: usize| {
            qkv.narrow(D::Minus1, start, size)?
                .reshape((b, seq_len, heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(0, q_size, self.num_heads)?;
        let k = split(q_size, kv_size, self.num_kv_heads)?;
        let v = split(q_size + kv_size, kv_size, self.num_kv_heads)?;

        let q = rotary.apply(&q, cos, sin)?;
        let k = rotary.apply(&k, cos, sin)?;

        // new tokens always extend the cached sequence
        let (k, v) = match &self.kv_cache {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, &k], 2)?,
                Tensor::cat(&[prev_v, &v], 2)?,
            ),
            None => (k, v),
        };
        self.kv_cache = Some((k.clone(), v.clone()));

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let y = {
            let in_dtype = q.dtype();
            let q = q.to_dtype(DType::F32)?;
            let k = k.to_dtype(DType::F32)?;
            let v = v.to_dtype(DType::F32)?;

            let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
            let att = match mask {
                Some(mask) => att.broadcast_add(mask)?,
                None => att,
            };
            let att = candle_nn::ops::softmax_last_dim(&att)?;
            att.matmul(&v)?.to_dtype(in_dtype)?
        };

        let y = y.transpose(1, 2)?.reshape((b, seq_len, q_size))?;
        self.o_proj.forward(&y, adapter)
    }

    fn clear_kv_cache(&mut self) {
        self.kv_cache = None;
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    gate_up_proj: LoraLinear,
    down_proj: LoraLinear,
    intermediate_size: usize,
}

impl Mlp {
    fn new(cfg: &Phi4MmModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate_up_proj: LoraLinear::new(
                cfg.hidden_size,
                2 * cfg.intermediate_size,
                cfg.vision_lora,
                cfg.speech_lora,
                vb.pp("gate_up_proj"),
            )?,
            down_proj: LoraLinear::new(
                cfg.intermediate_size,
                cfg.hidden_size,
                cfg.vision_lora,
                cfg.speech_lora,
                vb.pp("down_proj"),
            )?,
            intermediate_size: cfg.intermediate_size,
        })
    }

    fn forward(&self, x: &Tensor, adapter: Option<Adapter>) -> Result<Tensor> {
        let gate_up = self.gate_up_proj.forward(x, adapter)?;
        let gate = gate_up.narrow(D::Minus1, 0, self.intermediate_size)?;
        let up = gate_up.narrow(D::Minus1, self.intermediate_size, self.intermediate_size)?;
        self.down_proj.forward(&(up * gate.silu()?)?, adapter)
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    fn new(cfg: &Phi4MmModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            input_layernorm: rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            self_attn: Attention::new(cfg, vb.pp("self_attn"))?,
            post_attention_layernorm: rms_norm(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(
        &mut self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        cos_sin: (&Tensor, &Tensor),
        mask: Option<&Tensor>,
        adapter: Option<Adapter>,
    ) -> Result<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self.self_attn.forward(&x, rotary, cos_sin, mask, adapter)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.mlp.forward(&x, adapter)?;
        residual + x
    }
}

/// Phi-3 style decoder: fused projections, grouped query attention, partial rotary embeddings.
pub struct TextModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
}

impl TextModel {
    /*
    model.embed_tokens.weight
    model.layers.0.input_layernorm.weight
    model.layers.0.self_attn.qkv_proj.base_layer.weight
    model.layers.0.self_attn.qkv_proj.lora_A.vision.weight
    model.layers.0.self_attn.qkv_proj.lora_B.vision.weight
    model.layers.0.self_attn.o_proj.base_layer.weight
    model.layers.0.post_attention_layernorm.weight
    model.layers.0.mlp.gate_up_proj.base_layer.weight
    model.layers.0.mlp.down_proj.base_layer.weight
    model.norm.weight
     */
    pub fn new(cfg: &Phi4MmModelConfig, vb: VarBuilder) -> Result<Self> {
        let vb_m = vb.pp("model");
        let embed_tokens = embedding(cfg.vocab_size, cfg.hidden_size, vb_m.pp("embed_tokens"))?;
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| DecoderLayer::new(cfg, vb_m.pp("layers").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb_m.pp("norm"))?;

        let lm_head = if vb.contains_tensor("lm_head.weight") {
            linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        } else {
            Linear::new(embed_tokens.embeddings().clone(), None)
        };

        Ok(Self {
            rotary: RotaryEmbedding::from_config(cfg, vb.dtype(), vb.device())?,
            embed_tokens,
            layers,
            norm,
            lm_head,
        })
    }

    /// `[seq]` token ids => `[seq, hidden]` embeddings.
    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens.forward(input_ids)
    }

    /// Run the decoder over `[b, seq, hidden]` embeddings placed at `index_pos`
    /// and return the logits of the last position, `[b, vocab]`.
    pub fn forward_embeds(
        &mut self,
        embeds: &Tensor,
        index_pos: usize,
        adapter: Option<Adapter>,
    ) -> Result<Tensor> {
        let (_b, seq_len, _hidden) = embeds.dims3()?;
        let (cos, sin) = self.rotary.cos_sin(index_pos, seq_len)?;
        let mask = if seq_len == 1 {
            None
        } else {
            Some(causal_mask(seq_len, index_pos + seq_len, embeds.device())?)
        };

        let mut x = embeds.clone();
        for layer in self.layers.iter_mut() {
            x = layer.forward(&x, &self.rotary, (&cos, &sin), mask.as_ref(), adapter)?;
        }
        let x = x.narrow(1, seq_len - 1, 1)?;
        let x = self.norm.forward(&x)?;
        self.lm_head.forward(&x)?.squeeze(1)
    }

    pub fn clear_kv_cache(&mut self) {
        self.layers
            .iter_mut()
            .for_each(|layer| layer.self_attn.clear_kv_cache());
    }
}

/// `[seq_len, total_len]` additive mask for the last `seq_len` positions of a
/// `total_len` long sequence.
fn causal_mask(seq_len: usize, total_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = ((total_len - seq_len)..total_len)
        .flat_map(|i| (0..total_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq_len, total_len), device)
}
