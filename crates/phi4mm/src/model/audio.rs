use candle_core::{bail, Module, Result, Tensor, D};
use candle_nn::{
    conv2d, embedding, layer_norm, linear, Conv2d, Conv2dConfig, Embedding, LayerNorm, Linear,
    VarBuilder,
};

use super::config::ConformerConfig;

/// Load a kernel-size-1 `Conv1d` as a linear layer over the channel dimension.
fn pointwise_conv(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get((out_dim, in_dim, 1), "weight")?.squeeze(2)?;
    let bias = if vb.contains_tensor("bias") {
        Some(vb.get(out_dim, "bias")?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

/// Stride-2 convolution stack reducing time by `time_reduction`: a full 3x3 conv,
/// then depthwise/pointwise pairs, each followed by ReLU.
struct ConvSubsampling {
    conv: Conv2d,
    separable: Vec<(Conv2d, Conv2d)>,
    out: Linear,
}

impl ConvSubsampling {
    fn new(cfg: &ConformerConfig, vb: VarBuilder) -> Result<Self> {
        if !cfg.time_reduction.is_power_of_two() || cfg.time_reduction < 2 {
            bail!("time_reduction must be a power of two, got {}", cfg.time_reduction)
        }
        let stages = cfg.time_reduction.ilog2() as usize;
        let channels = cfg.nemo_conv_settings.conv_channels;
        let strided = |groups: usize| Conv2dConfig {
            padding: 1,
            stride: 2,
            groups,
            ..Default::default()
        };

        let vb_c = vb.pp("conv");
        let conv = conv2d(1, channels, 3, strided(1), vb_c.pp(0))?;
        // layer indices skip the activations: conv.0, conv.2/conv.3, conv.5/conv.6, ...
        let separable = (1..stages)
            .map(|stage| {
                let dw = conv2d(channels, channels, 3, strided(channels), vb_c.pp(3 * stage - 1))?;
                let pw = conv2d(channels, channels, 1, Default::default(), vb_c.pp(3 * stage))?;
                Ok((dw, pw))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut freq = cfg.input_size;
        for _ in 0..stages {
            freq = freq.div_ceil(2);
        }
        let out = linear(channels * freq, cfg.attention_dim, vb.pp("out"))?;

        Ok(Self {
            conv,
            separable,
            out,
        })
    }

    /// `[b, frames, mels]` => `[b, frames / time_reduction, attention_dim]`.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut x = self.conv.forward(&xs.unsqueeze(1)?)?.relu()?;
        for (dw, pw) in self.separable.iter() {
            x = pw.forward(&dw.forward(&x)?)?.relu()?;
        }
        let (b, c, t, f) = x.dims4()?;
        let x = x.transpose(1, 2)?.reshape((b, t, c * f))?;
        self.out.forward(&x)
    }
}

/// T5 style relative position bias without bucketing.
struct RelativeAttentionBias {
    bias_values: Embedding,
    max_distance: usize,
}

impl RelativeAttentionBias {
    fn new(num_heads: usize, max_distance: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            bias_values: embedding(2 * max_distance, num_heads, vb.pp("bias_values"))?,
            max_distance,
        })
    }

    /// `[1, heads, len, len]` additive attention bias.
    fn forward(&self, len: usize, device: &candle_core::Device) -> Result<Tensor> {
        let ids = relative_position_ids(len, self.max_distance);
        let ids = Tensor::from_vec(ids, len * len, device)?;
        self.bias_values
            .forward(&ids)?
            .reshape((len, len, ()))?
            .permute((2, 0, 1))?
            .unsqueeze(0)
    }
}

/// Embedding row for every `(query, key)` pair: the offset `key - query`
/// clamped to `[-max_distance, max_distance)` and shifted to be non-negative.
fn relative_position_ids(len: usize, max_distance: usize) -> Vec<u32> {
    let max = max_distance as i64;
    (0..len as i64)
        .flat_map(|i| (0..len as i64).map(move |j| ((j - i).clamp(-max, max - 1) + max) as u32))
        .collect()
}

/// Macaron feed forward: GLU with swish gating, then a projection back.
struct FeedForward {
    layer_norm: LayerNorm,
    linear_in: Linear,
    linear_out: Linear,
    inner_dim: usize,
}

impl FeedForward {
    fn new(cfg: &ConformerConfig, vb: VarBuilder) -> Result<Self> {
        let d = cfg.attention_dim;
        let inner = cfg.linear_units;
        Ok(Self {
            layer_norm: layer_norm(d, 1e-5, vb.pp("layer_norm"))?,
            linear_in: linear(d, 2 * inner, vb.pp("net.0.linear"))?,
            linear_out: linear(inner, d, vb.pp("net.2"))?,
            inner_dim: inner,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let x = self.linear_in.forward(&self.layer_norm.forward(xs)?)?;
        let a = x.narrow(D::Minus1, 0, self.inner_dim)?;
        let b = x.narrow(D::Minus1, self.inner_dim, self.inner_dim)?;
        self.linear_out.forward(&(a * b.silu()?)?)
    }
}

struct Attention {
    linear_q: Linear,
    linear_k: Linear,
    linear_v: Linear,
    linear_out: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(cfg: &ConformerConfig, vb: VarBuilder) -> Result<Self> {
        let d = cfg.attention_dim;
        Ok(Self {
            linear_q: linear(d, d, vb.pp("linear_q"))?,
            linear_k: linear(d, d, vb.pp("linear_k"))?,
            linear_v: linear(d, d, vb.pp("linear_v"))?,
            linear_out: linear(d, d, vb.pp("linear_out"))?,
            num_heads: cfg.attention_heads,
            head_dim: d / cfg.attention_heads,
        })
    }

    fn forward(&self, x: &Tensor, relative_bias: &Tensor) -> Result<Tensor> {
        let (b, t, d) = x.dims3()?;
        let heads = |proj: Tensor| {
            proj.reshape((b, t, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = (heads(self.linear_q.forward(x)?)? / (self.head_dim as f64).sqrt())?;
        let k = heads(self.linear_k.forward(x)?)?;
        let v = heads(self.linear_v.forward(x)?)?;

        let att = q.matmul(&k.t()?)?.broadcast_add(relative_bias)?;
        let att = candle_nn::ops::softmax_last_dim(&att)?;
        let y = att.matmul(&v)?.transpose(1, 2)?.reshape((b, t, d))?;
        self.linear_out.forward(&y)
    }
}

/// Causal depthwise conv over time on `[b, t, c]`, weight `[c, 1, k]`.
fn causal_depthwise_conv(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let (_b, t, c) = x.dims3()?;
    let k = weight.dim(2)?;
    let padded = x.pad_with_zeros(1, k - 1, 0)?;

    let mut out = x.zeros_like()?;
    for j in 0..k {
        let w = weight.narrow(2, j, 1)?.reshape((1, 1, c))?;
        out = (out + padded.narrow(1, j, t)?.broadcast_mul(&w)?)?;
    }
    match bias {
        Some(bias) => out.broadcast_add(&bias.reshape((1, 1, c))?),
        None => Ok(out),
    }
}

/// Conformer convolution module, computed channels-last.
struct ConvModule {
    layer_norm: LayerNorm,
    glu_pw: Linear,
    glu_b1: Tensor,
    glu_b2: Tensor,
    dw_weight: Tensor,
    dw_bias: Option<Tensor>,
    pw: Linear,
    ext_pw: Linear,
    channels: usize,
}

impl ConvModule {
    fn new(cfg: &ConformerConfig, vb: VarBuilder) -> Result<Self> {
        let d = cfg.attention_dim;
        let vb_dw = vb.pp("dw_sep_conv_1d.dw_conv");
        Ok(Self {
            layer_norm: layer_norm(d, 1e-5, vb.pp("layer_norm"))?,
            glu_pw: pointwise_conv(d, 2 * d, vb.pp("glu.ext_pw_conv_1d"))?,
            glu_b1: vb.get((1, d, 1), "glu.b1")?.reshape((1, 1, d))?,
            glu_b2: vb.get((1, d, 1), "glu.b2")?.reshape((1, 1, d))?,
            dw_weight: vb_dw.get((d, 1, cfg.kernel_size), "weight")?,
            dw_bias: if vb_dw.contains_tensor("bias") {
                Some(vb_dw.get(d, "bias")?)
            } else {
                None
            },
            pw: pointwise_conv(d, d, vb.pp("dw_sep_conv_1d.pw_conv"))?,
            ext_pw: pointwise_conv(d, d, vb.pp("ext_pw_conv_1d"))?,
            channels: d,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let x = self.glu_pw.forward(&self.layer_norm.forward(xs)?)?;
        let a = x.narrow(D::Minus1, 0, self.channels)?.broadcast_add(&self.glu_b1)?;
        let b = x
            .narrow(D::Minus1, self.channels, self.channels)?
            .broadcast_add(&self.glu_b2)?;
        let x = (a * b.silu()?)?;

        let x = causal_depthwise_conv(&x, &self.dw_weight, self.dw_bias.as_ref())?;
        let x = self.pw.forward(&x)?.silu()?;
        self.ext_pw.forward(&x)
    }
}

struct ConformerBlock {
    feed_forward_in: FeedForward,
    layer_norm_att: LayerNorm,
    self_attn: Attention,
    conv: ConvModule,
    feed_forward_out: FeedForward,
    layer_norm: LayerNorm,
}

impl ConformerBlock {
    fn new(cfg: &ConformerConfig, vb: VarBuilder) -> Result<Self> {
        let d = cfg.attention_dim;
        Ok(Self {
            feed_forward_in: FeedForward::new(cfg, vb.pp("feed_forward_in"))?,
            layer_norm_att: layer_norm(d, 1e-5, vb.pp("layer_norm_att"))?,
            self_attn: Attention::new(cfg, vb.pp("self_attn"))?,
            conv: ConvModule::new(cfg, vb.pp("conv"))?,
            feed_forward_out: FeedForward::new(cfg, vb.pp("feed_forward_out"))?,
            layer_norm: layer_norm(d, 1e-5, vb.pp("layer_norm"))?,
        })
    }

    fn forward(&self, xs: &Tensor, relative_bias: &Tensor) -> Result<Tensor> {
        let x = (xs + (self.feed_forward_in.forward(xs)? * 0.5)?)?;
        let x = (&x + self.self_attn.forward(&self.layer_norm_att.forward(&x)?, relative_bias)?)?;
        let x = (&x + self.conv.forward(&x)?)?;
        let x = (&x + (self.feed_forward_out.forward(&x)? * 0.5)?)?;
        self.layer_norm.forward(&x)
    }
}

/// Conformer speech encoder followed by the speech projection into the
/// language model's hidden space.
pub struct AudioEmbedding {
    global_mean: Tensor,
    global_invstd: Tensor,
    embed: ConvSubsampling,
    relative_attention_bias: RelativeAttentionBias,
    encoders: Vec<ConformerBlock>,
    projection_0: Linear,
    projection_2: Linear,
}

impl AudioEmbedding {
    /*
    model.embed_tokens_extend.audio_embed.encoder.encoder_embedding.global_mean
    model.embed_tokens_extend.audio_embed.encoder.embed.conv.0.weight
    model.embed_tokens_extend.audio_embed.encoder.embed.out.weight
    model.embed_tokens_extend.audio_embed.encoder.relative_attention_bias_layer.bias_values.weight
    model.embed_tokens_extend.audio_embed.encoder.encoders.0.feed_forward_in.net.0.linear.weight
    model.embed_tokens_extend.audio_embed.encoder.encoders.0.conv.glu.b1
    model.embed_tokens_extend.audio_embed.audio_projection.speech.0.weight
     */
    pub fn new(cfg: &ConformerConfig, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let vb_e = vb.pp("encoder");
        let vb_n = vb_e.pp("encoder_embedding");
        let vb_p = vb.pp("audio_projection.speech");
        Ok(Self {
            global_mean: vb_n.get(cfg.input_size, "global_mean")?,
            global_invstd: vb_n.get(cfg.input_size, "global_invstd")?,
            embed: ConvSubsampling::new(cfg, vb_e.pp("embed"))?,
            relative_attention_bias: RelativeAttentionBias::new(
                cfg.attention_heads,
                cfg.relative_attention_bias_args.t5_bias_max_distance,
                vb_e.pp("relative_attention_bias_layer"),
            )?,
            encoders: (0..cfg.num_blocks)
                .map(|i| ConformerBlock::new(cfg, vb_e.pp("encoders").pp(i)))
                .collect::<Result<Vec<_>>>()?,
            projection_0: linear(cfg.attention_dim, hidden_size, vb_p.pp(0))?,
            projection_2: linear(hidden_size, hidden_size, vb_p.pp(2))?,
        })
    }

    /// `[1, frames, mels]` log-mel features => `[tokens, hidden]` embeddings.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let x = features
            .broadcast_sub(&self.global_mean)?
            .broadcast_mul(&self.global_invstd)?;
        let mut x = self.embed.forward(&x)?;

        let relative_bias = self
            .relative_attention_bias
            .forward(x.dim(1)?, x.device())?
            .to_dtype(x.dtype())?;
        for block in self.encoders.iter() {
            x = block.forward(&x, &relative_bias)?;
        }

        let x = self.projection_0.forward(&x)?.gelu_erf()?;
        self.projection_2.forward(&x)?.squeeze(0)
    }
}
