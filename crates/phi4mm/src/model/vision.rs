use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{conv2d, layer_norm, linear, Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder};

use super::config::VisionConfig;
use crate::processor::HdLayout;

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            q_proj: linear(h, h, vb.pp("q_proj"))?,
            k_proj: linear(h, h, vb.pp("k_proj"))?,
            v_proj: linear(h, h, vb.pp("v_proj"))?,
            out_proj: linear(h, h, vb.pp("out_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim: h / cfg.num_attention_heads,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batches, patches, hidden_size) = x.dims3()?;
        let heads = |t: Tensor| {
            t.reshape((batches, patches, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = heads(self.q_proj.forward(x)?)?;
        let k = heads(self.k_proj.forward(x)?)?;
        let v = heads(self.v_proj.forward(x)?)?;

        let y = {
            let in_dtype = q.dtype();
            let q = q.to_dtype(DType::F32)?;
            let k = k.to_dtype(DType::F32)?;
            let v = v.to_dtype(DType::F32)?;

            let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
            let att = candle_nn::ops::softmax_last_dim(&att)?;
            att.matmul(&v)?.to_dtype(in_dtype)?
        };
        let y = y.transpose(1, 2)?.reshape((batches, patches, hidden_size))?;
        self.out_proj.forward(&y)
    }
}

struct Block {
    layer_norm1: LayerNorm,
    self_attn: Attention,
    layer_norm2: LayerNorm,
    fc1: Linear,
    fc2: Linear,
}

impl Block {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let eps = cfg.layer_norm_eps;
        Ok(Self {
            layer_norm1: layer_norm(cfg.hidden_size, eps, vb.pp("layer_norm1"))?,
            self_attn: Attention::new(cfg, vb.pp("self_attn"))?,
            layer_norm2: layer_norm(cfg.hidden_size, eps, vb.pp("layer_norm2"))?,
            fc1: linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("mlp.fc1"))?,
            fc2: linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("mlp.fc2"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let x = self.layer_norm1.forward(xs)?;
        let x = self.self_attn.forward(&x)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.layer_norm2.forward(&x)?;
        // gelu with the tanh approximation
        let x = self.fc2.forward(&self.fc1.forward(&x)?.gelu()?)?;
        residual + x
    }
}

/// SigLIP patch encoder truncated to `num_layers_used` blocks, without the final layer norm.
struct SiglipEncoder {
    patch_embedding: Conv2d,
    position_embedding: Tensor,
    blocks: Vec<Block>,
}

impl SiglipEncoder {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let num_patches = cfg.patches_per_side() * cfg.patches_per_side();
        let vb_e = vb.pp("embeddings");
        Ok(Self {
            patch_embedding: conv2d(3, cfg.hidden_size, cfg.patch_size, conv_cfg, vb_e.pp("patch_embedding"))?,
            position_embedding: vb_e.get(
                (num_patches, cfg.hidden_size),
                "position_embedding.weight",
            )?,
            blocks: (0..cfg.num_layers_used)
                .map(|i| Block::new(cfg, vb.pp("encoder.layers").pp(i)))
                .collect::<Result<Vec<_>>>()?,
        })
    }

    /// `[b, 3, H, W]` pixels => `[b, patches, hidden]` features.
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let x = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let mut x = x.broadcast_add(&self.position_embedding.unsqueeze(0)?)?;
        for block in self.blocks.iter() {
            x = block.forward(&x)?;
        }
        Ok(x)
    }
}

/// Image embedding: SigLIP features of every crop, pooled 2x2, laid out in
/// the HD order and projected into the language model's hidden space.
pub struct VisionEmbedding {
    img_processor: SiglipEncoder,
    sub_gn: Tensor,
    glb_gn: Tensor,
    img_projection_0: Linear,
    img_projection_2: Linear,
    config: VisionConfig,
}

impl VisionEmbedding {
    /*
    model.embed_tokens_extend.image_embed.glb_GN
    model.embed_tokens_extend.image_embed.sub_GN
    model.embed_tokens_extend.image_embed.img_processor.embeddings.patch_embedding.weight
    model.embed_tokens_extend.image_embed.img_processor.embeddings.position_embedding.weight
    model.embed_tokens_extend.image_embed.img_processor.encoder.layers.0.layer_norm1.weight
    model.embed_tokens_extend.image_embed.img_processor.encoder.layers.0.self_attn.q_proj.weight
    model.embed_tokens_extend.image_embed.img_projection.0.weight
    model.embed_tokens_extend.image_embed.img_projection.2.weight
     */
    pub fn new(cfg: VisionConfig, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let c = cfg.hidden_size;
        Ok(Self {
            img_processor: SiglipEncoder::new(&cfg, vb.pp("img_processor"))?,
            sub_gn: vb.get((1, 1, 1, c), "sub_GN")?.reshape((1, 1, c))?,
            glb_gn: vb.get((1, 1, c), "glb_GN")?.reshape((1, c))?,
            img_projection_0: linear(c, hidden_size, vb.pp("img_projection.0"))?,
            img_projection_2: linear(hidden_size, hidden_size, vb.pp("img_projection.2"))?,
            config: cfg,
        })
    }

    /// `[1 + crops, 3, H, W]` pixels => `[num_image_tokens, hidden]` embeddings.
    pub fn forward(&self, pixel_values: &Tensor, layout: &HdLayout) -> Result<Tensor> {
        let num_crops = pixel_values.dim(0)?;
        let side = self.config.patches_per_side();
        let c = self.config.hidden_size;

        // one crop at a time keeps the attention matrices small
        let features = (0..num_crops)
            .map(|i| self.img_processor.forward(&pixel_values.narrow(0, i, 1)?))
            .collect::<Result<Vec<_>>>()?;
        let features = Tensor::cat(&features, 0)?
            .reshape((num_crops, side, side, c))?
            .permute((0, 3, 1, 2))?
            .contiguous()?
            .avg_pool2d(2)?
            .permute((0, 2, 3, 1))?;

        let tokens = hd_transform(&features, layout, &self.sub_gn, &self.glb_gn)?;
        let x = self.img_projection_0.forward(&tokens)?.gelu_erf()?;
        self.img_projection_2.forward(&x)
    }
}

/// Lay out pooled crop features `[1 + rows * cols, side, side, C]` as a token sequence:
/// the stitched sub-image grid cut to its useful extent, `glb_gn`, then the global view.
/// Every row of both grids ends with `sub_gn`.
pub(crate) fn hd_transform(
    features: &Tensor,
    layout: &HdLayout,
    sub_gn: &Tensor,
    glb_gn: &Tensor,
) -> Result<Tensor> {
    let (_n, side, _side, c) = features.dims4()?;
    let (rows, cols) = (layout.rows, layout.cols);

    let global = features.get(0)?;
    let sub = features
        .narrow(0, 1, rows * cols)?
        .reshape((rows, cols, side, side, c))?
        .permute((0, 2, 1, 3, 4))?
        .reshape((rows * side, cols * side, c))?
        .narrow(0, 0, layout.useful_height)?
        .narrow(1, 0, layout.useful_width)?;

    let with_row_separators = |grid: &Tensor| -> Result<Tensor> {
        let (h, w, c) = grid.dims3()?;
        let separators = sub_gn.broadcast_as((h, 1, c))?.contiguous()?;
        Tensor::cat(&[grid, &separators], 1)?.reshape((h * (w + 1), c))
    };

    Tensor::cat(
        &[
            &with_row_separators(&sub)?,
            glb_gn,
            &with_row_separators(&global)?,
        ],
        0,
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::Device;

    use super::*;
    use crate::model::text::tests::insert_randn;

    fn layout(cols: usize, rows: usize, useful_width: usize, useful_height: usize) -> HdLayout {
        HdLayout {
            cols,
            rows,
            resized_width: 0,
            resized_height: 0,
            useful_width,
            useful_height,
        }
    }

    #[test]
    fn test_hd_transform_order() -> Result<()> {
        let device = Device::Cpu;
        // global crop filled with 0, sub crops with 1 and 2, side 2, one channel
        let features = Tensor::new(&[0f32, 0., 0., 0., 1., 1., 1., 1., 2., 2., 2., 2.], &device)?
            .reshape((3, 2, 2, 1))?;
        let sub_gn = Tensor::new(&[-1f32], &device)?.reshape((1, 1, 1))?;
        let glb_gn = Tensor::new(&[-2f32], &device)?.reshape((1, 1))?;

        // two crops side by side, the right one half padding
        let tokens = hd_transform(&features, &layout(2, 1, 3, 2), &sub_gn, &glb_gn)?;
        let tokens = tokens.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(
            tokens,
            vec![
                1., 1., 2., -1., //
                1., 1., 2., -1., //
                -2., //
                0., 0., -1., //
                0., 0., -1.,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_hd_transform_stacks_rows() -> Result<()> {
        let device = Device::Cpu;
        let features = Tensor::new(&[0f32, 0., 0., 0., 1., 1., 1., 1., 2., 2., 2., 2.], &device)?
            .reshape((3, 2, 2, 1))?;
        let sub_gn = Tensor::new(&[-1f32], &device)?.reshape((1, 1, 1))?;
        let glb_gn = Tensor::new(&[-2f32], &device)?.reshape((1, 1))?;

        let tokens = hd_transform(&features, &layout(1, 2, 2, 4), &sub_gn, &glb_gn)?;
        assert_eq!(tokens.dims(), &[4 * 3 + 1 + 2 * 3, 1]);
        let tokens = tokens.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(&tokens[..12], &[1., 1., -1., 1., 1., -1., 2., 2., -1., 2., 2., -1.]);
        Ok(())
    }

    #[test]
    fn test_vision_embedding_shapes() -> Result<()> {
        let device = Device::Cpu;
        let cfg = VisionConfig {
            hidden_size: 4,
            intermediate_size: 6,
            num_attention_heads: 2,
            num_layers_used: 1,
            image_size: 8,
            patch_size: 2,
            layer_norm_eps: 1e-6,
        };
        let (c, hidden) = (4, 6);

        let mut tensors = HashMap::new();
        insert_randn(&mut tensors, "sub_GN", (1, 1, 1, c), &device)?;
        insert_randn(&mut tensors, "glb_GN", (1, 1, c), &device)?;
        insert_randn(&mut tensors, "img_processor.embeddings.patch_embedding.weight", (c, 3, 2, 2), &device)?;
        insert_randn(&mut tensors, "img_processor.embeddings.patch_embedding.bias", c, &device)?;
        insert_randn(&mut tensors, "img_processor.embeddings.position_embedding.weight", (16, c), &device)?;
        let p = "img_processor.encoder.layers.0";
        for name in ["self_attn.q_proj", "self_attn.k_proj", "self_attn.v_proj", "self_attn.out_proj"] {
            insert_randn(&mut tensors, format!("{p}.{name}.weight"), (c, c), &device)?;
            insert_randn(&mut tensors, format!("{p}.{name}.bias"), c, &device)?;
        }
        for name in ["layer_norm1", "layer_norm2"] {
            tensors.insert(format!("{p}.{name}.weight"), Tensor::ones(c, DType::F32, &device)?);
            tensors.insert(format!("{p}.{name}.bias"), Tensor::zeros(c, DType::F32, &device)?);
        }
        insert_randn(&mut tensors, format!("{p}.mlp.fc1.weight"), (6, c), &device)?;
        insert_randn(&mut tensors, format!("{p}.mlp.fc1.bias"), 6, &device)?;
        insert_randn(&mut tensors, format!("{p}.mlp.fc2.weight"), (c, 6), &device)?;
        insert_randn(&mut tensors, format!("{p}.mlp.fc2.bias"), c, &device)?;
        insert_randn(&mut tensors, "img_projection.0.weight", (hidden, c), &device)?;
        insert_randn(&mut tensors, "img_projection.0.bias", hidden, &device)?;
        insert_randn(&mut tensors, "img_projection.2.weight", (hidden, hidden), &device)?;
        insert_randn(&mut tensors, "img_projection.2.bias", hidden, &device)?;

        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let embedding = VisionEmbedding::new(cfg, hidden, vb)?;

        // global view plus a 2x1 grid; 4x4 patches pool to 2x2 tokens per crop
        let pixels = Tensor::randn(0f32, 1f32, (3, 3, 8, 8), &device)?;
        let out = embedding.forward(&pixels, &layout(2, 1, 3, 2))?;
        assert_eq!(out.dims(), &[2 * 4 + 1 + 2 * 3, hidden]);
        Ok(())
    }
}
