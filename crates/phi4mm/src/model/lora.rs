use candle_core::{Module, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use super::config::LoraConfig;

/// The low-rank adapters shipped with the checkpoint, one per input modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    Vision,
    Speech,
}

impl Adapter {
    pub fn name(&self) -> &'static str {
        match self {
            Adapter::Vision => "vision",
            Adapter::Speech => "speech",
        }
    }
}

#[derive(Debug, Clone)]
struct LoraWeights {
    a: Linear,
    b: Linear,
    scale: f64,
}

/// Linear layer with optional LoRA adapters: `y = W x + scale * B (A x)`.
///
/// Weights are read from `base_layer.weight`, `lora_A.{adapter}.weight` and
/// `lora_B.{adapter}.weight`.
#[derive(Debug, Clone)]
pub struct LoraLinear {
    base: Linear,
    vision: Option<LoraWeights>,
    speech: Option<LoraWeights>,
}

impl LoraLinear {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        vision: Option<LoraConfig>,
        speech: Option<LoraConfig>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let base = linear_no_bias(in_dim, out_dim, vb.pp("base_layer"))?;

        let load = |config: Option<LoraConfig>, adapter: Adapter| -> Result<Option<LoraWeights>> {
            let Some(config) = config else {
                return Ok(None);
            };
            let name = adapter.name();
            if !vb.contains_tensor(&format!("lora_A.{name}.weight")) {
                return Ok(None);
            }
            Ok(Some(LoraWeights {
                a: linear_no_bias(in_dim, config.r, vb.pp("lora_A").pp(name))?,
                b: linear_no_bias(config.r, out_dim, vb.pp("lora_B").pp(name))?,
                scale: config.scale(),
            }))
        };

        Ok(Self {
            vision: load(vision, Adapter::Vision)?,
            speech: load(speech, Adapter::Speech)?,
            base,
        })
    }

    #[cfg(test)]
    fn has_adapter(&self, adapter: Adapter) -> bool {
        self.weights(adapter).is_some()
    }

    fn weights(&self, adapter: Adapter) -> Option<&LoraWeights> {
        match adapter {
            Adapter::Vision => self.vision.as_ref(),
            Adapter::Speech => self.speech.as_ref(),
        }
    }

    pub fn forward(&self, x: &Tensor, adapter: Option<Adapter>) -> Result<Tensor> {
        let y = self.base.forward(x)?;
        match adapter.and_then(|adapter| self.weights(adapter)) {
            Some(lora) => {
                let delta = lora.b.forward(&lora.a.forward(x)?)?;
                y + (delta * lora.scale)?
            }
            None => Ok(y),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device};

    use super::*;

    #[test]
    fn test_lora_delta_is_scaled_and_selected() -> Result<()> {
        let device = Device::Cpu;
        let tensors = HashMap::from([
            (
                "base_layer.weight".to_string(),
                Tensor::new(&[[1f32, 0.], [0., 1.]], &device)?,
            ),
            (
                "lora_A.vision.weight".to_string(),
                Tensor::new(&[[1f32, 0.]], &device)?,
            ),
            (
                "lora_B.vision.weight".to_string(),
                Tensor::new(&[[0f32], [1.]], &device)?,
            ),
        ]);
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let lora = LoraConfig {
            r: 1,
            lora_alpha: 2.0,
        };
        let layer = LoraLinear::new(2, 2, Some(lora), Some(lora), vb)?;

        assert!(layer.has_adapter(Adapter::Vision));
        assert!(!layer.has_adapter(Adapter::Speech));

        let x = Tensor::new(&[[1f32, 2.]], &device)?;
        assert_eq!(layer.forward(&x, None)?.to_vec2::<f32>()?, vec![vec![1., 2.]]);
        assert_eq!(
            layer.forward(&x, Some(Adapter::Vision))?.to_vec2::<f32>()?,
            vec![vec![1., 4.]]
        );
        // a missing adapter falls back to the base layer
        assert_eq!(
            layer.forward(&x, Some(Adapter::Speech))?.to_vec2::<f32>()?,
            vec![vec![1., 2.]]
        );
        Ok(())
    }
}
