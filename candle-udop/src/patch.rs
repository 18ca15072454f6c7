use candle::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::Config;
use crate::with_tracing::{conv2d, Conv2d};

/// Splits the page image into a grid of `patch_size` squares and projects
/// each one to `d_model`, yielding `(batch, num_patches, d_model)` in
/// row-major grid order.
#[derive(Debug, Clone)]
pub struct PatchEmbeddings {
    proj: Conv2d,
    image_size: usize,
    num_channels: usize,
    num_patches: usize,
}

impl PatchEmbeddings {
    pub fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let conv_cfg = candle_nn::Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let proj = conv2d(
            cfg.num_channels,
            cfg.d_model,
            cfg.patch_size,
            conv_cfg,
            vb.pp("proj"),
        )?;
        Ok(Self {
            proj,
            image_size: cfg.image_size,
            num_channels: cfg.num_channels,
            num_patches: cfg.num_patches(),
        })
    }

    pub fn num_patches(&self) -> usize {
        self.num_patches
    }
}

impl Module for PatchEmbeddings {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let (_b, c, h, w) = pixel_values.dims4()?;
        if c != self.num_channels {
            candle::bail!(
                "pixel values have {c} channels, the model expects {}",
                self.num_channels
            )
        }
        if h != self.image_size || w != self.image_size {
            candle::bail!(
                "input image size ({h}*{w}) doesn't match model ({}*{})",
                self.image_size,
                self.image_size
            )
        }
        let xs = self.proj.forward(pixel_values)?;
        let (b, c, h, w) = xs.dims4()?;
        // flatten embeddings.
        xs.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn patch_grid() -> Result<()> {
        let cfg = Config::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let patches = PatchEmbeddings::load(vb, &cfg)?;
        let pixels = Tensor::randn(0f32, 1., (2, 3, 32, 32), &Device::Cpu)?;
        let xs = patches.forward(&pixels)?;
        assert_eq!(xs.dims(), &[2, 16, cfg.d_model]);
        let wrong = Tensor::zeros((1, 3, 16, 16), DType::F32, &Device::Cpu)?;
        assert!(patches.forward(&wrong).is_err());
        Ok(())
    }
}
