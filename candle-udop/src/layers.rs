use candle::{DType, Module, Result, Tensor, D};
use candle_nn::{Activation, Dropout, Init, VarBuilder};

use crate::config::Config;
use crate::with_tracing::{linear_no_bias, Linear};

/// Scale-only RMS normalisation, no mean subtraction and no bias.
#[derive(Debug, Clone)]
pub struct UdopLayerNorm {
    weight: Tensor,
    variance_epsilon: f64,
    span: tracing::Span,
}

impl UdopLayerNorm {
    pub fn load(h: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(h, "weight", Init::Const(1.0))?;
        let span = tracing::span!(tracing::Level::TRACE, "layer-norm");
        Ok(Self {
            weight,
            variance_epsilon: eps,
            span,
        })
    }
}

impl Module for UdopLayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let dtype = xs.dtype();
        let xs_f32 = xs.to_dtype(DType::F32)?;
        // variance = hidden_states.to(torch.float32).pow(2).mean(-1, keepdim=True)
        let variance = xs_f32.sqr()?.mean_keepdim(D::Minus1)?;
        let xs = xs_f32.broadcast_div(&(variance + self.variance_epsilon)?.sqrt()?)?;
        let xs = xs.to_dtype(dtype)?;
        xs.broadcast_mul(&self.weight.to_dtype(dtype)?)
    }
}

#[derive(Debug, Clone)]
enum FeedForward {
    Dense {
        wi: Linear,
        wo: Linear,
    },
    Gated {
        wi_0: Linear,
        wi_1: Linear,
        wo: Linear,
    },
}

impl FeedForward {
    fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let wo = linear_no_bias(cfg.d_ff, cfg.d_model, vb.pp("wo"))?;
        if cfg.is_gated_act() {
            let wi_0 = linear_no_bias(cfg.d_model, cfg.d_ff, vb.pp("wi_0"))?;
            let wi_1 = linear_no_bias(cfg.d_model, cfg.d_ff, vb.pp("wi_1"))?;
            Ok(Self::Gated { wi_0, wi_1, wo })
        } else {
            let wi = linear_no_bias(cfg.d_model, cfg.d_ff, vb.pp("wi"))?;
            Ok(Self::Dense { wi, wo })
        }
    }
}

/// Pre-norm feed-forward sub-layer with its residual connection.
#[derive(Debug, Clone)]
pub struct UdopLayerFF {
    ff: FeedForward,
    act: Activation,
    layer_norm: UdopLayerNorm,
    dropout: Dropout,
    span: tracing::Span,
}

impl UdopLayerFF {
    pub fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let layer_norm =
            UdopLayerNorm::load(cfg.d_model, cfg.layer_norm_epsilon, vb.pp("layer_norm"))?;
        let ff = FeedForward::load(vb.pp("DenseReluDense"), cfg)?;
        let span = tracing::span!(tracing::Level::TRACE, "ff");
        Ok(Self {
            ff,
            act: cfg.dense_act_fn()?,
            layer_norm,
            dropout: Dropout::new(cfg.dropout_rate as f32),
            span,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let ys = self.layer_norm.forward(xs)?;
        let ys = match &self.ff {
            FeedForward::Dense { wi, wo } => {
                let ys = self.act.forward(&wi.forward(&ys)?)?;
                let ys = self.dropout.forward(&ys, train)?;
                wo.forward(&ys)?
            }
            FeedForward::Gated { wi_0, wi_1, wo } => {
                let hidden_act = self.act.forward(&wi_0.forward(&ys)?)?;
                let hidden_linear = wi_1.forward(&ys)?;
                let ys = hidden_act.broadcast_mul(&hidden_linear)?;
                let ys = self.dropout.forward(&ys, train)?;
                wo.forward(&ys)?
            }
        };
        xs + self.dropout.forward(&ys, train)?
    }
}

/// Largest finite value of a floating point dtype.
pub(crate) fn dtype_max(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => half::f16::MAX.to_f64(),
        DType::BF16 => half::bf16::MAX.to_f64(),
        DType::F32 => f32::MAX as f64,
        _ => f64::MAX,
    }
}

/// Keeps reduced precision hidden states finite. The bound backs off from the
/// format maximum when an infinity was already produced.
pub fn clamp_inf_values(xs: &Tensor) -> Result<Tensor> {
    let dtype = xs.dtype();
    if !matches!(dtype, DType::F16 | DType::BF16) {
        return Ok(xs.clone());
    }
    let max_abs = xs
        .abs()?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    let clamp_value = if max_abs.is_infinite() {
        dtype_max(dtype) - 1000.
    } else {
        dtype_max(dtype)
    };
    xs.clamp(-clamp_value, clamp_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{test_utils::to_vec3_round, Device};
    use candle_nn::VarMap;

    #[test]
    fn rms_norm_unit_weight() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let norm = UdopLayerNorm::load(2, 0.0, vb)?;
        let xs = Tensor::new(&[[[3f32, 4.], [1., 1.]]], &dev)?;
        let ys = norm.forward(&xs)?;
        // rms of [3, 4] is sqrt(12.5)
        assert_eq!(to_vec3_round(&ys, 4)?, [[[0.8485, 1.1314], [1.0, 1.0]]]);
        Ok(())
    }

    #[test]
    fn clamp_inf_f16() -> Result<()> {
        let dev = Device::Cpu;
        let xs = Tensor::new(&[f32::INFINITY, -1., f32::NEG_INFINITY], &dev)?.to_dtype(DType::F16)?;
        let ys = clamp_inf_values(&xs)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        assert!(ys.iter().all(|v| v.is_finite()));
        assert_eq!(ys[1], -1.);
        assert!(ys[0] <= 65504. - 1000. + 32.);
        assert_eq!(ys[0], -ys[2]);

        let xs = Tensor::new(&[f32::INFINITY], &dev)?;
        let ys = clamp_inf_values(&xs)?.to_vec1::<f32>()?;
        assert!(ys[0].is_infinite());
        Ok(())
    }
}
