//! Additive attention masks.
use candle::{DType, Device, Result, Tensor};

/// Most negative finite value of a floating point dtype.
pub fn dtype_min(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => half::f16::MIN.to_f64(),
        DType::BF16 => half::bf16::MIN.to_f64(),
        DType::F32 => f32::MIN as f64,
        _ => f64::MIN,
    }
}

/// Lower triangular causal pattern of shape `(q_len, k_len)`. Query `i`
/// sits at absolute position `i + k_len - q_len` and sees every key up to it.
pub fn causal_pattern(q_len: usize, k_len: usize, device: &Device) -> Result<Tensor> {
    if q_len > k_len {
        candle::bail!("causal mask needs at least as many keys ({k_len}) as queries ({q_len})")
    }
    let offset = k_len - q_len;
    let mask: Vec<_> = (0..q_len)
        .flat_map(|i| (0..k_len).map(move |j| u8::from(j <= i + offset)))
        .collect();
    Tensor::from_slice(&mask, (q_len, k_len), device)
}

/// Turns a `(batch, k_len)` 0/1 mask into an additive bias: 0 where attention
/// is allowed, the dtype minimum elsewhere. The result is `(batch, 1, 1, k_len)`
/// or, when `causal_q_len` is set, `(batch, 1, q_len, k_len)`.
pub fn extended_attention_mask(
    attention_mask: &Tensor,
    causal_q_len: Option<usize>,
    dtype: DType,
) -> Result<Tensor> {
    let (b_sz, k_len) = attention_mask.dims2()?;
    let mask = attention_mask.to_dtype(DType::F32)?;
    let mask = match causal_q_len {
        None => mask.reshape((b_sz, 1, 1, k_len))?,
        Some(q_len) => {
            let causal = causal_pattern(q_len, k_len, attention_mask.device())?
                .to_dtype(DType::F32)?
                .reshape((1, 1, q_len, k_len))?;
            causal.broadcast_mul(&mask.reshape((b_sz, 1, 1, k_len))?)?
        }
    };
    let mask = ((mask.ones_like()? - mask)? * dtype_min(dtype))?;
    mask.to_dtype(dtype)
}

/// Additive bias over encoder positions for cross-attention, `(batch, 1, 1, k_len)`.
pub fn invert_attention_mask(encoder_attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    extended_attention_mask(encoder_attention_mask, None, dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_with_past() -> Result<()> {
        let dev = Device::Cpu;
        let m = causal_pattern(2, 4, &dev)?.to_vec2::<u8>()?;
        assert_eq!(m, [[1, 1, 1, 0], [1, 1, 1, 1]]);
        assert!(causal_pattern(3, 2, &dev).is_err());
        Ok(())
    }

    #[test]
    fn extended_padding() -> Result<()> {
        let dev = Device::Cpu;
        let mask = Tensor::new(&[[1u32, 1, 0]], &dev)?;
        let ext = extended_attention_mask(&mask, None, DType::F32)?;
        assert_eq!(ext.dims(), &[1, 1, 1, 3]);
        let v = ext.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(v, [0., 0., f32::MIN]);

        let ext = extended_attention_mask(&mask, Some(3), DType::F32)?;
        assert_eq!(ext.dims(), &[1, 1, 3, 3]);
        let v = ext.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(v[1], f32::MIN);
        assert_eq!(v[3], 0.);
        assert_eq!(v[8], f32::MIN);
        Ok(())
    }
}
