//! Relative position biases over sequence distance and over the horizontal and
//! vertical distance between token boxes.
use candle::{DType, Device, Module, Result, Tensor};
use candle_nn::VarBuilder;
use rand::Rng;

use crate::config::{BiasKind, Config, RelativeBiasArgs};
use crate::with_tracing::Embedding;

/// Range of the random factor applied to layout distances while training.
pub const AUGMENTATION_RANGE: (f32, f32) = (0.80, 1.25);

/// Value the bucket table rows added by the prefix migration start from.
const PREFIX_BUCKET_INIT: f64 = 0.1;

/// Maps a relative position `memory - query` to a bucket in `[0, num_buckets)`.
///
/// When bidirectional, the upper half of the buckets holds positive
/// distances. Within a half, small distances get their own bucket and larger
/// ones are binned logarithmically up to `max_distance`, beyond which they
/// all share the last bucket. When not bidirectional only look-back
/// distances are told apart, positive ones all land in bucket 0.
pub fn relative_position_bucket(
    relative_position: i64,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
) -> u32 {
    let mut num_buckets = num_buckets as i64;
    let mut bucket = 0i64;
    let rp = if bidirectional {
        num_buckets /= 2;
        if relative_position > 0 {
            bucket += num_buckets
        }
        relative_position.abs()
    } else {
        -relative_position.min(0)
    };
    let max_exact = num_buckets / 2;
    if rp < max_exact {
        bucket += rp
    } else {
        let scaled = (rp as f32 / max_exact as f32).ln()
            / (max_distance as f32 / max_exact as f32).ln()
            * (num_buckets - max_exact) as f32;
        bucket += i64::min(max_exact + scaled as i64, num_buckets - 1)
    }
    bucket as u32
}

/// Rejects bucket settings that leave no room for the exact or the
/// logarithmic range.
pub fn validate_buckets(num_buckets: usize, bidirectional: bool, max_distance: usize) -> Result<()> {
    let half = if bidirectional {
        num_buckets / 2
    } else {
        num_buckets
    };
    if half < 2 {
        candle::bail!(
            "relative attention needs at least {} buckets, got {num_buckets}",
            if bidirectional { 4 } else { 2 }
        )
    }
    let max_exact = half / 2;
    if max_distance <= max_exact {
        candle::bail!("max distance {max_distance} must exceed the exact range {max_exact}")
    }
    Ok(())
}

/// Bucket ids of shape `(q_len, k_len)` for plain sequence distances.
pub fn sequence_bucket_ids(
    q_len: usize,
    k_len: usize,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
    device: &Device,
) -> Result<Tensor> {
    let ids: Vec<u32> = (0..q_len as i64)
        .flat_map(|i| {
            (0..k_len as i64).map(move |j| {
                relative_position_bucket(j - i, bidirectional, num_buckets, max_distance)
            })
        })
        .collect();
    Tensor::from_vec(ids, (q_len, k_len), device)
}

/// What a bias needs to know about the encoder input.
#[derive(Debug, Clone, Copy)]
pub struct BiasInput<'a> {
    pub batch_size: usize,
    pub seq_len: usize,
    /// `(batch, seq_len, 4)` boxes as (left, top, right, bottom).
    pub bbox: Option<&'a Tensor>,
}

impl<'a> BiasInput<'a> {
    pub fn new(batch_size: usize, seq_len: usize, bbox: Option<&'a Tensor>) -> Self {
        Self {
            batch_size,
            seq_len,
            bbox,
        }
    }

    fn boxes(&self, kind: BiasKind) -> Result<Vec<Vec<Vec<f32>>>> {
        let bbox = match self.bbox {
            Some(bbox) => bbox,
            None => candle::bail!("bbox is required for the {kind:?} relative position bias"),
        };
        let (b_sz, seq_len, _) = bbox.dims3()?;
        if b_sz != self.batch_size || seq_len != self.seq_len {
            candle::bail!(
                "bbox shape {:?} does not match the input ({}, {})",
                bbox.shape(),
                self.batch_size,
                self.seq_len
            )
        }
        bbox.to_dtype(DType::F32)?.to_vec3::<f32>()
    }

    /// Number of leading tokens whose box top is negative, for each example.
    /// Prefix tokens are flagged upstream with a negative top coordinate.
    pub fn prefix_lengths(&self) -> Result<Vec<usize>> {
        let boxes = self.boxes(BiasKind::Sequence)?;
        Ok(boxes
            .iter()
            .map(|example| example.iter().filter(|b| b[1] < 0.).count())
            .collect())
    }
}

/// One learned bucket table together with the distance it measures.
#[derive(Debug, Clone)]
pub struct RelativePositionBias {
    args: RelativeBiasArgs,
    relative_attention_bias: Embedding,
    span: tracing::Span,
}

impl RelativePositionBias {
    /// Loads the table, migrating a pre-prefix checkpoint to the two extra
    /// prefix rows when `expand` is set.
    pub fn load(args: &RelativeBiasArgs, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let num_buckets = args.relative_attention_num_buckets;
        let relative_attention_bias = if args.prefix_bucket && args.expand {
            let old = vb.get((num_buckets, num_heads), "weight")?;
            let new_rows = Tensor::full(PREFIX_BUCKET_INIT, (2, num_heads), vb.device())?
                .to_dtype(old.dtype())?;
            Embedding::from_weights(Tensor::cat(&[&old, &new_rows], 0)?)?
        } else {
            let extra = if args.prefix_bucket { 2 } else { 0 };
            Embedding::new(num_buckets + extra, num_heads, vb)?
        };
        let span = tracing::span!(tracing::Level::TRACE, "relative-bias", kind = ?args.kind);
        Ok(Self {
            args: args.clone(),
            relative_attention_bias,
            span,
        })
    }

    pub fn kind(&self) -> BiasKind {
        self.args.kind
    }

    pub fn table(&self) -> &Tensor {
        self.relative_attention_bias.embeddings()
    }

    fn scaled_distance(&self, from: f32, to: f32, factor: f32) -> i64 {
        ((to - from) * factor) as i64
    }

    /// Bucket ids of shape `(1 or batch, seq_len, seq_len)`.
    pub fn bucket_ids(&self, input: &BiasInput, train: bool) -> Result<Tensor> {
        let device = self.table().device();
        let args = &self.args;
        let mut factor = args.scaling_factor() as f32;
        if args.augmentation && train {
            factor *= rand::rng().random_range(AUGMENTATION_RANGE.0..AUGMENTATION_RANGE.1);
        }
        let bucket = |rel: i64| {
            relative_position_bucket(
                rel,
                args.bidirectional,
                args.relative_attention_num_buckets,
                args.max_distance(),
            )
        };
        let l = input.seq_len;
        let mut ids = if args.kind.is_layout() {
            let (lo, hi) = match args.kind {
                BiasKind::Horizontal => (0, 2),
                _ => (1, 3),
            };
            input
                .boxes(args.kind)?
                .iter()
                .map(|example| {
                    let pos: Vec<f32> = example.iter().map(|b| (b[lo] + b[hi]) / 2.).collect();
                    pos.iter()
                        .flat_map(|&p_i| {
                            pos.iter()
                                .map(move |&p_j| self.scaled_distance(p_i, p_j, factor))
                        })
                        .map(bucket)
                        .collect::<Vec<u32>>()
                })
                .collect::<Vec<Vec<u32>>>()
        } else {
            let row: Vec<u32> = (0..l)
                .flat_map(|i| (0..l).map(move |j| self.scaled_distance(i as f32, j as f32, factor)))
                .map(bucket)
                .collect();
            vec![row]
        };
        if args.prefix_bucket {
            if ids.len() == 1 && input.batch_size > 1 {
                ids = vec![ids[0].clone(); input.batch_size]
            }
            let num_buckets = args.relative_attention_num_buckets as u32;
            for (example, n) in ids.iter_mut().zip(input.prefix_lengths()?) {
                for i in 0..l {
                    for j in 0..l {
                        if i < n && j >= n {
                            example[i * l + j] = num_buckets
                        } else if i >= n && j < n {
                            example[i * l + j] = num_buckets + 1
                        }
                    }
                }
            }
        }
        let b = ids.len();
        Tensor::from_vec(ids.concat(), (b, l, l), device)
    }

    /// Bias of shape `(1 or batch, heads, seq_len, seq_len)`.
    pub fn forward_t(&self, input: &BiasInput, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let ids = self.bucket_ids(input, train)?;
        self.relative_attention_bias
            .forward(&ids)?
            .permute((0, 3, 1, 2))?
            .contiguous()
    }
}

/// Sum of all configured relative biases.
#[derive(Debug, Clone)]
pub struct AggregatedBias {
    biases: Vec<RelativePositionBias>,
    num_heads: usize,
    dtype: DType,
    device: Device,
    span: tracing::Span,
}

impl AggregatedBias {
    /// `vb` points at the encoder stack. A sequence table that is not stored
    /// under its own name is read from the first self-attention layer.
    pub fn load(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let tied = "block.0.layer.0.SelfAttention.relative_attention_bias";
        let biases = cfg
            .relative_bias_args
            .iter()
            .enumerate()
            .map(|(i, args)| {
                let name = format!("relative_bias.biases.{i}.relative_attention_bias");
                let vb_bias = if args.kind == BiasKind::Sequence
                    && !vb.contains_tensor(&format!("{name}.weight"))
                    && vb.contains_tensor(&format!("{tied}.weight"))
                {
                    vb.pp(tied)
                } else {
                    vb.pp(name)
                };
                RelativePositionBias::load(args, cfg.num_heads, vb_bias)
            })
            .collect::<Result<Vec<_>>>()?;
        let span = tracing::span!(tracing::Level::TRACE, "aggregated-bias");
        Ok(Self {
            biases,
            num_heads: cfg.num_heads,
            dtype: vb.dtype(),
            device: vb.device().clone(),
            span,
        })
    }

    pub fn biases(&self) -> &[RelativePositionBias] {
        &self.biases
    }

    /// Elementwise sum of every bias, zeros of shape `(1, heads, L, L)` when
    /// no bias is configured.
    pub fn forward_t(&self, input: &BiasInput, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let l = input.seq_len;
        let mut output =
            Tensor::zeros((1, self.num_heads, l, l), self.dtype, &self.device)?;
        for bias in self.biases.iter() {
            output = bias.forward_t(input, train)?.broadcast_add(&output)?;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_scenario() {
        let bucket = |d| relative_position_bucket(d, true, 32, 128);
        assert_eq!(bucket(0), 0);
        assert_eq!(bucket(-200), bucket(-500));
        assert_eq!(bucket(-200), 15);
        assert_eq!(bucket(200), bucket(500));
        assert_eq!(bucket(200), 31);
        assert_eq!(bucket(-3), 3);
        assert_eq!(bucket(3), 19);
    }

    #[test]
    fn bucket_saturation() {
        for &(bidirectional, max_distance) in &[(true, 128usize), (false, 128), (true, 100)] {
            let md = max_distance as i64;
            let at_max = relative_position_bucket(-md, bidirectional, 32, max_distance);
            let at_max_pos = relative_position_bucket(md, bidirectional, 32, max_distance);
            for d in md..4 * md {
                assert_eq!(
                    relative_position_bucket(-d, bidirectional, 32, max_distance),
                    at_max
                );
                assert_eq!(
                    relative_position_bucket(d, bidirectional, 32, max_distance),
                    at_max_pos
                );
            }
        }
    }

    #[test]
    fn bucket_monotonic() {
        let mut prev_neg = 0;
        let mut prev_pos = 0;
        for d in 0..300i64 {
            let neg = relative_position_bucket(-d, true, 32, 128);
            let pos = relative_position_bucket(d, true, 32, 128);
            assert!(neg >= prev_neg && neg < 16);
            if d > 0 {
                assert!(pos >= prev_pos && (16..32).contains(&pos));
            }
            prev_neg = neg;
            prev_pos = pos;
        }
        // look-back only
        assert_eq!(relative_position_bucket(5, false, 32, 128), 0);
        assert_eq!(relative_position_bucket(-5, false, 32, 128), 5);
        assert_eq!(relative_position_bucket(-1000, false, 32, 128), 31);
    }

    #[test]
    fn bucket_validation() {
        assert!(validate_buckets(32, true, 128).is_ok());
        assert!(validate_buckets(2, true, 128).is_err());
        assert!(validate_buckets(32, true, 8).is_err());
        assert!(validate_buckets(2, false, 128).is_ok());
    }

    #[test]
    fn sequence_ids() -> Result<()> {
        let ids = sequence_bucket_ids(2, 3, true, 32, 128, &Device::Cpu)?;
        assert_eq!(ids.to_vec2::<u32>()?, [[0, 17, 18], [1, 0, 17]]);
        Ok(())
    }
}
