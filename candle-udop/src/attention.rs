use std::collections::BTreeSet;

use candle::{DType, Device, Module, Result, Tensor};
use candle_nn::{Dropout, VarBuilder};

use crate::bias::sequence_bucket_ids;
use crate::cache::KvBuffer;
use crate::config::Config;
use crate::with_tracing::{linear_no_bias, Embedding, Linear};

/// Heads removed from an attention unit, in the original head numbering.
/// `version` is bumped every time the set changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunedHeads {
    heads: BTreeSet<usize>,
    version: usize,
}

impl PrunedHeads {
    pub fn heads(&self) -> &BTreeSet<usize> {
        &self.heads
    }

    pub fn version(&self) -> usize {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    pub fn contains(&self, head: usize) -> bool {
        self.heads.contains(&head)
    }
}

#[derive(Debug, Clone)]
pub struct AttentionOutput {
    pub hidden_states: Tensor,
    /// Bias over every original head, shared with the following layers.
    pub position_bias: Tensor,
    pub attn_weights: Option<Tensor>,
}

/// Options shared by the self and cross attention entry points.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttendOptions<'a> {
    pub mask: Option<&'a Tensor>,
    pub position_bias: Option<&'a Tensor>,
    pub layer_head_mask: Option<&'a Tensor>,
    pub output_attentions: bool,
    pub train: bool,
}

#[derive(Debug, Clone)]
pub struct UdopAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    n_heads: usize,
    d_kv: usize,
    inner_dim: usize,
    relative_attention_bias: Option<Embedding>,
    relative_attention_num_buckets: usize,
    relative_attention_max_distance: usize,
    is_decoder: bool,
    pruned_heads: PrunedHeads,
    dropout: Dropout,
    span: tracing::Span,
}

impl UdopAttention {
    pub fn load(
        has_relative_attention_bias: bool,
        is_decoder: bool,
        vb: VarBuilder,
        cfg: &Config,
    ) -> Result<Self> {
        let inner_dim = cfg.num_heads * cfg.d_kv;
        let q = linear_no_bias(cfg.d_model, inner_dim, vb.pp("q"))?;
        let k = linear_no_bias(cfg.d_model, inner_dim, vb.pp("k"))?;
        let v = linear_no_bias(cfg.d_model, inner_dim, vb.pp("v"))?;
        let o = linear_no_bias(inner_dim, cfg.d_model, vb.pp("o"))?;
        let relative_attention_bias = if has_relative_attention_bias {
            let emb = Embedding::new(
                cfg.relative_attention_num_buckets,
                cfg.num_heads,
                vb.pp("relative_attention_bias"),
            )?;
            Some(emb)
        } else {
            None
        };
        let span = tracing::span!(tracing::Level::TRACE, "attention");
        Ok(Self {
            q,
            k,
            v,
            o,
            n_heads: cfg.num_heads,
            d_kv: cfg.d_kv,
            inner_dim,
            relative_attention_bias,
            relative_attention_num_buckets: cfg.relative_attention_num_buckets,
            relative_attention_max_distance: cfg.relative_attention_max_distance,
            is_decoder,
            pruned_heads: PrunedHeads::default(),
            dropout: Dropout::new(cfg.dropout_rate as f32),
            span,
        })
    }

    /// Number of heads still computed.
    pub fn num_heads(&self) -> usize {
        self.n_heads
    }

    fn original_num_heads(&self) -> usize {
        self.n_heads + self.pruned_heads.heads.len()
    }

    pub fn pruned_heads(&self) -> &PrunedHeads {
        &self.pruned_heads
    }

    pub fn has_relative_attention_bias(&self) -> bool {
        self.relative_attention_bias.is_some()
    }

    /// Original indexes of the heads still computed, in projection order.
    fn kept_heads(&self) -> Vec<usize> {
        (0..self.original_num_heads())
            .filter(|h| !self.pruned_heads.contains(*h))
            .collect()
    }

    /// Removes `heads`, given in the original numbering, from the q/k/v
    /// outputs and the o inputs. Heads pruned earlier are ignored.
    pub fn prune_heads(&mut self, heads: &[usize]) -> Result<()> {
        let original = self.original_num_heads();
        let mut to_prune = BTreeSet::new();
        for &head in heads {
            if head >= original {
                candle::bail!("cannot prune head {head}, the layer has {original} heads")
            }
            if !self.pruned_heads.contains(head) {
                to_prune.insert(head);
            }
        }
        if to_prune.is_empty() {
            return Ok(());
        }
        let rows: Vec<u32> = self
            .kept_heads()
            .iter()
            .enumerate()
            .filter(|(_, h)| !to_prune.contains(h))
            .flat_map(|(p, _)| (p * self.d_kv..(p + 1) * self.d_kv).map(|r| r as u32))
            .collect();
        let idx = Tensor::new(rows, self.q.weight().device())?;
        self.q = self.q.select_outputs(&idx)?;
        self.k = self.k.select_outputs(&idx)?;
        self.v = self.v.select_outputs(&idx)?;
        self.o = self.o.select_inputs(&idx)?;
        self.n_heads -= to_prune.len();
        self.inner_dim = self.n_heads * self.d_kv;
        self.pruned_heads.heads.extend(to_prune);
        self.pruned_heads.version += 1;
        Ok(())
    }

    /// Learned one-directional (decoder) or bidirectional (encoder) sequence
    /// bias of shape `(1, heads, q_len, k_len)`.
    pub fn compute_bias(&self, q_len: usize, k_len: usize) -> Result<Option<Tensor>> {
        let table = match &self.relative_attention_bias {
            None => return Ok(None),
            Some(table) => table,
        };
        let ids = sequence_bucket_ids(
            q_len,
            k_len,
            !self.is_decoder,
            self.relative_attention_num_buckets,
            self.relative_attention_max_distance,
            table.embeddings().device(),
        )?;
        let bias = table.forward(&ids)?.permute((2, 0, 1))?.unsqueeze(0)?;
        Ok(Some(bias.contiguous()?))
    }

    fn shape(&self, xs: &Tensor, b_sz: usize) -> Result<Tensor> {
        let seq_len = xs.dim(1)?;
        xs.reshape((b_sz, seq_len, self.n_heads, self.d_kv))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Self-attention. With a cache, the new keys and values are appended
    /// and attention runs over every cached position.
    pub fn self_attention(
        &self,
        xs: &Tensor,
        cache: Option<&mut KvBuffer>,
        opts: AttendOptions,
    ) -> Result<AttentionOutput> {
        let _enter = self.span.enter();
        let (b_sz, q_len, _) = xs.dims3()?;
        let k = self.shape(&self.k.forward(xs)?, b_sz)?;
        let v = self.shape(&self.v.forward(xs)?, b_sz)?;
        let (k, v, past_len) = match cache {
            None => (k, v, 0),
            Some(cache) => {
                let past_len = cache.current_seq_len();
                cache.append(&k, &v)?;
                match cache.current()? {
                    Some((k, v)) => (k, v, past_len),
                    None => candle::bail!("kv-cache is empty after an append"),
                }
            }
        };
        let real_seq_len = past_len + q_len;
        self.attend(xs, &k, &v, real_seq_len, past_len > 0, opts)
    }

    /// Attention over `encoder_states`. Cached encoder keys and values are
    /// reused unless the encoder length changed. `query_length` is the
    /// number of decoder positions seen so far when decoding incrementally.
    pub fn cross_attention(
        &self,
        xs: &Tensor,
        encoder_states: &Tensor,
        cache: Option<&mut Option<(Tensor, Tensor)>>,
        query_length: Option<usize>,
        opts: AttendOptions,
    ) -> Result<AttentionOutput> {
        let _enter = self.span.enter();
        let (b_sz, q_len, _) = xs.dims3()?;
        let enc_len = encoder_states.dim(1)?;
        let project = || -> Result<(Tensor, Tensor)> {
            let k = self.shape(&self.k.forward(encoder_states)?, b_sz)?;
            let v = self.shape(&self.v.forward(encoder_states)?, b_sz)?;
            Ok((k, v))
        };
        let (k, v, has_past) = match cache {
            None => {
                let (k, v) = project()?;
                (k, v, false)
            }
            Some(cache) => {
                let (k, v, has_past) = match cache.as_ref() {
                    Some((k, v)) if k.dim(2)? == enc_len => (k.clone(), v.clone(), true),
                    Some((k, _)) => {
                        let past_len = k.dim(2)?;
                        let (k, v) = project()?;
                        (k, v, past_len > 0)
                    }
                    None => {
                        let (k, v) = project()?;
                        (k, v, false)
                    }
                };
                *cache = Some((k.clone(), v.clone()));
                (k, v, has_past)
            }
        };
        let real_seq_len = match (has_past, query_length) {
            (true, Some(query_length)) => q_len + query_length,
            _ => q_len,
        };
        self.attend(xs, &k, &v, real_seq_len, has_past, opts)
    }

    fn attend(
        &self,
        xs: &Tensor,
        k: &Tensor,
        v: &Tensor,
        real_seq_len: usize,
        has_past: bool,
        opts: AttendOptions,
    ) -> Result<AttentionOutput> {
        let (b_sz, q_len, _) = xs.dims3()?;
        let k_len = k.dim(2)?;
        let q = self.shape(&self.q.forward(xs)?, b_sz)?;
        // Scores are not scaled by 1/sqrt(d_kv).
        let scores = q.matmul(&k.t()?)?;

        let position_bias = match opts.position_bias {
            Some(position_bias) => position_bias.clone(),
            None => {
                let bias = match self.compute_bias(real_seq_len, k_len)? {
                    Some(bias) => bias,
                    None => Tensor::zeros(
                        (1, self.original_num_heads(), real_seq_len, k_len),
                        scores.dtype(),
                        scores.device(),
                    )?,
                };
                let bias = if has_past && real_seq_len > q_len {
                    bias.narrow(2, real_seq_len - q_len, q_len)?
                } else {
                    bias
                };
                match opts.mask {
                    Some(mask) => bias.to_dtype(scores.dtype())?.broadcast_add(mask)?,
                    None => bias,
                }
            }
        };
        let position_bias_masked = self.select_heads(&position_bias, 1)?;
        let scores = scores.broadcast_add(&position_bias_masked.to_dtype(scores.dtype())?)?;

        let dtype = scores.dtype();
        let attn_weights =
            candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?.to_dtype(dtype)?;
        let attn_weights = self.dropout.forward(&attn_weights, opts.train)?;
        let attn_weights = match opts.layer_head_mask {
            None => attn_weights,
            Some(head_mask) => {
                let head_mask = self.select_heads(&head_mask.flatten_all()?, 0)?;
                let head_mask = head_mask.reshape((1, self.n_heads, 1, 1))?.to_dtype(dtype)?;
                attn_weights.broadcast_mul(&head_mask)?
            }
        };

        let attn_output = attn_weights.matmul(v)?;
        let attn_output = attn_output
            .transpose(1, 2)?
            .reshape((b_sz, q_len, self.inner_dim))?;
        let hidden_states = self.o.forward(&attn_output)?;
        Ok(AttentionOutput {
            hidden_states,
            position_bias,
            attn_weights: opts.output_attentions.then_some(attn_weights),
        })
    }

    /// Restricts a per-head tensor laid out over the original heads to the
    /// heads that are still computed.
    fn select_heads(&self, xs: &Tensor, dim: usize) -> Result<Tensor> {
        let n = xs.dim(dim)?;
        if n == self.n_heads {
            return Ok(xs.clone());
        }
        if n != self.original_num_heads() {
            candle::bail!(
                "per-head tensor has {n} heads, expected {} or {}",
                self.n_heads,
                self.original_num_heads()
            )
        }
        let kept: Vec<u32> = self.kept_heads().iter().map(|&h| h as u32).collect();
        let idx = Tensor::new(kept, xs.device())?;
        xs.index_select(&idx, dim)
    }

    pub fn device(&self) -> &Device {
        self.q.weight().device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::IndexOp;
    use candle_nn::VarMap;

    fn load(cfg: &Config) -> Result<UdopAttention> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        UdopAttention::load(false, false, vb, cfg)
    }

    #[test]
    fn prune_keeps_remaining_heads() -> Result<()> {
        let mut cfg = Config::tiny();
        cfg.num_heads = 8;
        let mut attn = load(&cfg)?;
        let xs = Tensor::randn(0f32, 1., (1, 5, cfg.d_model), &Device::Cpu)?;
        let bias = Tensor::randn(0f32, 1., (1, 8, 5, 5), &Device::Cpu)?;
        let opts = AttendOptions {
            position_bias: Some(&bias),
            output_attentions: true,
            ..Default::default()
        };
        let before = attn.self_attention(&xs, None, opts)?;
        attn.prune_heads(&[2])?;
        assert_eq!(attn.num_heads(), 7);
        assert_eq!(attn.pruned_heads().version(), 1);
        assert!(attn.pruned_heads().contains(2));
        let after = attn.self_attention(&xs, None, opts)?;

        let before = before.attn_weights.unwrap();
        let after = after.attn_weights.unwrap();
        assert_eq!(after.dims(), &[1, 7, 5, 5]);
        for (new, old) in [(0, 0), (1, 1), (2, 3), (6, 7)] {
            let diff = (after.i((.., new))? - before.i((.., old))?)?
                .abs()?
                .flatten_all()?
                .max(0)?
                .to_scalar::<f32>()?;
            assert!(diff < 1e-5, "head {old} differs by {diff}");
        }

        attn.prune_heads(&[2])?;
        assert_eq!(attn.pruned_heads().version(), 1);
        attn.prune_heads(&[0, 7])?;
        assert_eq!(attn.num_heads(), 5);
        assert!(attn.prune_heads(&[8]).is_err());
        Ok(())
    }

    #[test]
    fn zero_bias_without_table() -> Result<()> {
        let cfg = Config::tiny();
        let attn = load(&cfg)?;
        let xs = Tensor::randn(0f32, 1., (2, 3, cfg.d_model), &Device::Cpu)?;
        let out = attn.self_attention(&xs, None, AttendOptions::default())?;
        assert_eq!(out.hidden_states.dims(), &[2, 3, cfg.d_model]);
        assert_eq!(out.position_bias.dims(), &[1, cfg.num_heads, 3, 3]);
        let max = out.position_bias.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert_eq!(max, 0.);
        Ok(())
    }
}
