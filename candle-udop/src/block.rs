use candle::{Module, Result, Tensor};
use candle_nn::{Dropout, VarBuilder};

use crate::attention::{AttendOptions, UdopAttention};
use crate::cache::LayerCache;
use crate::config::Config;
use crate::layers::{clamp_inf_values, UdopLayerFF, UdopLayerNorm};

#[derive(Debug, Clone)]
pub struct UdopLayerSelfAttention {
    self_attention: UdopAttention,
    layer_norm: UdopLayerNorm,
    dropout: Dropout,
}

impl UdopLayerSelfAttention {
    fn load(
        has_relative_attention_bias: bool,
        is_decoder: bool,
        vb: VarBuilder,
        cfg: &Config,
    ) -> Result<Self> {
        let self_attention = UdopAttention::load(
            has_relative_attention_bias,
            is_decoder,
            vb.pp("SelfAttention"),
            cfg,
        )?;
        let layer_norm =
            UdopLayerNorm::load(cfg.d_model, cfg.layer_norm_epsilon, vb.pp("layer_norm"))?;
        Ok(Self {
            self_attention,
            layer_norm,
            dropout: Dropout::new(cfg.dropout_rate as f32),
        })
    }
}

#[derive(Debug, Clone)]
pub struct UdopLayerCrossAttention {
    enc_dec_attention: UdopAttention,
    layer_norm: UdopLayerNorm,
    dropout: Dropout,
}

impl UdopLayerCrossAttention {
    fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let enc_dec_attention = UdopAttention::load(false, true, vb.pp("EncDecAttention"), cfg)?;
        let layer_norm =
            UdopLayerNorm::load(cfg.d_model, cfg.layer_norm_epsilon, vb.pp("layer_norm"))?;
        Ok(Self {
            enc_dec_attention,
            layer_norm,
            dropout: Dropout::new(cfg.dropout_rate as f32),
        })
    }
}

/// Per-call inputs of a block.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockContext<'a> {
    /// Additive self-attention mask, used only when `position_bias` is absent.
    pub attention_mask: Option<&'a Tensor>,
    pub position_bias: Option<&'a Tensor>,
    pub encoder_hidden_states: Option<&'a Tensor>,
    pub encoder_attention_mask: Option<&'a Tensor>,
    pub encoder_decoder_position_bias: Option<&'a Tensor>,
    pub layer_head_mask: Option<&'a Tensor>,
    pub cross_attn_layer_head_mask: Option<&'a Tensor>,
    pub output_attentions: bool,
    pub train: bool,
}

#[derive(Debug, Clone)]
pub struct BlockOutput {
    pub hidden_states: Tensor,
    pub position_bias: Tensor,
    pub encoder_decoder_position_bias: Option<Tensor>,
    pub self_attn_weights: Option<Tensor>,
    pub cross_attn_weights: Option<Tensor>,
}

/// Self-attention, cross-attention when decoding, then feed-forward, each as
/// a pre-norm residual sub-layer.
#[derive(Debug, Clone)]
pub struct UdopBlock {
    self_attn: UdopLayerSelfAttention,
    cross_attn: Option<UdopLayerCrossAttention>,
    ff: UdopLayerFF,
    span: tracing::Span,
}

impl UdopBlock {
    pub fn load(
        has_relative_attention_bias: bool,
        is_decoder: bool,
        vb: VarBuilder,
        cfg: &Config,
    ) -> Result<Self> {
        let vb = vb.pp("layer");
        let self_attn = UdopLayerSelfAttention::load(
            has_relative_attention_bias,
            is_decoder,
            vb.pp("0"),
            cfg,
        )?;
        let cross_attn = if is_decoder {
            Some(UdopLayerCrossAttention::load(vb.pp("1"), cfg)?)
        } else {
            None
        };
        let ff_i = if cross_attn.is_some() { 2 } else { 1 };
        let ff = UdopLayerFF::load(vb.pp(ff_i.to_string()), cfg)?;
        let span = tracing::span!(tracing::Level::TRACE, "block");
        Ok(Self {
            self_attn,
            cross_attn,
            ff,
            span,
        })
    }

    pub fn self_attention(&self) -> &UdopAttention {
        &self.self_attn.self_attention
    }

    pub fn self_attention_mut(&mut self) -> &mut UdopAttention {
        &mut self.self_attn.self_attention
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        ctx: BlockContext,
        cache: Option<&mut LayerCache>,
    ) -> Result<BlockOutput> {
        let _enter = self.span.enter();
        if let Some(cache) = cache.as_deref() {
            let num_states = cache.num_states();
            let expected = if ctx.encoder_hidden_states.is_some() {
                4
            } else {
                2
            };
            if num_states != 0 && num_states != expected {
                candle::bail!("there should be {expected} past states, got {num_states} past key / value states")
            }
        }
        let (mut self_cache, cross_cache) = match cache {
            Some(cache) => (Some(&mut cache.self_attn), Some(&mut cache.cross_attn)),
            None => (None, None),
        };

        let layer = &self.self_attn;
        let normed = layer.layer_norm.forward(xs)?;
        let self_out = layer.self_attention.self_attention(
            &normed,
            self_cache.as_deref_mut(),
            AttendOptions {
                mask: ctx.attention_mask,
                position_bias: ctx.position_bias,
                layer_head_mask: ctx.layer_head_mask,
                output_attentions: ctx.output_attentions,
                train: ctx.train,
            },
        )?;
        // The cross-attention query length when decoding incrementally.
        let query_length = self_cache.map(|c| c.current_seq_len());
        let xs = (xs + layer.dropout.forward(&self_out.hidden_states, ctx.train)?)?;
        let mut xs = clamp_inf_values(&xs)?;

        let mut encoder_decoder_position_bias = None;
        let mut cross_attn_weights = None;
        if let (Some(cross), Some(encoder_states)) = (&self.cross_attn, ctx.encoder_hidden_states)
        {
            let normed = cross.layer_norm.forward(&xs)?;
            let cross_out = cross.enc_dec_attention.cross_attention(
                &normed,
                encoder_states,
                cross_cache,
                query_length,
                AttendOptions {
                    mask: ctx.encoder_attention_mask,
                    position_bias: ctx.encoder_decoder_position_bias,
                    layer_head_mask: ctx.cross_attn_layer_head_mask,
                    output_attentions: ctx.output_attentions,
                    train: ctx.train,
                },
            )?;
            let ys = cross.dropout.forward(&cross_out.hidden_states, ctx.train)?;
            xs = clamp_inf_values(&(xs + ys)?)?;
            encoder_decoder_position_bias = Some(cross_out.position_bias);
            cross_attn_weights = cross_out.attn_weights;
        }

        let xs = self.ff.forward_t(&xs, ctx.train)?;
        let xs = clamp_inf_values(&xs)?;
        Ok(BlockOutput {
            hidden_states: xs,
            position_bias: self_out.position_bias,
            encoder_decoder_position_bias,
            self_attn_weights: self_out.attn_weights,
            cross_attn_weights,
        })
    }
}
