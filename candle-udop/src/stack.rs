use std::collections::HashMap;
use std::sync::Arc;

use candle::{DType, IndexOp, Module, Result, Tensor};
use candle_nn::{Dropout, VarBuilder};

use crate::bias::{AggregatedBias, BiasInput};
use crate::block::{BlockContext, UdopBlock};
use crate::cache::DecoderCache;
use crate::config::Config;
use crate::fusion::{combine_image_text_embeddings, FusionConfig};
use crate::layers::UdopLayerNorm;
use crate::mask::{extended_attention_mask, invert_attention_mask};
use crate::patch::PatchEmbeddings;
use crate::with_tracing::Embedding;

/// Shape of the placeholder batch that stands in for an empty one.
const EMPTY_BATCH_SHAPE: (usize, usize) = (4, 1024);

/// Sum of the x and y table embeddings of the four box coordinates.
#[derive(Debug, Clone)]
pub struct CellEmbeddings {
    x_position_embeddings: Embedding,
    y_position_embeddings: Embedding,
    max_2d_position_embeddings: usize,
    span: tracing::Span,
}

impl CellEmbeddings {
    pub fn load(max_2d_position_embeddings: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let x_position_embeddings = Embedding::new(
            max_2d_position_embeddings,
            hidden_size,
            vb.pp("x_position_embeddings"),
        )?;
        let y_position_embeddings = Embedding::new(
            max_2d_position_embeddings,
            hidden_size,
            vb.pp("y_position_embeddings"),
        )?;
        let span = tracing::span!(tracing::Level::TRACE, "cell-embeddings");
        Ok(Self {
            x_position_embeddings,
            y_position_embeddings,
            max_2d_position_embeddings,
            span,
        })
    }
}

impl Module for CellEmbeddings {
    fn forward(&self, bbox: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let scale = (self.max_2d_position_embeddings - 1) as f64;
        let cells = (bbox.to_dtype(DType::F32)?.clamp(0f32, 1f32)? * scale)?.to_dtype(DType::U32)?;
        let left = self.x_position_embeddings.forward(&cells.i((.., .., 0))?)?;
        let upper = self.y_position_embeddings.forward(&cells.i((.., .., 1))?)?;
        let right = self.x_position_embeddings.forward(&cells.i((.., .., 2))?)?;
        let lower = self.y_position_embeddings.forward(&cells.i((.., .., 3))?)?;
        (left + upper)? + (right + lower)?
    }
}

/// Inputs of a stack. Exactly one of `input_ids` and `inputs_embeds` must be
/// set; empty `input_ids` stand for an empty batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackInput<'a> {
    pub input_ids: Option<&'a Tensor>,
    pub inputs_embeds: Option<&'a Tensor>,
    pub attention_mask: Option<&'a Tensor>,
    /// `(batch, seq_len, 4)` normalized boxes, encoder only.
    pub bbox: Option<&'a Tensor>,
    pub pixel_values: Option<&'a Tensor>,
    pub visual_bbox: Option<&'a Tensor>,
    pub image_embeddings: Option<&'a Tensor>,
    pub encoder_hidden_states: Option<&'a Tensor>,
    pub encoder_attention_mask: Option<&'a Tensor>,
    /// `(heads)` or `(layers, heads)`, 1 keeps a head and 0 silences it.
    pub head_mask: Option<&'a Tensor>,
    pub cross_attn_head_mask: Option<&'a Tensor>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions {
    pub use_cache: bool,
    pub output_attentions: bool,
    pub output_hidden_states: bool,
    pub train: bool,
}

impl ForwardOptions {
    /// Inference options with caching as configured in `use_cache`.
    pub fn new(cfg: &Config) -> Self {
        Self {
            use_cache: cfg.use_cache,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct StackOutput {
    pub last_hidden_state: Tensor,
    /// The mask over the stack positions, including appended visual patches.
    pub attention_mask: Tensor,
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
    pub cross_attentions: Option<Vec<Tensor>>,
}

/// Expands a `(heads)` or `(layers, heads)` head mask to one entry per layer.
pub fn layer_head_masks(head_mask: Option<&Tensor>, num_layers: usize) -> Result<Vec<Option<Tensor>>> {
    match head_mask {
        None => Ok(vec![None; num_layers]),
        Some(mask) => match mask.rank() {
            1 => Ok(vec![Some(mask.clone()); num_layers]),
            2 => {
                let layers = mask.dim(0)?;
                if layers != num_layers {
                    candle::bail!("head mask covers {layers} layers, the stack has {num_layers}")
                }
                (0..num_layers).map(|i| Ok(Some(mask.i(i)?))).collect()
            }
            rank => candle::bail!("head mask must have rank 1 or 2, got {rank}"),
        },
    }
}

#[derive(Debug, Clone)]
pub struct UdopStack {
    block: Vec<UdopBlock>,
    final_layer_norm: UdopLayerNorm,
    dropout: Dropout,
    embed_tokens: Option<Arc<Embedding>>,
    embed_patches: Option<Arc<PatchEmbeddings>>,
    cell_2d_embedding: Option<CellEmbeddings>,
    relative_bias: Option<AggregatedBias>,
    is_decoder: bool,
    pad_token_id: u32,
    fusion: FusionConfig,
    span: tracing::Span,
}

impl UdopStack {
    pub fn load(
        is_decoder: bool,
        vb: VarBuilder,
        embed_tokens: Option<Arc<Embedding>>,
        embed_patches: Option<Arc<PatchEmbeddings>>,
        cfg: &Config,
    ) -> Result<Self> {
        let num_layers = if is_decoder {
            cfg.decoder_layers()
        } else {
            cfg.num_layers
        };
        // Only the decoder's first block owns a bias table, the encoder bias
        // comes from the aggregated layout biases.
        let block = (0..num_layers)
            .map(|i| UdopBlock::load(is_decoder && i == 0, is_decoder, vb.pp(format!("block.{i}")), cfg))
            .collect::<Result<Vec<_>>>()?;
        let final_layer_norm = UdopLayerNorm::load(
            cfg.d_model,
            cfg.layer_norm_epsilon,
            vb.pp("final_layer_norm"),
        )?;
        let (cell_2d_embedding, relative_bias) = if is_decoder {
            (None, None)
        } else {
            let cell = CellEmbeddings::load(
                cfg.max_2d_position_embeddings,
                cfg.d_model,
                vb.pp("cell_2d_embedding"),
            )?;
            (Some(cell), Some(AggregatedBias::load(cfg, vb.clone())?))
        };
        let span = tracing::span!(tracing::Level::TRACE, "stack", decoder = is_decoder);
        Ok(Self {
            block,
            final_layer_norm,
            dropout: Dropout::new(cfg.dropout_rate as f32),
            embed_tokens,
            embed_patches,
            cell_2d_embedding,
            relative_bias,
            is_decoder,
            pad_token_id: cfg.pad_token_id,
            fusion: FusionConfig {
                image_size: cfg.image_size,
                patch_size: cfg.patch_size,
                max_len: 0,
            },
            span,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.block.len()
    }

    pub fn blocks(&self) -> &[UdopBlock] {
        &self.block
    }

    pub fn embed_tokens(&self) -> Option<&Arc<Embedding>> {
        self.embed_tokens.as_ref()
    }

    pub fn relative_bias(&self) -> Option<&AggregatedBias> {
        self.relative_bias.as_ref()
    }

    /// Removes self-attention heads, `heads` maps a layer to the heads to drop.
    pub fn prune_heads(&mut self, heads: &HashMap<usize, Vec<usize>>) -> Result<()> {
        for (&layer, heads) in heads.iter() {
            match self.block.get_mut(layer) {
                Some(block) => block.self_attention_mut().prune_heads(heads)?,
                None => candle::bail!("cannot prune layer {layer}, the stack has {} layers", self.block.len()),
            }
        }
        Ok(())
    }

    pub fn forward(
        &self,
        input: &StackInput,
        cache: Option<&mut DecoderCache>,
        opts: ForwardOptions,
    ) -> Result<StackOutput> {
        let _enter = self.span.enter();
        let prefix = if self.is_decoder { "decoder_" } else { "" };

        // Placeholder tensors of an empty batch.
        let empty_batch;
        let mut attention_mask = input.attention_mask.cloned();
        let mut bbox = input.bbox.cloned();
        let inputs_embeds = match (input.input_ids, input.inputs_embeds) {
            (Some(_), Some(_)) => candle::bail!(
                "You cannot specify both {prefix}input_ids and {prefix}inputs_embeds at the same time"
            ),
            (None, None) => candle::bail!(
                "You have to specify either {prefix}input_ids or {prefix}inputs_embeds"
            ),
            (None, Some(embeds)) => embeds.clone(),
            (Some(ids), None) => {
                let ids = if ids.elem_count() == 0 {
                    tracing::warn!("Empty batch");
                    let device = ids.device();
                    empty_batch = Tensor::full(self.pad_token_id, EMPTY_BATCH_SHAPE, device)?
                        .to_dtype(ids.dtype())?;
                    attention_mask = Some(Tensor::zeros(EMPTY_BATCH_SHAPE, DType::U32, device)?);
                    let (b, l) = EMPTY_BATCH_SHAPE;
                    bbox = Some(Tensor::zeros((b, l, 4), DType::F32, device)?);
                    &empty_batch
                } else {
                    ids
                };
                let ids = match ids.rank() {
                    0 => candle::bail!("{prefix}input_ids must have at least one dimension"),
                    1 => ids.unsqueeze(0)?,
                    _ => ids.flatten_to(ids.rank() - 2)?,
                };
                match &self.embed_tokens {
                    Some(embed_tokens) => embed_tokens.forward(&ids)?,
                    None => candle::bail!(
                        "You have to initialize the model with valid token embeddings"
                    ),
                }
            }
        };

        let image_embeddings = match (input.pixel_values, &self.embed_patches) {
            (Some(pixel_values), Some(embed_patches)) => Some(embed_patches.forward(pixel_values)?),
            (Some(_), None) => candle::bail!("pixel values given to a stack without patch embeddings"),
            (None, _) => input.image_embeddings.cloned(),
        };
        let mut inputs_embeds = inputs_embeds;
        if let Some(image_embeddings) = image_embeddings {
            let text_bbox = match &bbox {
                Some(bbox) => bbox,
                None => candle::bail!("bbox is required to fuse the image with the text"),
            };
            let fused = combine_image_text_embeddings(
                &image_embeddings,
                &inputs_embeds,
                text_bbox,
                input.visual_bbox,
                attention_mask.as_ref(),
                &self.fusion,
            )?;
            inputs_embeds = fused.inputs_embeds;
            bbox = Some(fused.bbox);
            attention_mask = fused.attention_mask;
        }
        if let (Some(cell_2d_embedding), Some(bbox)) = (&self.cell_2d_embedding, &bbox) {
            inputs_embeds = (inputs_embeds + cell_2d_embedding.forward(bbox)?)?;
        }

        let (b_sz, seq_len, _) = inputs_embeds.dims3()?;
        let device = inputs_embeds.device().clone();
        let dtype = inputs_embeds.dtype();

        if opts.use_cache && !self.is_decoder {
            candle::bail!("`use_cache` can only be set to `True` if the stack is used as a decoder")
        }
        let mut cache = match cache {
            Some(_) if !self.is_decoder => {
                tracing::warn!("`past_key_values` is passed to the encoder. Please make sure this is intended.");
                None
            }
            Some(cache) if opts.use_cache => {
                if cache.num_layers() != self.block.len() {
                    candle::bail!(
                        "cache holds {} layers, the stack has {}",
                        cache.num_layers(),
                        self.block.len()
                    )
                }
                Some(cache)
            }
            _ => None,
        };
        let past_len = cache.as_ref().map_or(0, |c| c.seq_len());
        let mask_seq_len = past_len + seq_len;

        let attention_mask = match attention_mask {
            Some(mask) => {
                let (mask_b, mask_len) = mask.dims2()?;
                if mask_b != b_sz || mask_len != mask_seq_len {
                    candle::bail!(
                        "attention mask shape ({mask_b}, {mask_len}) does not match ({b_sz}, {mask_seq_len})"
                    )
                }
                mask
            }
            None => Tensor::ones((b_sz, mask_seq_len), DType::U32, &device)?,
        };
        let encoder_attention_mask = match (input.encoder_hidden_states, input.encoder_attention_mask) {
            (Some(_), Some(mask)) if self.is_decoder => Some(mask.clone()),
            (Some(states), None) if self.is_decoder => {
                Some(Tensor::ones((b_sz, states.dim(1)?), DType::U32, &device)?)
            }
            _ => None,
        };

        let causal_q_len = self.is_decoder.then_some(seq_len);
        let extended_mask = extended_attention_mask(&attention_mask, causal_q_len, dtype)?;
        let encoder_extended_mask = match &encoder_attention_mask {
            Some(mask) => Some(invert_attention_mask(mask, dtype)?),
            None => None,
        };

        let head_masks = layer_head_masks(input.head_mask, self.block.len())?;
        let cross_head_masks = layer_head_masks(input.cross_attn_head_mask, self.block.len())?;

        let mut position_bias = match &self.relative_bias {
            Some(relative_bias) if !self.is_decoder => {
                let bias_input = BiasInput::new(b_sz, seq_len, bbox.as_ref());
                let bias = relative_bias.forward_t(&bias_input, opts.train)?;
                Some(bias.to_dtype(dtype)?.broadcast_add(&extended_mask)?)
            }
            _ => None,
        };
        let mut encoder_decoder_position_bias: Option<Tensor> = None;

        let mut all_hidden_states = opts.output_hidden_states.then(Vec::new);
        let mut all_attentions = opts.output_attentions.then(Vec::new);
        let mut all_cross_attentions = (opts.output_attentions && self.is_decoder).then(Vec::new);

        let mut hidden_states = self.dropout.forward(&inputs_embeds, opts.train)?;
        for (i, block) in self.block.iter().enumerate() {
            if let Some(all) = all_hidden_states.as_mut() {
                all.push(hidden_states.clone())
            }
            let ctx = BlockContext {
                attention_mask: Some(&extended_mask),
                position_bias: position_bias.as_ref(),
                encoder_hidden_states: input.encoder_hidden_states,
                encoder_attention_mask: encoder_extended_mask.as_ref(),
                encoder_decoder_position_bias: encoder_decoder_position_bias.as_ref(),
                layer_head_mask: head_masks[i].as_ref(),
                cross_attn_layer_head_mask: cross_head_masks[i].as_ref(),
                output_attentions: opts.output_attentions,
                train: opts.train,
            };
            let layer_cache = cache.as_deref_mut().map(|c| &mut c.layers_mut()[i]);
            let out = match block.forward(&hidden_states, ctx, layer_cache) {
                Ok(out) => out,
                Err(err) => {
                    // Keep the layers in step for the next call.
                    if let Some(cache) = cache.as_deref_mut() {
                        cache.truncate(past_len)
                    }
                    return Err(err);
                }
            };
            hidden_states = out.hidden_states;
            position_bias = Some(out.position_bias);
            if self.is_decoder && input.encoder_hidden_states.is_some() {
                encoder_decoder_position_bias = out.encoder_decoder_position_bias;
            }
            if let (Some(all), Some(w)) = (all_attentions.as_mut(), out.self_attn_weights) {
                all.push(w)
            }
            if let (Some(all), Some(w)) = (all_cross_attentions.as_mut(), out.cross_attn_weights) {
                all.push(w)
            }
        }

        let hidden_states = self.final_layer_norm.forward(&hidden_states)?;
        let hidden_states = self.dropout.forward(&hidden_states, opts.train)?;
        if let Some(all) = all_hidden_states.as_mut() {
            all.push(hidden_states.clone())
        }
        Ok(StackOutput {
            last_hidden_state: hidden_states,
            attention_mask,
            hidden_states: all_hidden_states,
            attentions: all_attentions,
            cross_attentions: all_cross_attentions,
        })
    }
}
