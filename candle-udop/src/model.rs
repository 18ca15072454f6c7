// UDOP: Unifying Vision, Text, and Layout for Universal Document Processing
// https://github.com/huggingface/transformers/blob/main/src/transformers/models/udop/modeling_udop.py

use std::collections::HashMap;
use std::sync::Arc;

use candle::{DType, Device, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::cache::DecoderCache;
use crate::config::Config;
use crate::patch::PatchEmbeddings;
use crate::stack::{ForwardOptions, StackInput, StackOutput, UdopStack};
use crate::with_tracing::{linear_no_bias, Embedding, Linear};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Encoder inputs: tokens with their boxes and optionally the page image.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentInput<'a> {
    pub input_ids: Option<&'a Tensor>,
    pub inputs_embeds: Option<&'a Tensor>,
    pub attention_mask: Option<&'a Tensor>,
    pub bbox: Option<&'a Tensor>,
    pub pixel_values: Option<&'a Tensor>,
    pub visual_bbox: Option<&'a Tensor>,
    pub head_mask: Option<&'a Tensor>,
}

impl<'a> DocumentInput<'a> {
    fn stack_input(&self) -> StackInput<'a> {
        StackInput {
            input_ids: self.input_ids,
            inputs_embeds: self.inputs_embeds,
            attention_mask: self.attention_mask,
            bbox: self.bbox,
            pixel_values: self.pixel_values,
            visual_bbox: self.visual_bbox,
            head_mask: self.head_mask,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderInput<'a> {
    pub input_ids: Option<&'a Tensor>,
    pub inputs_embeds: Option<&'a Tensor>,
    pub attention_mask: Option<&'a Tensor>,
    pub head_mask: Option<&'a Tensor>,
    pub cross_attn_head_mask: Option<&'a Tensor>,
}

impl<'a> DecoderInput<'a> {
    fn stack_input(&self, encoder_output: &'a StackOutput) -> StackInput<'a> {
        StackInput {
            input_ids: self.input_ids,
            inputs_embeds: self.inputs_embeds,
            attention_mask: self.attention_mask,
            head_mask: self.head_mask,
            cross_attn_head_mask: self.cross_attn_head_mask,
            encoder_hidden_states: Some(&encoder_output.last_hidden_state),
            encoder_attention_mask: Some(&encoder_output.attention_mask),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Seq2SeqModelOutput {
    pub decoder: StackOutput,
    pub encoder: StackOutput,
}

#[derive(Debug, Clone)]
pub struct Seq2SeqLmOutput {
    pub loss: Option<Tensor>,
    /// `(batch, decoder_len, vocab_size)`
    pub logits: Tensor,
    pub decoder: StackOutput,
    pub encoder: StackOutput,
}

fn load_embeddings(vb: &VarBuilder, cfg: &Config) -> Result<(Arc<Embedding>, Arc<PatchEmbeddings>)> {
    cfg.validate()?;
    let shared = Embedding::new(cfg.vocab_size, cfg.d_model, vb.pp("shared"))?;
    let patch_embed = PatchEmbeddings::load(vb.pp("patch_embed"), cfg)?;
    Ok((Arc::new(shared), Arc::new(patch_embed)))
}

fn encoder_options(opts: ForwardOptions) -> ForwardOptions {
    ForwardOptions {
        use_cache: false,
        ..opts
    }
}

/// Right shift of `labels` into decoder inputs: `decoder_start_token_id` is
/// prepended and ignored positions become `pad_token_id`.
pub fn shift_tokens_right(
    labels: &Tensor,
    pad_token_id: u32,
    decoder_start_token_id: u32,
) -> Result<Tensor> {
    let (b_sz, seq_len) = labels.dims2()?;
    let device = labels.device();
    let labels = labels.to_dtype(DType::I64)?.to_vec2::<i64>()?;
    let mut shifted = Vec::with_capacity(b_sz * seq_len);
    for row in labels.iter() {
        if seq_len == 0 {
            break;
        }
        shifted.push(decoder_start_token_id as i64);
        for &label in row[..seq_len - 1].iter() {
            let label = if label == IGNORE_INDEX {
                pad_token_id as i64
            } else {
                label
            };
            if label < 0 {
                candle::bail!("shifted decoder inputs hold a negative id {label}")
            }
            shifted.push(label)
        }
    }
    Tensor::from_vec(shifted, (b_sz, seq_len), device)
}

/// Mean token cross-entropy over the positions whose label is not
/// `IGNORE_INDEX`, computed in f32.
pub fn cross_entropy_ignore_index(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let vocab_size = logits.dim(D::Minus1)?;
    let logits = logits.flatten_to(logits.rank() - 2)?.to_dtype(DType::F32)?;
    let labels = labels.flatten_all()?.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    if labels.len() != logits.dim(0)? {
        candle::bail!(
            "{} labels for {} predicted positions",
            labels.len(),
            logits.dim(0)?
        )
    }
    let mut targets = Vec::with_capacity(labels.len());
    let mut weights = Vec::with_capacity(labels.len());
    for &label in labels.iter() {
        if label == IGNORE_INDEX {
            targets.push(0u32);
            weights.push(0f32);
        } else if label < 0 || label as usize >= vocab_size {
            candle::bail!("label {label} is outside the vocabulary of {vocab_size}")
        } else {
            targets.push(label as u32);
            weights.push(1f32);
        }
    }
    let count = weights.iter().sum::<f32>();
    let n = targets.len();
    let device = logits.device();
    let targets = Tensor::from_vec(targets, (n, 1), device)?;
    let weights = Tensor::from_vec(weights, n, device)?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let nll = log_probs.gather(&targets, 1)?.squeeze(1)?.neg()?;
    (nll * weights)?.sum_all()? / count as f64
}

/// The encoder alone, producing contextual states of the fused document.
#[derive(Debug, Clone)]
pub struct UdopEncoderModel {
    encoder: UdopStack,
    device: Device,
}

impl UdopEncoderModel {
    pub fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let (shared, patch_embed) = load_embeddings(&vb, cfg)?;
        let encoder = UdopStack::load(
            false,
            vb.pp("encoder"),
            Some(shared),
            Some(patch_embed),
            cfg,
        )?;
        Ok(Self {
            encoder,
            device: vb.device().clone(),
        })
    }

    pub fn forward(&self, input: &DocumentInput, opts: ForwardOptions) -> Result<StackOutput> {
        self.encoder.forward(&input.stack_input(), None, opts)
    }

    /// Prunes self-attention heads, `heads` maps an encoder layer to the
    /// heads to drop.
    pub fn prune_heads(&mut self, heads: &HashMap<usize, Vec<usize>>) -> Result<()> {
        self.encoder.prune_heads(heads)
    }

    pub fn encoder(&self) -> &UdopStack {
        &self.encoder
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Encoder and decoder without the language modeling head.
#[derive(Debug, Clone)]
pub struct UdopModel {
    encoder: UdopStack,
    decoder: UdopStack,
    device: Device,
}

impl UdopModel {
    pub fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let (shared, patch_embed) = load_embeddings(&vb, cfg)?;
        let encoder = UdopStack::load(
            false,
            vb.pp("encoder"),
            Some(shared.clone()),
            Some(patch_embed),
            cfg,
        )?;
        let decoder = UdopStack::load(true, vb.pp("decoder"), Some(shared), None, cfg)?;
        Ok(Self {
            encoder,
            decoder,
            device: vb.device().clone(),
        })
    }

    pub fn encode(&self, input: &DocumentInput, opts: ForwardOptions) -> Result<StackOutput> {
        self.encoder
            .forward(&input.stack_input(), None, encoder_options(opts))
    }

    /// Runs the encoder unless `encoder_output` is given, then the decoder.
    pub fn forward(
        &self,
        input: &DocumentInput,
        decoder_input: &DecoderInput,
        encoder_output: Option<StackOutput>,
        cache: Option<&mut DecoderCache>,
        opts: ForwardOptions,
    ) -> Result<Seq2SeqModelOutput> {
        let encoder = match encoder_output {
            Some(encoder) => encoder,
            None => self.encode(input, opts)?,
        };
        let decoder = self
            .decoder
            .forward(&decoder_input.stack_input(&encoder), cache, opts)?;
        Ok(Seq2SeqModelOutput { decoder, encoder })
    }

    pub fn prune_heads(&mut self, heads: &HashMap<usize, Vec<usize>>) -> Result<()> {
        self.encoder.prune_heads(heads)
    }

    pub fn new_cache(&self, capacity: usize) -> DecoderCache {
        DecoderCache::new(self.decoder.num_layers(), capacity)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Encoder-decoder with the language modeling head, the generation entry point.
#[derive(Debug, Clone)]
pub struct UdopForConditionalGeneration {
    encoder: UdopStack,
    decoder: UdopStack,
    lm_head: Linear,
    tie_word_embeddings: bool,
    d_model: usize,
    pad_token_id: u32,
    decoder_start_token_id: u32,
    device: Device,
    span: tracing::Span,
}

impl UdopForConditionalGeneration {
    pub fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let (shared, patch_embed) = load_embeddings(&vb, cfg)?;
        let encoder = UdopStack::load(
            false,
            vb.pp("encoder"),
            Some(shared.clone()),
            Some(patch_embed),
            cfg,
        )?;
        let decoder = UdopStack::load(true, vb.pp("decoder"), Some(shared.clone()), None, cfg)?;
        let lm_head = if cfg.tie_word_embeddings {
            Linear::from_weights(shared.embeddings().clone(), None)
        } else {
            linear_no_bias(cfg.d_model, cfg.vocab_size, vb.pp("lm_head"))?
        };
        let span = tracing::span!(tracing::Level::TRACE, "udop");
        Ok(Self {
            encoder,
            decoder,
            lm_head,
            tie_word_embeddings: cfg.tie_word_embeddings,
            d_model: cfg.d_model,
            pad_token_id: cfg.pad_token_id,
            decoder_start_token_id: cfg.decoder_start_token_id,
            device: vb.device().clone(),
            span,
        })
    }

    pub fn encode(&self, input: &DocumentInput, opts: ForwardOptions) -> Result<StackOutput> {
        let _enter = self.span.enter();
        self.encoder
            .forward(&input.stack_input(), None, encoder_options(opts))
    }

    /// Decoder states and vocabulary logits for every decoder position.
    pub fn decode(
        &self,
        decoder_input: &DecoderInput,
        encoder_output: &StackOutput,
        cache: Option<&mut DecoderCache>,
        opts: ForwardOptions,
    ) -> Result<(Tensor, StackOutput)> {
        let _enter = self.span.enter();
        let decoder = self
            .decoder
            .forward(&decoder_input.stack_input(encoder_output), cache, opts)?;
        let sequence_output = if self.tie_word_embeddings {
            // Rescale output before projecting on vocab
            (&decoder.last_hidden_state * (self.d_model as f64).powf(-0.5))?
        } else {
            decoder.last_hidden_state.clone()
        };
        let logits = self.lm_head.forward(&sequence_output)?;
        Ok((logits, decoder))
    }

    /// Full pass. Without decoder inputs the decoder is fed the right-shifted
    /// `labels`; with `labels` the loss is returned as well.
    pub fn forward(
        &self,
        input: &DocumentInput,
        decoder_input: &DecoderInput,
        labels: Option<&Tensor>,
        encoder_output: Option<StackOutput>,
        cache: Option<&mut DecoderCache>,
        opts: ForwardOptions,
    ) -> Result<Seq2SeqLmOutput> {
        let encoder = match encoder_output {
            Some(encoder) => encoder,
            None => self.encode(input, opts)?,
        };
        let shifted;
        let mut decoder_input = *decoder_input;
        if decoder_input.input_ids.is_none() && decoder_input.inputs_embeds.is_none() {
            if let Some(labels) = labels {
                shifted = self.shift_right(labels)?;
                decoder_input.input_ids = Some(&shifted);
            }
        }
        let (logits, decoder) = self.decode(&decoder_input, &encoder, cache, opts)?;
        let loss = match labels {
            Some(labels) => Some(cross_entropy_ignore_index(&logits, labels)?),
            None => None,
        };
        Ok(Seq2SeqLmOutput {
            loss,
            logits,
            decoder,
            encoder,
        })
    }

    pub fn shift_right(&self, labels: &Tensor) -> Result<Tensor> {
        shift_tokens_right(labels, self.pad_token_id, self.decoder_start_token_id)
    }

    /// Decoder ids to feed at the next step: only the last position once the
    /// cache holds the earlier ones.
    pub fn prepare_inputs_for_generation(
        &self,
        decoder_input_ids: &Tensor,
        cache: Option<&DecoderCache>,
    ) -> Result<Tensor> {
        match cache {
            Some(cache) if !cache.is_empty() => {
                let seq_len = decoder_input_ids.dim(D::Minus1)?;
                if seq_len == 0 {
                    candle::bail!("no decoder input ids to continue the cached generation from")
                }
                decoder_input_ids.narrow(D::Minus1, seq_len - 1, 1)
            }
            _ => Ok(decoder_input_ids.clone()),
        }
    }

    pub fn reorder_cache(&self, cache: &mut DecoderCache, beam_idx: &Tensor) -> Result<()> {
        cache.reorder(beam_idx)
    }

    pub fn new_cache(&self, capacity: usize) -> DecoderCache {
        DecoderCache::new(self.decoder.num_layers(), capacity)
    }

    pub fn prune_heads(&mut self, heads: &HashMap<usize, Vec<usize>>) -> Result<()> {
        self.encoder.prune_heads(heads)
    }

    pub fn encoder(&self) -> &UdopStack {
        &self.encoder
    }

    pub fn decoder(&self) -> &UdopStack {
        &self.decoder
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
