//! Fusion of the page image patches with the token embeddings.
//!
//! Each token with a real box receives the embedding of the patch under its
//! box midpoint. The patches no token landed on are appended after the text
//! as visual-only positions, padded or truncated to a common length.
use candle::{DType, Device, IndexOp, Result, Tensor, D};

/// Normalized `(x0, y0, x1, y1)` boxes of the patch grid, `(num_patches, 4)`
/// in row-major order.
pub fn visual_bbox(image_size: usize, patch_size: usize, device: &Device) -> Result<Tensor> {
    if patch_size == 0 || image_size % patch_size != 0 {
        candle::bail!("patch size {patch_size} does not divide image size {image_size}")
    }
    let n = image_size / patch_size;
    let edge = |i: usize| i as f32 / n as f32;
    let boxes: Vec<f32> = (0..n)
        .flat_map(|row| {
            (0..n).flat_map(move |col| [edge(col), edge(row), edge(col + 1), edge(row + 1)])
        })
        .collect();
    Tensor::from_vec(boxes, (n * n, 4), device)
}

/// Boxes whose coordinates average exactly 0 or 1 mark tokens without a
/// region on the page.
pub fn is_sentinel_box(bbox: &[f32]) -> bool {
    let mean = bbox.iter().map(|&v| v as f64).sum::<f64>() / bbox.len() as f64;
    mean == 0.0 || mean == 1.0
}

/// Row-major index of the patch containing the box midpoint, the midpoint
/// being clamped to the grid.
pub fn patch_index(bbox: &[f32], num_patches_per_side: usize) -> usize {
    let n = num_patches_per_side as f32;
    let max = num_patches_per_side as i64 - 1;
    let x = (((bbox[0] + bbox[2]) / 2. * n).floor() as i64).clamp(0, max);
    let y = (((bbox[1] + bbox[3]) / 2. * n).floor() as i64).clamp(0, max);
    (x + y * num_patches_per_side as i64) as usize
}

/// Patch assignment of a batch. Visual-only patches are kept in a single
/// arena with room for every patch of every example.
#[derive(Debug, Clone)]
pub struct PatchAssignment {
    num_patches: usize,
    seq_len: usize,
    /// Patch under each token, `None` for sentinel boxes.
    token_patch: Vec<Option<u32>>,
    used: Vec<bool>,
    visual_only: Vec<u32>,
    visual_only_len: Vec<usize>,
}

impl PatchAssignment {
    /// `boxes` is `[batch][seq_len][4]`.
    pub fn new(boxes: &[Vec<Vec<f32>>], num_patches_per_side: usize) -> Result<Self> {
        let num_patches = num_patches_per_side * num_patches_per_side;
        let b_sz = boxes.len();
        let seq_len = boxes.first().map_or(0, |b| b.len());
        let mut token_patch = Vec::with_capacity(b_sz * seq_len);
        let mut used = vec![false; b_sz * num_patches];
        for (b, example) in boxes.iter().enumerate() {
            if example.len() != seq_len {
                candle::bail!("ragged bbox batch, {} vs {seq_len} boxes", example.len())
            }
            for bbox in example.iter() {
                if bbox.len() != 4 {
                    candle::bail!("expected 4 coordinates per box, got {}", bbox.len())
                }
                if is_sentinel_box(bbox) {
                    token_patch.push(None);
                    continue;
                }
                let p = patch_index(bbox, num_patches_per_side);
                used[b * num_patches + p] = true;
                token_patch.push(Some(p as u32));
            }
        }
        let mut visual_only = vec![0u32; b_sz * num_patches];
        let mut visual_only_len = vec![0usize; b_sz];
        for b in 0..b_sz {
            let arena = &mut visual_only[b * num_patches..(b + 1) * num_patches];
            let mut len = 0;
            for p in 0..num_patches {
                if !used[b * num_patches + p] {
                    arena[len] = p as u32;
                    len += 1;
                }
            }
            visual_only_len[b] = len;
        }
        Ok(Self {
            num_patches,
            seq_len,
            token_patch,
            used,
            visual_only,
            visual_only_len,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.visual_only_len.len()
    }

    pub fn token_patch(&self, b: usize, t: usize) -> Option<usize> {
        self.token_patch[b * self.seq_len + t].map(|p| p as usize)
    }

    pub fn is_used(&self, b: usize, p: usize) -> bool {
        self.used[b * self.num_patches + p]
    }

    /// Patches of example `b` no token landed on, in ascending order.
    pub fn visual_only(&self, b: usize) -> &[u32] {
        let start = b * self.num_patches;
        &self.visual_only[start..start + self.visual_only_len[b]]
    }

    /// Indexes into a patch table with an extra zero row at `num_patches`,
    /// truncated or padded with that row to `target_len`.
    fn padded_visual_only(&self, b: usize, target_len: usize) -> Vec<u32> {
        let patches = self.visual_only(b);
        (0..target_len)
            .map(|i| patches.get(i).copied().unwrap_or(self.num_patches as u32))
            .collect()
    }
}

/// Static settings of the fusion step.
#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    pub image_size: usize,
    pub patch_size: usize,
    /// Total fused length, or 0 to append exactly `num_patches` positions.
    pub max_len: usize,
}

impl FusionConfig {
    pub fn num_patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }
}

#[derive(Debug, Clone)]
pub struct FusedInputs {
    /// `(batch, seq_len + extra, d_model)`
    pub inputs_embeds: Tensor,
    /// `(batch, seq_len + extra, 4)`
    pub bbox: Tensor,
    /// `(batch, seq_len + extra)`, only when a mask was given.
    pub attention_mask: Option<Tensor>,
}

/// Adds to each token the patch under its box and appends the unused
/// patches with their boxes and mask.
///
/// `image_embeddings` is `(batch, num_patches, d_model)`, `inputs_embeds`
/// `(batch, seq_len, d_model)` and `bbox` `(batch, seq_len, 4)`.
/// `visual_bbox` may be `(num_patches, 4)` or `(batch, num_patches, 4)` and
/// defaults to the patch grid boxes.
pub fn combine_image_text_embeddings(
    image_embeddings: &Tensor,
    inputs_embeds: &Tensor,
    bbox: &Tensor,
    visual_bbox: Option<&Tensor>,
    attention_mask: Option<&Tensor>,
    cfg: &FusionConfig,
) -> Result<FusedInputs> {
    let span = tracing::span!(tracing::Level::TRACE, "fusion");
    let _enter = span.enter();
    let (b_sz, num_patches, d_model) = image_embeddings.dims3()?;
    let (_, seq_len, _) = inputs_embeds.dims3()?;
    let n = cfg.num_patches_per_side();
    if n * n != num_patches {
        candle::bail!("image embeddings hold {num_patches} patches, expected {}", n * n)
    }
    if bbox.dims() != [b_sz, seq_len, 4] {
        candle::bail!(
            "bbox shape {:?} does not match the embeddings ({b_sz}, {seq_len}, 4)",
            bbox.shape()
        )
    }
    let target_len = match cfg.max_len {
        0 => num_patches,
        max_len if max_len < seq_len => {
            candle::bail!("max_len {max_len} is shorter than the text sequence {seq_len}")
        }
        max_len => max_len - seq_len,
    };
    let device = inputs_embeds.device();
    let boxes = bbox.to_dtype(DType::F32)?.to_vec3::<f32>()?;
    let assignment = PatchAssignment::new(&boxes, n)?;

    // Visual embedding of every token, zeroed for sentinel boxes.
    let mut token_idx = Vec::with_capacity(b_sz * seq_len);
    let mut keep = Vec::with_capacity(b_sz * seq_len);
    for b in 0..b_sz {
        for t in 0..seq_len {
            let p = assignment.token_patch(b, t);
            token_idx.push(p.unwrap_or(0) as u32);
            keep.push(if p.is_some() { 1f32 } else { 0. });
        }
    }
    let token_idx = Tensor::from_vec(token_idx, (b_sz, seq_len, 1), device)?
        .broadcast_as((b_sz, seq_len, d_model))?
        .contiguous()?;
    let keep = Tensor::from_vec(keep, (b_sz, seq_len, 1), device)?
        .to_dtype(inputs_embeds.dtype())?;
    let token_vision = image_embeddings
        .to_dtype(inputs_embeds.dtype())?
        .contiguous()?
        .gather(&token_idx, 1)?
        .broadcast_mul(&keep)?;
    let inputs_embeds = (inputs_embeds + token_vision)?;

    // Visual-only positions, gathered from tables with a trailing zero row.
    let visual_bbox = match visual_bbox {
        Some(v) => match v.rank() {
            2 => v.unsqueeze(0)?.broadcast_as((b_sz, num_patches, 4))?,
            _ => v.clone(),
        },
        None => self::visual_bbox(cfg.image_size, cfg.patch_size, device)?
            .unsqueeze(0)?
            .broadcast_as((b_sz, num_patches, 4))?,
    };
    if visual_bbox.dims() != [b_sz, num_patches, 4] {
        candle::bail!("visual bbox shape {:?} does not match {num_patches} patches", visual_bbox.shape())
    }
    let visual_bbox = visual_bbox.to_dtype(bbox.dtype())?.contiguous()?;
    let image_table = Tensor::cat(
        &[
            image_embeddings.to_dtype(inputs_embeds.dtype())?,
            Tensor::zeros((b_sz, 1, d_model), inputs_embeds.dtype(), device)?,
        ],
        1,
    )?;
    let bbox_table = Tensor::cat(
        &[
            visual_bbox,
            Tensor::zeros((b_sz, 1, 4), bbox.dtype(), device)?,
        ],
        1,
    )?;
    let mut patches = Vec::with_capacity(b_sz);
    let mut patch_boxes = Vec::with_capacity(b_sz);
    let mut visual_mask = Vec::with_capacity(b_sz * target_len);
    for b in 0..b_sz {
        let idx = assignment.padded_visual_only(b, target_len);
        let real = assignment.visual_only(b).len().min(target_len);
        visual_mask.extend((0..target_len).map(|i| u32::from(i < real)));
        let idx = Tensor::from_vec(idx, target_len, device)?;
        patches.push(image_table.i(b)?.index_select(&idx, 0)?);
        patch_boxes.push(bbox_table.i(b)?.index_select(&idx, 0)?);
    }
    let patches = Tensor::stack(&patches, 0)?;
    let patch_boxes = Tensor::stack(&patch_boxes, 0)?;

    let inputs_embeds = Tensor::cat(&[&inputs_embeds, &patches], 1)?;
    let bbox = Tensor::cat(&[bbox, &patch_boxes], 1)?;
    let attention_mask = match attention_mask {
        None => None,
        Some(mask) => {
            let visual_mask = Tensor::from_vec(visual_mask, (b_sz, target_len), device)?
                .to_dtype(mask.dtype())?;
            Some(Tensor::cat(&[mask, &visual_mask], D::Minus1)?)
        }
    };
    Ok(FusedInputs {
        inputs_embeds,
        bbox,
        attention_mask,
    })
}
