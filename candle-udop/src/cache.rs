//! Incremental decoding state.
//!
//! Self-attention keys and values are written into a preallocated buffer at a
//! cursor instead of being concatenated at every step. The buffers are
//! updated in place, so they are never shallow-cloned: use `try_clone` for an
//! independent copy.
use candle::{Result, Tensor};

/// Preallocated `(batch, heads, capacity, d_kv)` key and value storage.
#[derive(Debug)]
pub struct KvBuffer {
    data: Option<(Tensor, Tensor)>,
    current_seq_len: usize,
    capacity: usize,
}

impl KvBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: None,
            current_seq_len: 0,
            capacity,
        }
    }

    /// Seeds a buffer from caller supplied `[key, value]` states.
    pub fn from_states(states: &[Tensor], capacity: usize) -> Result<Self> {
        let (k, v) = match states {
            [k, v] => (k, v),
            _ => candle::bail!(
                "past_key_value should have 2 past states: keys and values. Got {} past states",
                states.len()
            ),
        };
        let mut buffer = Self::new(capacity);
        buffer.append(k, v)?;
        Ok(buffer)
    }

    pub fn current_seq_len(&self) -> usize {
        self.current_seq_len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.current_seq_len == 0
    }

    /// Writes `k` and `v`, both `(batch, heads, seq_len, d_kv)`, at the cursor.
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<()> {
        if k.shape() != v.shape() {
            candle::bail!("key {:?} and value {:?} shapes differ", k.shape(), v.shape())
        }
        let (b_sz, n_heads, seq_len, d_kv) = k.dims4()?;
        if self.current_seq_len + seq_len > self.capacity {
            candle::bail!(
                "kv-cache: above max-seq-len {}+{seq_len}>{}",
                self.current_seq_len,
                self.capacity
            )
        }
        if self.data.is_none() {
            let shape = (b_sz, n_heads, self.capacity, d_kv);
            let all_k = Tensor::zeros(shape, k.dtype(), k.device())?;
            let all_v = Tensor::zeros(shape, v.dtype(), v.device())?;
            self.data = Some((all_k, all_v));
        }
        if let Some((all_k, all_v)) = &self.data {
            all_k.slice_set(&k.contiguous()?, 2, self.current_seq_len)?;
            all_v.slice_set(&v.contiguous()?, 2, self.current_seq_len)?;
        }
        self.current_seq_len += seq_len;
        Ok(())
    }

    /// Moves the cursor back to `seq_len`, dropping the later positions.
    pub fn truncate(&mut self, seq_len: usize) {
        self.current_seq_len = self.current_seq_len.min(seq_len)
    }

    /// The filled prefix of the buffer, `None` before the first append.
    pub fn current(&self) -> Result<Option<(Tensor, Tensor)>> {
        match &self.data {
            None => Ok(None),
            Some((k, v)) => {
                let k = k.narrow(2, 0, self.current_seq_len)?.contiguous()?;
                let v = v.narrow(2, 0, self.current_seq_len)?.contiguous()?;
                Ok(Some((k, v)))
            }
        }
    }

    fn reorder(&mut self, beam_idx: &Tensor) -> Result<()> {
        if let Some((k, v)) = &self.data {
            let (k, v) = (reorder_states(k, beam_idx)?, reorder_states(v, beam_idx)?);
            self.data = Some((k, v))
        }
        Ok(())
    }

    pub fn try_clone(&self) -> Result<Self> {
        let data = match &self.data {
            None => None,
            Some((k, v)) => Some((k.copy()?, v.copy()?)),
        };
        Ok(Self {
            data,
            current_seq_len: self.current_seq_len,
            capacity: self.capacity,
        })
    }
}

fn reorder_states(xs: &Tensor, beam_idx: &Tensor) -> Result<Tensor> {
    let beam_idx = beam_idx.to_device(xs.device())?;
    let reordered = xs.index_select(&beam_idx, 0)?;
    if reordered.shape() != xs.shape() {
        candle::bail!(
            "reordered state has shape {:?}, expected {:?}",
            reordered.shape(),
            xs.shape()
        )
    }
    Ok(reordered)
}

/// Cached state of one decoder block.
#[derive(Debug)]
pub struct LayerCache {
    pub self_attn: KvBuffer,
    /// Keys and values of the encoder states, computed once per generation.
    pub cross_attn: Option<(Tensor, Tensor)>,
}

impl LayerCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            self_attn: KvBuffer::new(capacity),
            cross_attn: None,
        }
    }

    /// Builds a layer cache from `[self_k, self_v]` or
    /// `[self_k, self_v, cross_k, cross_v]`.
    pub fn from_states(states: &[Tensor], capacity: usize) -> Result<Self> {
        let (self_states, cross_attn) = match states {
            [_, _] => (states, None),
            [_, _, k, v] => (&states[..2], Some((k.clone(), v.clone()))),
            _ => candle::bail!(
                "there should be 2 or 4 past states (self and cross attention keys and values), got {}",
                states.len()
            ),
        };
        Ok(Self {
            self_attn: KvBuffer::from_states(self_states, capacity)?,
            cross_attn,
        })
    }

    /// Number of cached tensors, 0 for a fresh cache.
    pub fn num_states(&self) -> usize {
        match (self.self_attn.is_empty(), &self.cross_attn) {
            (true, None) => 0,
            (_, None) => 2,
            (_, Some(_)) => 4,
        }
    }

    pub fn states(&self) -> Result<Vec<Tensor>> {
        let mut states = vec![];
        if let Some((k, v)) = self.self_attn.current()? {
            states.push(k);
            states.push(v);
        }
        if let Some((k, v)) = &self.cross_attn {
            states.push(k.clone());
            states.push(v.clone());
        }
        Ok(states)
    }

    fn reorder(&mut self, beam_idx: &Tensor) -> Result<()> {
        self.self_attn.reorder(beam_idx)?;
        if let Some((k, v)) = &self.cross_attn {
            self.cross_attn = Some((reorder_states(k, beam_idx)?, reorder_states(v, beam_idx)?))
        }
        Ok(())
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            self_attn: self.self_attn.try_clone()?,
            cross_attn: self.cross_attn.clone(),
        })
    }
}

/// Per-layer caches of a decoder stack.
#[derive(Debug)]
pub struct DecoderCache {
    layers: Vec<LayerCache>,
}

impl DecoderCache {
    /// An empty cache able to hold `capacity` decoder positions.
    pub fn new(num_layers: usize, capacity: usize) -> Self {
        let layers = (0..num_layers).map(|_| LayerCache::new(capacity)).collect();
        Self { layers }
    }

    pub fn from_states(states: &[Vec<Tensor>], capacity: usize) -> Result<Self> {
        let layers = states
            .iter()
            .map(|s| LayerCache::from_states(s, capacity))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[LayerCache] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [LayerCache] {
        &mut self.layers
    }

    /// Number of decoder positions already cached.
    pub fn seq_len(&self) -> usize {
        self.layers
            .first()
            .map_or(0, |l| l.self_attn.current_seq_len())
    }

    pub fn is_empty(&self) -> bool {
        self.seq_len() == 0
    }

    /// Rolls every layer back to `seq_len` positions. Encoder states cached
    /// by a rolled back first step are dropped too.
    pub fn truncate(&mut self, seq_len: usize) {
        for layer in self.layers.iter_mut() {
            layer.self_attn.truncate(seq_len);
            if seq_len == 0 {
                layer.cross_attn = None
            }
        }
    }

    /// Re-indexes every cached tensor along the batch axis, e.g. after a beam
    /// search step selected `beam_idx`.
    pub fn reorder(&mut self, beam_idx: &Tensor) -> Result<()> {
        if self.is_empty() {
            tracing::warn!("you might want to consider setting `use_cache=True` to speed up decoding");
            return Ok(());
        }
        let arity = self.layers[0].num_states();
        for layer in self.layers.iter_mut() {
            if layer.num_states() != arity {
                candle::bail!(
                    "reordered layer cache holds {} states, expected {arity}",
                    layer.num_states()
                )
            }
            layer.reorder(beam_idx)?
        }
        Ok(())
    }

    /// The cached tensors of every layer, `[self_k, self_v, (cross_k, cross_v)]`.
    pub fn layer_states(&self) -> Result<Vec<Vec<Tensor>>> {
        self.layers.iter().map(|l| l.states()).collect()
    }

    pub fn try_clone(&self) -> Result<Self> {
        let layers = self
            .layers
            .iter()
            .map(|l| l.try_clone())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }
}
