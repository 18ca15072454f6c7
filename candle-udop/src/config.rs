// UDOP configuration
// https://github.com/huggingface/transformers/blob/main/src/transformers/models/udop/configuration_udop.py

use candle::Result;
use candle_nn::Activation;
use serde::Deserialize;

use crate::bias::validate_buckets;

fn default_relative_attention_num_buckets() -> usize {
    32
}

fn default_relative_attention_max_distance() -> usize {
    128
}

fn default_true() -> bool {
    true
}

fn default_feed_forward_proj() -> String {
    "relu".to_string()
}

fn default_max_2d_position_embeddings() -> usize {
    1024
}

fn default_image_size() -> usize {
    224
}

fn default_patch_size() -> usize {
    16
}

fn default_num_channels() -> usize {
    3
}

fn default_relative_bias_args() -> Vec<RelativeBiasArgs> {
    vec![
        RelativeBiasArgs::new(BiasKind::Sequence),
        RelativeBiasArgs::new(BiasKind::Horizontal),
        RelativeBiasArgs::new(BiasKind::Vertical),
    ]
}

/// The distance a relative bias measures between two sequence elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BiasKind {
    /// Distance in the token sequence.
    #[serde(rename = "1d", alias = "sequence")]
    Sequence,
    /// Distance between the horizontal midpoints of the two boxes.
    #[serde(rename = "horizontal")]
    Horizontal,
    /// Distance between the vertical midpoints of the two boxes.
    #[serde(rename = "vertical")]
    Vertical,
}

impl BiasKind {
    pub fn is_layout(&self) -> bool {
        !matches!(self, Self::Sequence)
    }

    fn default_scaling_factor(&self) -> f64 {
        match self {
            Self::Sequence => 1.0,
            Self::Horizontal | Self::Vertical => 100.0,
        }
    }

    fn default_max_distance(&self) -> usize {
        match self {
            Self::Sequence => 128,
            Self::Horizontal | Self::Vertical => 100,
        }
    }
}

/// One entry of `relative_bias_args`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelativeBiasArgs {
    #[serde(rename = "type")]
    pub kind: BiasKind,
    #[serde(default)]
    pub num_heads: Option<usize>,
    #[serde(default = "default_relative_attention_num_buckets")]
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_true")]
    pub bidirectional: bool,
    #[serde(default)]
    pub scaling_factor: Option<f64>,
    #[serde(default)]
    pub max_distance: Option<usize>,
    #[serde(default)]
    pub augmentation: bool,
    #[serde(default)]
    pub prefix_bucket: bool,
    /// The stored table predates the prefix buckets and must be migrated on load.
    #[serde(default)]
    pub expand: bool,
}

impl RelativeBiasArgs {
    pub fn new(kind: BiasKind) -> Self {
        Self {
            kind,
            num_heads: None,
            relative_attention_num_buckets: default_relative_attention_num_buckets(),
            bidirectional: true,
            scaling_factor: None,
            max_distance: None,
            augmentation: false,
            prefix_bucket: false,
            expand: false,
        }
    }

    pub fn scaling_factor(&self) -> f64 {
        self.scaling_factor
            .unwrap_or_else(|| self.kind.default_scaling_factor())
    }

    pub fn max_distance(&self) -> usize {
        self.max_distance
            .unwrap_or_else(|| self.kind.default_max_distance())
    }

    pub fn validate(&self, model_num_heads: usize) -> Result<()> {
        if let Some(num_heads) = self.num_heads {
            if num_heads != model_num_heads {
                candle::bail!(
                    "number of heads in {:?} bias ({num_heads}) must match the model ({model_num_heads})",
                    self.kind
                )
            }
        }
        let scaling_factor = self.scaling_factor();
        match self.kind {
            BiasKind::Sequence if scaling_factor != 1.0 => {
                candle::bail!("no need to scale 1d features, got scaling factor {scaling_factor}")
            }
            BiasKind::Horizontal | BiasKind::Vertical if scaling_factor <= 1.0 => {
                candle::bail!(
                    "{:?} bias needs to scale the box coordinates out of the (0,1) range, got scaling factor {scaling_factor}",
                    self.kind
                )
            }
            _ => {}
        }
        validate_buckets(
            self.relative_attention_num_buckets,
            self.bidirectional,
            self.max_distance(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub d_model: usize,
    pub d_kv: usize,
    pub d_ff: usize,
    pub num_layers: usize,
    #[serde(default)]
    pub num_decoder_layers: Option<usize>,
    pub num_heads: usize,
    #[serde(default = "default_relative_attention_num_buckets")]
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_relative_attention_max_distance")]
    pub relative_attention_max_distance: usize,
    #[serde(default = "default_relative_bias_args")]
    pub relative_bias_args: Vec<RelativeBiasArgs>,
    pub dropout_rate: f64,
    pub layer_norm_epsilon: f64,
    #[serde(default)]
    pub initializer_factor: f64,
    #[serde(default = "default_feed_forward_proj")]
    pub feed_forward_proj: String,
    #[serde(default = "default_true")]
    pub is_encoder_decoder: bool,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default)]
    pub eos_token_id: u32,
    #[serde(default)]
    pub decoder_start_token_id: u32,
    #[serde(default = "default_max_2d_position_embeddings")]
    pub max_2d_position_embeddings: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    #[serde(default = "default_true")]
    pub tie_word_embeddings: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::udop_large()
    }
}

impl Config {
    // https://huggingface.co/microsoft/udop-large/blob/main/config.json
    pub fn udop_large() -> Self {
        Self {
            vocab_size: 33201,
            d_model: 1024,
            d_kv: 64,
            d_ff: 4096,
            num_layers: 24,
            num_decoder_layers: Some(24),
            num_heads: 16,
            relative_attention_num_buckets: 32,
            relative_attention_max_distance: 128,
            relative_bias_args: default_relative_bias_args(),
            dropout_rate: 0.1,
            layer_norm_epsilon: 1e-6,
            initializer_factor: 1.0,
            feed_forward_proj: "relu".to_string(),
            is_encoder_decoder: true,
            use_cache: true,
            pad_token_id: 0,
            eos_token_id: 1,
            decoder_start_token_id: 0,
            max_2d_position_embeddings: 1024,
            image_size: 224,
            patch_size: 16,
            num_channels: 3,
            tie_word_embeddings: true,
        }
    }

    /// A small configuration with a 4x4 patch grid, handy for tests.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 64,
            d_model: 32,
            d_kv: 8,
            d_ff: 64,
            num_layers: 2,
            num_decoder_layers: Some(2),
            num_heads: 4,
            dropout_rate: 0.0,
            max_2d_position_embeddings: 64,
            image_size: 32,
            patch_size: 8,
            ..Self::udop_large()
        }
    }

    pub fn decoder_layers(&self) -> usize {
        self.num_decoder_layers.unwrap_or(self.num_layers)
    }

    /// Number of patches along one side of the image grid.
    pub fn num_patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn num_patches(&self) -> usize {
        self.num_patches_per_side() * self.num_patches_per_side()
    }

    pub fn is_gated_act(&self) -> bool {
        self.feed_forward_proj.starts_with("gated-")
    }

    /// The activation of the feed-forward block, parsed from `feed_forward_proj`.
    pub fn dense_act_fn(&self) -> Result<Activation> {
        let parts: Vec<&str> = self.feed_forward_proj.split('-').collect();
        let (gated, act) = match parts.as_slice() {
            [act] => (false, *act),
            ["gated", act] => (true, *act),
            _ => candle::bail!(
                "`feed_forward_proj`: {} is not a valid activation function of the dense layer, use `gated-{{ACT_FN}}` or `{{ACT_FN}}`",
                self.feed_forward_proj
            ),
        };
        let act = match act {
            "relu" => Activation::Relu,
            // "gated-gelu" has always meant the tanh approximation.
            "gelu" if gated => Activation::NewGelu,
            "gelu" => Activation::Gelu,
            "gelu_new" => Activation::NewGelu,
            "silu" | "swish" => Activation::Silu,
            act => candle::bail!("unsupported feed-forward activation {act}"),
        };
        Ok(act)
    }

    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
            candle::bail!(
                "patch size {} does not divide image size {}",
                self.patch_size,
                self.image_size
            )
        }
        self.dense_act_fn()?;
        // Decoder self-attention buckets are one-directional.
        validate_buckets(
            self.relative_attention_num_buckets,
            false,
            self.relative_attention_max_distance,
        )?;
        for args in self.relative_bias_args.iter() {
            args.validate(self.num_heads)?
        }
        Ok(())
    }
}
