//! UDOP document model: a T5-style encoder-decoder over text tokens, their
//! page layout boxes and the page image.
//!
//! The encoder adds to every token the embedding of the image patch under its
//! box, appends the patches no token covers, and biases self-attention with
//! sequence and 2-D layout distances. The decoder is a plain T5 decoder with
//! an incremental key/value cache.
pub mod attention;
pub mod bias;
pub mod block;
pub mod cache;
pub mod config;
pub mod fusion;
pub mod layers;
pub mod mask;
pub mod model;
pub mod patch;
pub mod stack;
pub mod with_tracing;

pub use cache::{DecoderCache, KvBuffer, LayerCache};
pub use config::{BiasKind, Config, RelativeBiasArgs};
pub use model::{
    cross_entropy_ignore_index, shift_tokens_right, DecoderInput, DocumentInput,
    Seq2SeqLmOutput, Seq2SeqModelOutput, UdopEncoderModel, UdopForConditionalGeneration,
    UdopModel, IGNORE_INDEX,
};
pub use stack::{ForwardOptions, StackOutput};
