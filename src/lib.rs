// =============================================
// lib.rs
// =============================================
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod math;
pub mod presets;

pub mod feed_forward;
pub mod layer_norm;
pub mod layer_pos_encoding;
pub mod layer_position;
pub mod layers;
pub mod multi_head_attention;

pub mod model;
pub mod reversible;
pub mod transformer_block;

// Re-export key structs for easier access
pub use config::{BlockConfig, DecoderConfig, EncoderConfig, RuntimeConfig};
pub use error::{ConfigError, Error, Result, ShapeError};
pub use layer_pos_encoding::Sequence;
pub use layer_position::LayerPosition;
pub use layers::Layer;
pub use model::{EncoderStack, Stack};
pub use multi_head_attention::AttentionMask;
pub use reversible::{CouplingPair, ReversibleSequence, ReversibleTape};
