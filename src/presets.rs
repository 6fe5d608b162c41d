// src/presets.rs
// Vorgefertigte Block-Records (Encoder bzw. Encoder + Decoder) fuer Demo
// und Tests. Die Standardwerte entsprechen dem 20 x 512-Szenario.
use serde_json::{json, Value};

pub const BATCH: usize = 20;
pub const SEQ_LEN: usize = 512;
pub const EMBEDDING_DIM: usize = 384;
pub const HEADS: usize = 4;
pub const VOCAB_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub dim_model: usize,
    pub num_heads: usize,
    pub seq_len: usize,
    pub vocab_size: usize,
    pub encoder_layers: usize,
    pub decoder_layers: usize,
    pub hidden_layer_multiplier: usize,
    pub dropout: f32,
    pub causal: bool,
}

impl Default for Preset {
    fn default() -> Self {
        Preset {
            dim_model: EMBEDDING_DIM,
            num_heads: HEADS,
            seq_len: SEQ_LEN,
            vocab_size: VOCAB_SIZE,
            encoder_layers: 3,
            decoder_layers: 2,
            hidden_layer_multiplier: 4,
            dropout: 0.0,
            causal: true,
        }
    }
}

impl Preset {
    fn position_encoding(&self) -> Value {
        json!({
            "name": "vocab",
            "seq_len": self.seq_len,
            "vocab_size": self.vocab_size,
            "dim_model": self.dim_model,
        })
    }

    fn multi_head(&self) -> Value {
        json!({
            "num_heads": self.num_heads,
            "residual_dropout": self.dropout,
            "dim_model": self.dim_model,
            "attention": {
                "name": "scaled_dot_product",
                "dropout": self.dropout,
                "causal": self.causal,
                "seq_len": self.seq_len,
            },
        })
    }

    fn feedforward(&self) -> Value {
        json!({
            "name": "MLP",
            "dropout": self.dropout,
            "activation": "relu",
            "hidden_layer_multiplier": self.hidden_layer_multiplier,
            "dim_model": self.dim_model,
        })
    }

    pub fn encoder_record(&self, b_reversible: bool) -> Value {
        json!({
            "reversible": b_reversible,
            "block_type": "encoder",
            "dim_model": self.dim_model,
            "position_encoding_config": self.position_encoding(),
            "num_layers": self.encoder_layers,
            "multi_head_config": self.multi_head(),
            "feedforward_config": self.feedforward(),
        })
    }

    pub fn decoder_record(&self) -> Value {
        json!({
            "block_type": "decoder",
            "dim_model": self.dim_model,
            "position_encoding_config": self.position_encoding(),
            "num_layers": self.decoder_layers,
            "multi_head_config_masked": self.multi_head(),
            "multi_head_config_cross": self.multi_head(),
            "feedforward_config": self.feedforward(),
        })
    }

    pub fn encoder_records(&self, b_reversible: bool) -> Vec<Value> {
        vec![self.encoder_record(b_reversible)]
    }

    pub fn encoder_decoder_records(&self, b_reversible: bool) -> Vec<Value> {
        vec![self.encoder_record(b_reversible), self.decoder_record()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    #[test]
    fn default_preset_validates() {
        for b_reversible in [false, true] {
            let cfg = RuntimeConfig::from_records(Preset::default().encoder_decoder_records(b_reversible)).unwrap();
            assert_eq!(cfg.blocks().len(), 2);
            assert_eq!(cfg.is_reversible(), b_reversible);
        }
    }
}
