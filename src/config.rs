// src/config.rs
// Deklarative Block-Konfiguration: Einlesen der ungetypten Records,
// Typisierung per serde und stackweite Pruefungen (reversible-Konsistenz).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::feed_forward::Activation;
use crate::layers::LayerNormStyle;

// ---------------------------------------------------------------------------
// Sub-Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEncodingKind {
    Vocab,
    Sine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PositionEncodingConfig {
    pub name: PositionEncodingKind,
    pub dim_model: usize,
    #[serde(default)]
    pub seq_len: Option<usize>,
    #[serde(default)]
    pub vocab_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    ScaledDotProduct,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttentionConfig {
    pub name: AttentionKind,
    #[serde(default)]
    pub dropout: f32,
    #[serde(default)]
    pub causal: bool,
    /// Wird akzeptiert, von Scaled-Dot-Product-Attention aber nicht genutzt.
    #[serde(default)]
    pub seq_len: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultiHeadConfig {
    pub num_heads: usize,
    pub dim_model: usize,
    #[serde(default)]
    pub residual_dropout: f32,
    pub attention: AttentionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedForwardKind {
    #[serde(rename = "MLP")]
    Mlp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedForwardConfig {
    pub name: FeedForwardKind,
    pub dim_model: usize,
    #[serde(default)]
    pub dropout: f32,
    #[serde(default)]
    pub activation: Activation,
    pub hidden_layer_multiplier: usize,
}

// ---------------------------------------------------------------------------
// Block-Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncoderConfig {
    pub dim_model: usize,
    pub num_layers: usize,
    #[serde(default)]
    pub reversible: bool,
    #[serde(default)]
    pub position_encoding_config: Option<PositionEncodingConfig>,
    pub multi_head_config: MultiHeadConfig,
    pub feedforward_config: FeedForwardConfig,
    #[serde(default)]
    pub layer_norm_style: LayerNormStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecoderConfig {
    pub dim_model: usize,
    pub num_layers: usize,
    #[serde(default)]
    pub position_encoding_config: Option<PositionEncodingConfig>,
    pub multi_head_config_masked: MultiHeadConfig,
    pub multi_head_config_cross: MultiHeadConfig,
    pub feedforward_config: FeedForwardConfig,
    #[serde(default)]
    pub layer_norm_style: LayerNormStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlockConfig {
    Encoder(EncoderConfig),
    Decoder(DecoderConfig),
}

impl BlockConfig {
    pub fn dim_model(&self) -> usize {
        match self {
            BlockConfig::Encoder(c) => c.dim_model,
            BlockConfig::Decoder(c) => c.dim_model,
        }
    }

    pub fn num_layers(&self) -> usize {
        match self {
            BlockConfig::Encoder(c) => c.num_layers,
            BlockConfig::Decoder(c) => c.num_layers,
        }
    }

    /// Feldpruefungen; der Fehlertext wird zu `ConfigError::Invalid`.
    pub fn validate(&self) -> Result<(), String> {
        let i_dim = self.dim_model();
        if i_dim == 0 {
            return Err("dim_model must be positive".into());
        }
        if self.num_layers() == 0 {
            return Err("num_layers must be positive".into());
        }

        let (pose, v_heads, ff) = match self {
            BlockConfig::Encoder(c) => (
                c.position_encoding_config.as_ref(),
                vec![("multi_head_config", &c.multi_head_config)],
                &c.feedforward_config,
            ),
            BlockConfig::Decoder(c) => (
                c.position_encoding_config.as_ref(),
                vec![
                    ("multi_head_config_masked", &c.multi_head_config_masked),
                    ("multi_head_config_cross", &c.multi_head_config_cross),
                ],
                &c.feedforward_config,
            ),
        };

        if let Some(pose) = pose {
            check_dim("position_encoding_config", pose.dim_model, i_dim)?;
            if pose.name == PositionEncodingKind::Vocab {
                match (pose.seq_len, pose.vocab_size) {
                    (Some(s), Some(v)) if s > 0 && v > 0 => {}
                    _ => return Err("vocab position encoding needs positive seq_len and vocab_size".into()),
                }
            }
        }

        for (s_name, mh) in v_heads {
            check_dim(s_name, mh.dim_model, i_dim)?;
            if mh.num_heads == 0 || i_dim % mh.num_heads != 0 {
                return Err(format!(
                    "{s_name}: num_heads {} must be positive and divide dim_model {i_dim}",
                    mh.num_heads
                ));
            }
            check_dropout(&format!("{s_name}.residual_dropout"), mh.residual_dropout)?;
            check_dropout(&format!("{s_name}.attention.dropout"), mh.attention.dropout)?;
        }

        check_dim("feedforward_config", ff.dim_model, i_dim)?;
        check_dropout("feedforward_config.dropout", ff.dropout)?;
        if ff.hidden_layer_multiplier == 0 {
            return Err("feedforward_config.hidden_layer_multiplier must be positive".into());
        }
        Ok(())
    }
}

fn check_dim(s_name: &str, i_got: usize, i_want: usize) -> Result<(), String> {
    if i_got != i_want {
        return Err(format!("{s_name}.dim_model is {i_got}, block dim_model is {i_want}"));
    }
    Ok(())
}

fn check_dropout(s_name: &str, f_rate: f32) -> Result<(), String> {
    if !(0.0..1.0).contains(&f_rate) {
        return Err(format!("{s_name} must lie in [0, 1), got {f_rate}"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

/// Geordnete, validierte Liste von Block-Konfigurationen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeConfig {
    blocks: Vec<BlockConfig>,
}

impl RuntimeConfig {
    /// Prueft jeden Block und die stackweite Reversible-Bedingung.
    pub fn new(blocks: Vec<BlockConfig>) -> Result<Self, ConfigError> {
        if blocks.is_empty() {
            return Err(ConfigError::EmptyStack);
        }
        for (index, block) in blocks.iter().enumerate() {
            block.validate().map_err(|reason| ConfigError::Invalid { index, reason })?;
        }

        let flags: Vec<bool> = blocks
            .iter()
            .filter_map(|b| match b {
                BlockConfig::Encoder(c) => Some(c.reversible),
                BlockConfig::Decoder(_) => None,
            })
            .collect();
        if flags.windows(2).any(|w| w[0] != w[1]) {
            return Err(ConfigError::MixedReversible { flags });
        }

        Ok(Self { blocks })
    }

    /// Typisiert Records ueber ihr `block_type`-Tag und ruft dann [`RuntimeConfig::new`].
    pub fn from_records<I>(records: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = Value>,
    {
        let blocks = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| parse_record(index, record))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(blocks)
    }

    pub fn blocks(&self) -> &[BlockConfig] {
        &self.blocks
    }

    /// True, wenn die Encoder-Records reversible Ausfuehrung verlangen.
    pub fn is_reversible(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, BlockConfig::Encoder(c) if c.reversible))
    }

    /// Kopie mit `reversible = b_reversible` fuer jeden Encoder.
    pub fn with_reversible(&self, b_reversible: bool) -> Self {
        let blocks = self
            .blocks
            .iter()
            .cloned()
            .map(|b| match b {
                BlockConfig::Encoder(mut c) => {
                    c.reversible = b_reversible;
                    BlockConfig::Encoder(c)
                }
                other => other,
            })
            .collect();
        Self { blocks }
    }
}

fn parse_record(index: usize, record: Value) -> Result<BlockConfig, ConfigError> {
    let Value::Object(mut map) = record else {
        return Err(ConfigError::Invalid {
            index,
            reason: "block record must be an object".into(),
        });
    };

    let block_type = match map.remove("block_type") {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => {
            return Err(ConfigError::Invalid {
                index,
                reason: "missing block_type".into(),
            })
        }
    };

    match block_type.as_str() {
        "encoder" => typed(index, map).map(BlockConfig::Encoder),
        "decoder" => {
            match map.remove("reversible") {
                None | Some(Value::Null) | Some(Value::Bool(false)) => {}
                Some(Value::Bool(true)) => return Err(ConfigError::ReversibleDecoder { index }),
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        index,
                        reason: format!("reversible must be a boolean, got {other}"),
                    })
                }
            }
            typed(index, map).map(BlockConfig::Decoder)
        }
        _ => Err(ConfigError::UnknownBlockType { index, block_type }),
    }
}

fn typed<T: serde::de::DeserializeOwned>(index: usize, map: Map<String, Value>) -> Result<T, ConfigError> {
    serde_json::from_value(Value::Object(map)).map_err(|source| ConfigError::InvalidRecord { index, source })
}
