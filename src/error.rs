// error.rs
// ============================================================================
// Hinweis: Fehlertypen der Bibliothek. Konfigurationsfehler werden beim
//          Aufbau des Stacks erkannt, Shape-Fehler waehrend des Forward-Passes.
// ============================================================================

use thiserror::Error;

/// Abgelehnte Block-Konfiguration; tritt vor dem Bau jeder Schicht auf.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("record {index}: unknown block_type `{block_type}` (expected `encoder` or `decoder`)")]
    UnknownBlockType { index: usize, block_type: String },

    #[error("record {index}: {source}")]
    InvalidRecord {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("all encoder blocks need the same reversible setting, got {flags:?}")]
    MixedReversible { flags: Vec<bool> },

    #[error("record {index}: only encoder blocks can be reversible")]
    ReversibleDecoder { index: usize },

    #[error("record {index}: {reason}")]
    Invalid { index: usize, reason: String },

    #[error("stack configuration contains no blocks")]
    EmptyStack,
}

/// Tensor- oder Maskenform, mit der eine Schicht nicht arbeiten kann.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{layer}: {detail}")]
pub struct ShapeError {
    pub layer: String,
    pub detail: String,
}

impl ShapeError {
    pub fn new(layer: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

pub type Result<T> = std::result::Result<T, Error>;
