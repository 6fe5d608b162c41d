// ===========================================================================
//  Datei:        model.rs
//  Modul:        Stack (Aufbau + Forward)
// ---------------------------------------------------------------------------
//  Beschreibung:
//      Stack::build* expandiert eine RuntimeConfig in Encoder- und
//      Decoder-Bloecke. Reversible Encoder werden in Kopplungspaare zerlegt;
//      die erste gefundene Positionskodierung wird am Stack gespeichert,
//      eine abschliessende LayerNorm wandert in den G-Zweig ihres Paares.
//      Bei vorhandenen Decodern werden alle Gewichte mit Rang > 1 per
//      Xavier-uniform neu initialisiert.
//
//      Stack::forward* berechnet zuerst das Encoder-Memory (sequenziell oder
//      reversibel mit Mittelwert der beiden Haelften) und laesst dann die
//      Decoder ueber dem Ziel (oder einer Kopie der Quelle) laufen.
// ===========================================================================

use ndarray::{Array3, ArrayViewD, ArrayViewMutD};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{BlockConfig, RuntimeConfig};
use crate::error::ShapeError;
use crate::layer_pos_encoding::{PositionEncoding, Sequence};
use crate::layer_position::LayerPosition;
use crate::layers::Layer;
use crate::math::{concat_features, split_features, xavier_uniform};
use crate::multi_head_attention::AttentionMask;
use crate::reversible::ReversibleSequence;
use crate::transformer_block::{DecoderBlock, EncoderBlock};

/// Encoder-Seite eines [`Stack`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EncoderStack {
    Sequential(Vec<EncoderBlock>),
    Reversible {
        sequence: ReversibleSequence,
        /// Erste beim Aufbau gefundene Positionskodierung ("first wins").
        pose_encoding: Option<PositionEncoding>,
    },
}

impl EncoderStack {
    pub fn is_empty(&self) -> bool {
        match self {
            EncoderStack::Sequential(blocks) => blocks.is_empty(),
            EncoderStack::Reversible { sequence, .. } => sequence.is_empty(),
        }
    }
}

/// Vollstaendig aufgebautes Encoder/Decoder-Modell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stack {
    pub encoder: EncoderStack,
    pub decoders: Vec<DecoderBlock>,
}

impl Stack {
    /// Aufbau mit frisch geseedetem Generator.
    pub fn build(config: &RuntimeConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(rand::rng().random());
        Self::build_with_rng(config, &mut rng)
    }

    /// Alle Gewichte aus `StdRng::seed_from_u64(i_seed)`. Zwei Konfigurationen,
    /// die sich nur in `reversible` unterscheiden, erhalten identische Gewichte.
    pub fn build_seeded(config: &RuntimeConfig, i_seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(i_seed);
        Self::build_with_rng(config, &mut rng)
    }

    pub fn build_with_rng(config: &RuntimeConfig, rng: &mut StdRng) -> Self {
        let mut v_encoders: Vec<EncoderBlock> = Vec::new();
        let mut v_pairs = Vec::new();
        let mut pose_encoding: Option<PositionEncoding> = None;
        let mut v_decoders: Vec<DecoderBlock> = Vec::new();
        let mut b_reversible = false;

        for (i_record, block_config) in config.blocks().iter().enumerate() {
            let i_layers = block_config.num_layers();
            for i in 0..i_layers {
                let position = LayerPosition::for_index(i, i_layers);
                match block_config {
                    BlockConfig::Encoder(cfg) => {
                        let block = EncoderBlock::from_config(cfg, position, rng);
                        debug!(
                            record = i_record,
                            layer = i,
                            first = position.is_first(),
                            last = position.is_last(),
                            reversible = cfg.reversible,
                            "built encoder block"
                        );
                        if cfg.reversible {
                            b_reversible = true;
                            let (pair, pose) = block.into_coupling_pair();
                            if pose_encoding.is_none() {
                                pose_encoding = pose;
                            }
                            v_pairs.push(pair);
                        } else {
                            v_encoders.push(block);
                        }
                    }
                    BlockConfig::Decoder(cfg) => {
                        v_decoders.push(DecoderBlock::from_config(cfg, position, rng));
                        debug!(
                            record = i_record,
                            layer = i,
                            first = position.is_first(),
                            last = position.is_last(),
                            "built decoder block"
                        );
                    }
                }
            }
        }

        let encoder = if b_reversible {
            EncoderStack::Reversible {
                sequence: ReversibleSequence::new(v_pairs),
                pose_encoding,
            }
        } else {
            EncoderStack::Sequential(v_encoders)
        };

        let mut stack = Stack {
            encoder,
            decoders: v_decoders,
        };

        if !stack.decoders.is_empty() {
            let mut i_reset = 0usize;
            for m_param in stack.parameters_mut() {
                if m_param.ndim() > 1 {
                    i_reset += 1;
                }
                xavier_uniform(m_param, rng);
            }
            debug!(tensors = i_reset, "xavier-uniform reset");
        }

        info!(
            reversible = b_reversible,
            encoder_layers = stack.encoder_len(),
            decoder_layers = stack.decoders.len(),
            parameters = stack.parameter_count(),
            "stack assembled"
        );
        stack
    }

    pub fn is_reversible(&self) -> bool {
        matches!(self.encoder, EncoderStack::Reversible { .. })
    }

    /// Anzahl Encoder-Schichten (Bloecke bzw. Kopplungspaare).
    pub fn encoder_len(&self) -> usize {
        match &self.encoder {
            EncoderStack::Sequential(blocks) => blocks.len(),
            EncoderStack::Reversible { sequence, .. } => sequence.len(),
        }
    }

    /// Sequenzielle Encoder-Bloecke; leer bei reversiblem Encoder.
    pub fn encoder_blocks(&self) -> &[EncoderBlock] {
        match &self.encoder {
            EncoderStack::Sequential(blocks) => blocks,
            EncoderStack::Reversible { .. } => &[],
        }
    }

    pub fn decoder_blocks(&self) -> &[DecoderBlock] {
        &self.decoders
    }

    pub fn reversible_sequence(&self) -> Option<&ReversibleSequence> {
        match &self.encoder {
            EncoderStack::Reversible { sequence, .. } => Some(sequence),
            EncoderStack::Sequential(_) => None,
        }
    }

    /// Forward mit Generator aus dem Thread-RNG.
    pub fn forward(
        &self,
        source: &Sequence,
        target: Option<&Sequence>,
        encoder_mask: Option<&AttentionMask>,
        decoder_mask: Option<&AttentionMask>,
    ) -> Result<Array3<f32>, ShapeError> {
        let mut rng = StdRng::seed_from_u64(rand::rng().random());
        self.forward_with_rng(source, target, encoder_mask, decoder_mask, &mut rng)
    }

    pub fn forward_with_rng(
        &self,
        source: &Sequence,
        target: Option<&Sequence>,
        encoder_mask: Option<&AttentionMask>,
        decoder_mask: Option<&AttentionMask>,
        rng: &mut StdRng,
    ) -> Result<Array3<f32>, ShapeError> {
        let (i_batch, i_seq) = source.batch_and_len();
        debug!(batch = i_batch, seq = i_seq, "forward");

        let memory = self.encode(source, encoder_mask, rng)?;

        if self.decoders.is_empty() {
            return memory.ok_or_else(|| ShapeError::new("Stack", "stack has neither encoder nor decoder blocks"));
        }

        let mut current = target.unwrap_or(source).clone();
        for block in &self.decoders {
            let m_out = block.forward(&current, memory.as_ref(), decoder_mask, rng)?;
            current = Sequence::Embedded(m_out);
        }
        match current {
            Sequence::Embedded(m) => Ok(m),
            Sequence::Tokens(_) => Err(ShapeError::new("Stack", "decoder produced no embedded output")),
        }
    }

    /// Encoder-Memory, `None` ohne Encoder-Schichten. Reversibel ist der
    /// Mittelwert der beiden Haelften der letzte Schritt.
    pub fn encode(
        &self,
        source: &Sequence,
        mask: Option<&AttentionMask>,
        rng: &mut StdRng,
    ) -> Result<Option<Array3<f32>>, ShapeError> {
        match &self.encoder {
            EncoderStack::Sequential(blocks) => {
                let Some((first, rest)) = blocks.split_first() else {
                    return Ok(None);
                };
                let mut m_memory = first.forward(source, mask, rng)?;
                for block in rest {
                    let x = Sequence::Embedded(m_memory);
                    m_memory = block.forward(&x, mask, rng)?;
                }
                Ok(Some(m_memory))
            }
            EncoderStack::Reversible { sequence, pose_encoding } => {
                let m_x = match pose_encoding {
                    Some(pose) => pose.forward(source)?,
                    None => source.embedded("ReversibleSequence")?.into_owned(),
                };
                let m_doubled = concat_features(&m_x, &m_x, "ReversibleSequence")?;
                let m_out = sequence.forward(&m_doubled, mask, rng)?;
                let (m_a, m_b) = split_features(&m_out, "ReversibleSequence")?;
                Ok(Some((m_a + &m_b) * 0.5))
            }
        }
    }
}

impl Layer for Stack {
    fn layer_type(&self) -> &str {
        "Stack"
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut v = Vec::new();
        match &self.encoder {
            EncoderStack::Sequential(blocks) => v.extend(blocks.iter().flat_map(|b| b.parameters())),
            EncoderStack::Reversible { sequence, pose_encoding } => {
                if let Some(p) = pose_encoding {
                    v.extend(p.parameters());
                }
                v.extend(sequence.parameters());
            }
        }
        v.extend(self.decoders.iter().flat_map(|b| b.parameters()));
        v
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut v = Vec::new();
        match &mut self.encoder {
            EncoderStack::Sequential(blocks) => v.extend(blocks.iter_mut().flat_map(|b| b.parameters_mut())),
            EncoderStack::Reversible { sequence, pose_encoding } => {
                if let Some(p) = pose_encoding {
                    v.extend(p.parameters_mut());
                }
                v.extend(sequence.parameters_mut());
            }
        }
        v.extend(self.decoders.iter_mut().flat_map(|b| b.parameters_mut()));
        v
    }

    fn set_train_mode(&mut self, b_train: bool) {
        match &mut self.encoder {
            EncoderStack::Sequential(blocks) => blocks.iter_mut().for_each(|b| b.set_train_mode(b_train)),
            EncoderStack::Reversible { sequence, .. } => sequence.set_train_mode(b_train),
        }
        for block in &mut self.decoders {
            block.set_train_mode(b_train);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets::Preset;
    use ndarray::Array2;

    fn small() -> Preset {
        Preset {
            dim_model: 16,
            num_heads: 2,
            seq_len: 8,
            vocab_size: 20,
            encoder_layers: 2,
            decoder_layers: 1,
            ..Preset::default()
        }
    }

    #[test]
    fn decoder_presence_triggers_xavier_reset() {
        let cfg = RuntimeConfig::from_records(small().encoder_decoder_records(false)).unwrap();
        let stack = Stack::build_seeded(&cfg, 1);
        let f_bound = (6.0f32 / (16.0 + 16.0)).sqrt();
        let block = &stack.encoder_blocks()[0];
        let v_params = block.attention.parameters();
        assert!(v_params[0].iter().all(|v| v.abs() <= f_bound));
        assert!(stack.parameters().iter().filter(|p| p.ndim() == 1).all(|p| {
            p.iter().all(|&v| v == 0.0 || v == 1.0)
        }));
    }

    #[test]
    fn reversible_keeps_pose_and_moves_terminal_norm_into_g() {
        let preset = Preset {
            encoder_layers: 3,
            ..small()
        };
        let cfg = RuntimeConfig::from_records(preset.encoder_records(true)).unwrap();
        let stack = Stack::build_seeded(&cfg, 2);
        match &stack.encoder {
            EncoderStack::Reversible { sequence, pose_encoding } => {
                assert_eq!(sequence.len(), 3);
                assert!(pose_encoding.is_some());
                let v_norms: Vec<bool> = sequence.pairs().iter().map(|p| p.g.final_norm.is_some()).collect();
                assert_eq!(v_norms, vec![false, false, true]);
            }
            EncoderStack::Sequential(_) => panic!("expected reversible encoder"),
        }
        assert!(stack.encoder_blocks().is_empty());
    }

    #[test]
    fn decoder_only_stack_runs_without_memory() {
        let preset = Preset {
            decoder_layers: 2,
            ..small()
        };
        let records: Vec<_> = preset
            .encoder_decoder_records(false)
            .into_iter()
            .skip(1)
            .collect();
        let cfg = RuntimeConfig::from_records(records).unwrap();
        let mut stack = Stack::build_seeded(&cfg, 3);
        stack.set_train_mode(false);
        let source = Sequence::Tokens(Array2::from_shape_fn((2, 5), |(b, s)| (b * 3 + s) % 20));
        let mut rng = StdRng::seed_from_u64(0);
        let m_out = stack.forward_with_rng(&source, None, None, None, &mut rng).unwrap();
        assert_eq!(m_out.dim(), (2, 5, 16));
        assert_eq!(stack.encoder_len(), 0);
    }
}
