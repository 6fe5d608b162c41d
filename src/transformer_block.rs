// src/transformer_block.rs
// Encoder- und Decoder-Block: Attention und Feed-Forward in Norm-Huellen,
// Positionskodierung nur im ersten, abschliessende LayerNorm nur im letzten
// Block eines Pre-Norm-Stacks.
use std::borrow::Cow;

use ndarray::{Array3, ArrayViewD, ArrayViewMutD};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::config::{DecoderConfig, EncoderConfig, FeedForwardConfig, MultiHeadConfig, PositionEncodingConfig, PositionEncodingKind};
use crate::error::ShapeError;
use crate::feed_forward::FeedForward;
use crate::layer_norm::LayerNorm;
use crate::layer_pos_encoding::{PositionEncoding, Sequence, SineEncoding, VocabEmbedding};
use crate::layer_position::LayerPosition;
use crate::layers::{Layer, LayerNormStyle, NormWrapper};
use crate::multi_head_attention::{AttentionMask, MultiHeadAttention};
use crate::reversible::{AttentionBranch, CouplingPair, FeedForwardBranch};

// ---------------------------------------------------------------------------
// Builder-Hilfen
// ---------------------------------------------------------------------------

fn build_pose(cfg: Option<&PositionEncodingConfig>, position: LayerPosition, rng: &mut StdRng) -> Option<PositionEncoding> {
    if !position.is_first() {
        return None;
    }
    let cfg = cfg?;
    Some(match cfg.name {
        PositionEncodingKind::Vocab => PositionEncoding::Vocab(VocabEmbedding::new(
            cfg.vocab_size.unwrap_or(0),
            cfg.seq_len.unwrap_or(0),
            cfg.dim_model,
            rng,
        )),
        PositionEncodingKind::Sine => PositionEncoding::Sine(SineEncoding { i_embed: cfg.dim_model }),
    })
}

fn build_attention(cfg: &MultiHeadConfig, rng: &mut StdRng) -> MultiHeadAttention {
    MultiHeadAttention::new(
        cfg.dim_model,
        cfg.num_heads,
        cfg.attention.dropout,
        cfg.residual_dropout,
        cfg.attention.causal,
        rng,
    )
}

fn build_feedforward(cfg: &FeedForwardConfig, rng: &mut StdRng) -> FeedForward {
    FeedForward::new(
        cfg.dim_model,
        cfg.dim_model * cfg.hidden_layer_multiplier,
        cfg.activation,
        cfg.dropout,
        rng,
    )
}

fn build_final_norm(i_embed: usize, style: LayerNormStyle, position: LayerPosition) -> Option<LayerNorm> {
    (style == LayerNormStyle::Pre && position.is_last()).then(|| LayerNorm::new(i_embed))
}

/// Token-Ids laufen durch die Positionskodierung, eingebettete Eingaben
/// bleiben unveraendert (oder erhalten eine Sinus-Kodierung).
fn embed<'a>(
    pose: Option<&PositionEncoding>,
    x: &'a Sequence,
    s_layer: &str,
) -> Result<Cow<'a, Array3<f32>>, ShapeError> {
    match pose {
        Some(p) => p.forward(x).map(Cow::Owned),
        None => x.embedded(s_layer),
    }
}

fn check_width(m_x: &Array3<f32>, i_embed: usize, s_layer: &str) -> Result<(), ShapeError> {
    if m_x.dim().2 != i_embed {
        return Err(ShapeError::new(
            s_layer,
            format!("expected feature width {i_embed}, got {:?}", m_x.dim()),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// EncoderBlock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderBlock {
    pub pose_encoding: Option<PositionEncoding>,
    pub attention_norm: NormWrapper,
    pub attention: MultiHeadAttention,
    pub feedforward_norm: NormWrapper,
    pub feedforward: FeedForward,
    pub final_norm: Option<LayerNorm>,
    pub layer_position: LayerPosition,
}

impl EncoderBlock {
    pub fn from_config(cfg: &EncoderConfig, position: LayerPosition, rng: &mut StdRng) -> Self {
        let pose_encoding = build_pose(cfg.position_encoding_config.as_ref(), position, rng);
        let attention = build_attention(&cfg.multi_head_config, rng);
        let feedforward = build_feedforward(&cfg.feedforward_config, rng);
        EncoderBlock {
            pose_encoding,
            attention_norm: NormWrapper::new(cfg.dim_model, cfg.layer_norm_style),
            attention,
            feedforward_norm: NormWrapper::new(cfg.dim_model, cfg.layer_norm_style),
            feedforward,
            final_norm: build_final_norm(cfg.dim_model, cfg.layer_norm_style, position),
            layer_position: position,
        }
    }

    pub fn dim(&self) -> usize {
        self.attention.i_embed
    }

    pub fn forward(
        &self,
        x: &Sequence,
        mask: Option<&AttentionMask>,
        rng: &mut StdRng,
    ) -> Result<Array3<f32>, ShapeError> {
        let m_x = embed(self.pose_encoding.as_ref(), x, self.layer_type())?;
        check_width(&m_x, self.dim(), self.layer_type())?;

        let m_h = self
            .attention_norm
            .residual(&m_x, |m| self.attention.forward(m, m, m, mask, rng))?;
        let m_out = self
            .feedforward_norm
            .residual(&m_h, |m| self.feedforward.forward(m, rng))?;

        match &self.final_norm {
            Some(norm) => norm.normalize(&m_out),
            None => Ok(m_out),
        }
    }

    /// Zerlegt den Block in sein Kopplungspaar und seine Positionskodierung.
    /// Die abschliessende Norm wandert in G.
    pub fn into_coupling_pair(self) -> (CouplingPair, Option<PositionEncoding>) {
        let pair = CouplingPair::new(
            AttentionBranch {
                norm: self.attention_norm,
                attention: self.attention,
            },
            FeedForwardBranch {
                norm: self.feedforward_norm,
                feedforward: self.feedforward,
                final_norm: self.final_norm,
            },
        );
        (pair, self.pose_encoding)
    }
}

impl Layer for EncoderBlock {
    fn layer_type(&self) -> &str {
        "EncoderBlock"
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut v = Vec::new();
        if let Some(p) = &self.pose_encoding {
            v.extend(p.parameters());
        }
        v.extend(self.attention_norm.parameters());
        v.extend(self.attention.parameters());
        v.extend(self.feedforward_norm.parameters());
        v.extend(self.feedforward.parameters());
        if let Some(n) = &self.final_norm {
            v.extend(n.parameters());
        }
        v
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut v = Vec::new();
        if let Some(p) = &mut self.pose_encoding {
            v.extend(p.parameters_mut());
        }
        v.extend(self.attention_norm.parameters_mut());
        v.extend(self.attention.parameters_mut());
        v.extend(self.feedforward_norm.parameters_mut());
        v.extend(self.feedforward.parameters_mut());
        if let Some(n) = &mut self.final_norm {
            v.extend(n.parameters_mut());
        }
        v
    }

    fn set_train_mode(&mut self, b_train: bool) {
        self.attention.set_train_mode(b_train);
        self.feedforward.set_train_mode(b_train);
    }
}

// ---------------------------------------------------------------------------
// DecoderBlock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderBlock {
    pub pose_encoding: Option<PositionEncoding>,
    pub self_attention_norm: NormWrapper,
    pub self_attention: MultiHeadAttention,
    pub cross_attention_norm: NormWrapper,
    pub cross_attention: MultiHeadAttention,
    pub feedforward_norm: NormWrapper,
    pub feedforward: FeedForward,
    pub final_norm: Option<LayerNorm>,
    pub layer_position: LayerPosition,
}

impl DecoderBlock {
    pub fn from_config(cfg: &DecoderConfig, position: LayerPosition, rng: &mut StdRng) -> Self {
        let pose_encoding = build_pose(cfg.position_encoding_config.as_ref(), position, rng);
        let self_attention = build_attention(&cfg.multi_head_config_masked, rng);
        let cross_attention = build_attention(&cfg.multi_head_config_cross, rng);
        let feedforward = build_feedforward(&cfg.feedforward_config, rng);
        let style = cfg.layer_norm_style;
        DecoderBlock {
            pose_encoding,
            self_attention_norm: NormWrapper::new(cfg.dim_model, style),
            self_attention,
            cross_attention_norm: NormWrapper::new(cfg.dim_model, style),
            cross_attention,
            feedforward_norm: NormWrapper::new(cfg.dim_model, style),
            feedforward,
            final_norm: build_final_norm(cfg.dim_model, style, position),
            layer_position: position,
        }
    }

    pub fn dim(&self) -> usize {
        self.self_attention.i_embed
    }

    /// `memory` ist die Encoder-Ausgabe; ohne sie entfaellt die
    /// Cross-Attention.
    pub fn forward(
        &self,
        target: &Sequence,
        memory: Option<&Array3<f32>>,
        mask: Option<&AttentionMask>,
        rng: &mut StdRng,
    ) -> Result<Array3<f32>, ShapeError> {
        let m_x = embed(self.pose_encoding.as_ref(), target, self.layer_type())?;
        check_width(&m_x, self.dim(), self.layer_type())?;

        let mut m_h = self
            .self_attention_norm
            .residual(&m_x, |m| self.self_attention.forward(m, m, m, mask, rng))?;
        if let Some(m_mem) = memory {
            m_h = self
                .cross_attention_norm
                .residual(&m_h, |m| self.cross_attention.forward(m, m_mem, m_mem, None, rng))?;
        }
        let m_out = self
            .feedforward_norm
            .residual(&m_h, |m| self.feedforward.forward(m, rng))?;

        match &self.final_norm {
            Some(norm) => norm.normalize(&m_out),
            None => Ok(m_out),
        }
    }
}

impl Layer for DecoderBlock {
    fn layer_type(&self) -> &str {
        "DecoderBlock"
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut v = Vec::new();
        if let Some(p) = &self.pose_encoding {
            v.extend(p.parameters());
        }
        v.extend(self.self_attention_norm.parameters());
        v.extend(self.self_attention.parameters());
        v.extend(self.cross_attention_norm.parameters());
        v.extend(self.cross_attention.parameters());
        v.extend(self.feedforward_norm.parameters());
        v.extend(self.feedforward.parameters());
        if let Some(n) = &self.final_norm {
            v.extend(n.parameters());
        }
        v
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut v = Vec::new();
        if let Some(p) = &mut self.pose_encoding {
            v.extend(p.parameters_mut());
        }
        v.extend(self.self_attention_norm.parameters_mut());
        v.extend(self.self_attention.parameters_mut());
        v.extend(self.cross_attention_norm.parameters_mut());
        v.extend(self.cross_attention.parameters_mut());
        v.extend(self.feedforward_norm.parameters_mut());
        v.extend(self.feedforward.parameters_mut());
        if let Some(n) = &mut self.final_norm {
            v.extend(n.parameters_mut());
        }
        v
    }

    fn set_train_mode(&mut self, b_train: bool) {
        self.self_attention.set_train_mode(b_train);
        self.cross_attention.set_train_mode(b_train);
        self.feedforward.set_train_mode(b_train);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttentionConfig, AttentionKind, FeedForwardKind};
    use crate::feed_forward::Activation;
    use ndarray::Array2;
    use rand::SeedableRng;

    fn mh(i_embed: usize) -> MultiHeadConfig {
        MultiHeadConfig {
            num_heads: 2,
            dim_model: i_embed,
            residual_dropout: 0.0,
            attention: AttentionConfig {
                name: AttentionKind::ScaledDotProduct,
                dropout: 0.0,
                causal: false,
                seq_len: None,
            },
        }
    }

    fn encoder_cfg(style: LayerNormStyle) -> EncoderConfig {
        EncoderConfig {
            dim_model: 8,
            num_layers: 1,
            reversible: false,
            position_encoding_config: Some(PositionEncodingConfig {
                name: PositionEncodingKind::Vocab,
                dim_model: 8,
                seq_len: Some(6),
                vocab_size: Some(12),
            }),
            multi_head_config: mh(8),
            feedforward_config: FeedForwardConfig {
                name: FeedForwardKind::Mlp,
                dim_model: 8,
                dropout: 0.0,
                activation: Activation::Relu,
                hidden_layer_multiplier: 2,
            },
            layer_norm_style: style,
        }
    }

    fn tokens() -> Sequence {
        Sequence::Tokens(Array2::from_shape_fn((2, 4), |(b, s)| (b + s) % 12))
    }

    #[test]
    fn position_policy_follows_layer_position() {
        let cfg = encoder_cfg(LayerNormStyle::Pre);
        let mut rng = StdRng::seed_from_u64(0);
        let first = EncoderBlock::from_config(&cfg, LayerPosition::for_index(0, 3), &mut rng);
        let middle = EncoderBlock::from_config(&cfg, LayerPosition::for_index(1, 3), &mut rng);
        let last = EncoderBlock::from_config(&cfg, LayerPosition::for_index(2, 3), &mut rng);
        assert!(first.pose_encoding.is_some() && first.final_norm.is_none());
        assert!(middle.pose_encoding.is_none() && middle.final_norm.is_none());
        assert!(last.pose_encoding.is_none() && last.final_norm.is_some());

        let post = EncoderBlock::from_config(&encoder_cfg(LayerNormStyle::Post), LayerPosition::default(), &mut rng);
        assert!(post.final_norm.is_none());
    }

    #[test]
    fn encoder_embeds_tokens() {
        let mut rng = StdRng::seed_from_u64(1);
        let block = EncoderBlock::from_config(&encoder_cfg(LayerNormStyle::Pre), LayerPosition::default(), &mut rng);
        let m_y = block.forward(&tokens(), None, &mut rng).unwrap();
        assert_eq!(m_y.dim(), (2, 4, 8));
    }

    #[test]
    fn middle_block_rejects_tokens() {
        let mut rng = StdRng::seed_from_u64(1);
        let block = EncoderBlock::from_config(&encoder_cfg(LayerNormStyle::Pre), LayerPosition::for_index(1, 3), &mut rng);
        let err = block.forward(&tokens(), None, &mut rng).unwrap_err();
        assert_eq!(err.layer, "EncoderBlock");
    }

    #[test]
    fn coupling_pair_keeps_all_parameters() {
        let mut rng = StdRng::seed_from_u64(2);
        let block = EncoderBlock::from_config(&encoder_cfg(LayerNormStyle::Pre), LayerPosition::default(), &mut rng);
        let i_total = block.parameter_count();
        let (pair, pose) = block.into_coupling_pair();
        assert!(pair.g.final_norm.is_some());
        let i_split = pair.parameter_count() + pose.map(|p| p.parameter_count()).unwrap_or(0);
        assert_eq!(i_total, i_split);
    }

    #[test]
    fn decoder_without_memory_skips_cross_attention() {
        let cfg = DecoderConfig {
            dim_model: 8,
            num_layers: 1,
            position_encoding_config: None,
            multi_head_config_masked: mh(8),
            multi_head_config_cross: mh(8),
            feedforward_config: encoder_cfg(LayerNormStyle::Pre).feedforward_config,
            layer_norm_style: LayerNormStyle::Pre,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let block = DecoderBlock::from_config(&cfg, LayerPosition::default(), &mut rng);
        let m_x = Array3::from_shape_fn((1, 3, 8), |(_, s, f)| (s as f32 - f as f32) * 0.1);
        let m_mem = Array3::from_shape_fn((1, 5, 8), |(_, s, f)| (s * f) as f32 * 0.05);

        let target = Sequence::Embedded(m_x);
        let a = block.forward(&target, None, None, &mut rng).unwrap();
        let b = block.forward(&target, Some(&m_mem), None, &mut rng).unwrap();
        assert_eq!(a.dim(), (1, 3, 8));
        assert_eq!(b.dim(), (1, 3, 8));
        assert_ne!(a, b);
    }
}
