// ===========================================================================
//  Datei:        reversible.rs
//  Modul:        Reversible Ausfuehrung (additive Kopplung)
// ---------------------------------------------------------------------------
//  Beschreibung:
//      Eine reversible Sequenz arbeitet auf doppelter Breite (x1 | x2).
//      Jedes Kopplungspaar (F, G) rechnet
//
//          y1 = x1 + F(x2, mask)
//          y2 = x2 + G(y1)
//
//      und laesst sich exakt invertieren:
//
//          x2 = y2 - G(y1)
//          x1 = y1 - F(x2, mask)
//
//      Dropout in F und G zieht alle Entscheidungen aus einem Seed pro
//      Aufruf. forward_recorded liefert diese Seeds als Tape, inverse spielt
//      sie wieder ab, so dass die Rekonstruktion auch im Trainingsmodus
//      exakt bleibt.
//
//      Die abschliessende LayerNorm eines Pre-Norm-Blocks gehoert zu G und
//      wird nach dem Feed-Forward-Zweig angewendet.
// ===========================================================================

use ndarray::{Array3, ArrayViewD, ArrayViewMutD};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::ShapeError;
use crate::feed_forward::FeedForward;
use crate::layer_norm::LayerNorm;
use crate::layers::{Layer, NormWrapper};
use crate::math::{concat_features, split_features};
use crate::multi_head_attention::{AttentionMask, MultiHeadAttention};

// ---------------------------------------------------------------------------
// Kopplungsfunktionen
// ---------------------------------------------------------------------------

/// F: Self-Attention samt Normierung, ohne Residualpfad.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionBranch {
    pub norm: NormWrapper,
    pub attention: MultiHeadAttention,
}

impl AttentionBranch {
    pub fn apply(&self, m_x: &Array3<f32>, mask: Option<&AttentionMask>, i_seed: u64) -> Result<Array3<f32>, ShapeError> {
        let mut rng = StdRng::seed_from_u64(i_seed);
        self.norm
            .branch(m_x, |m| self.attention.forward(m, m, m, mask, &mut rng))
    }
}

/// G: Feed-Forward samt Normierung, ohne Residualpfad. `final_norm` ist die
/// abschliessende Norm des letzten Pre-Norm-Blocks eines Records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedForwardBranch {
    pub norm: NormWrapper,
    pub feedforward: FeedForward,
    pub final_norm: Option<LayerNorm>,
}

impl FeedForwardBranch {
    pub fn apply(&self, m_x: &Array3<f32>, i_seed: u64) -> Result<Array3<f32>, ShapeError> {
        let mut rng = StdRng::seed_from_u64(i_seed);
        let m_out = self.norm.branch(m_x, |m| self.feedforward.forward(m, &mut rng))?;
        match &self.final_norm {
            Some(norm) => norm.normalize(&m_out),
            None => Ok(m_out),
        }
    }
}

/// Seeds eines Kopplungspaares fuer genau einen Forward-Aufruf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairSeeds {
    pub f: u64,
    pub g: u64,
}

impl PairSeeds {
    pub fn draw(rng: &mut StdRng) -> Self {
        Self {
            f: rng.random(),
            g: rng.random(),
        }
    }
}

/// Eine reversible Schicht; besitzt nur die beiden Zweigfunktionen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouplingPair {
    pub f: AttentionBranch,
    pub g: FeedForwardBranch,
}

impl CouplingPair {
    pub fn new(f: AttentionBranch, g: FeedForwardBranch) -> Self {
        Self { f, g }
    }

    /// Breite einer Haelfte.
    pub fn dim(&self) -> usize {
        self.f.attention.i_embed
    }

    pub fn forward(
        &self,
        m_x1: &Array3<f32>,
        m_x2: &Array3<f32>,
        mask: Option<&AttentionMask>,
        seeds: PairSeeds,
    ) -> Result<(Array3<f32>, Array3<f32>), ShapeError> {
        let m_y1 = self.f.apply(m_x2, mask, seeds.f)? + m_x1;
        let m_y2 = self.g.apply(&m_y1, seeds.g)? + m_x2;
        Ok((m_y1, m_y2))
    }

    pub fn inverse(
        &self,
        m_y1: &Array3<f32>,
        m_y2: &Array3<f32>,
        mask: Option<&AttentionMask>,
        seeds: PairSeeds,
    ) -> Result<(Array3<f32>, Array3<f32>), ShapeError> {
        let m_x2 = m_y2 - &self.g.apply(m_y1, seeds.g)?;
        let m_x1 = m_y1 - &self.f.apply(&m_x2, mask, seeds.f)?;
        Ok((m_x1, m_x2))
    }
}

impl Layer for CouplingPair {
    fn layer_type(&self) -> &str {
        "CouplingPair"
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut v = self.f.norm.parameters();
        v.extend(self.f.attention.parameters());
        v.extend(self.g.norm.parameters());
        v.extend(self.g.feedforward.parameters());
        if let Some(n) = &self.g.final_norm {
            v.extend(n.parameters());
        }
        v
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut v = self.f.norm.parameters_mut();
        v.extend(self.f.attention.parameters_mut());
        v.extend(self.g.norm.parameters_mut());
        v.extend(self.g.feedforward.parameters_mut());
        if let Some(n) = &mut self.g.final_norm {
            v.extend(n.parameters_mut());
        }
        v
    }

    fn set_train_mode(&mut self, b_train: bool) {
        self.f.attention.set_train_mode(b_train);
        self.g.feedforward.set_train_mode(b_train);
    }
}

// ---------------------------------------------------------------------------
// Tape + Sequenz
// ---------------------------------------------------------------------------

/// Seeds eines aufgezeichneten Forward-Passes, ein Eintrag pro Paar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversibleTape {
    v_seeds: Vec<PairSeeds>,
}

impl ReversibleTape {
    pub fn seeds(&self) -> &[PairSeeds] {
        &self.v_seeds
    }

    pub fn len(&self) -> usize {
        self.v_seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v_seeds.is_empty()
    }
}

/// Geordnete Liste von Kopplungspaaren, strikt nacheinander ausgewertet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReversibleSequence {
    pairs: Vec<CouplingPair>,
}

impl ReversibleSequence {
    pub fn new(pairs: Vec<CouplingPair>) -> Self {
        Self { pairs }
    }

    pub fn pairs(&self) -> &[CouplingPair] {
        &self.pairs
    }

    pub fn pairs_mut(&mut self) -> &mut [CouplingPair] {
        &mut self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    fn split_checked(&self, m_x: &Array3<f32>) -> Result<(Array3<f32>, Array3<f32>), ShapeError> {
        if let Some(pair) = self.pairs.first() {
            let i_want = 2 * pair.dim();
            if m_x.dim().2 != i_want {
                return Err(ShapeError::new(
                    self.layer_type(),
                    format!("expected doubled feature width {i_want}, got {:?}", m_x.dim()),
                ));
            }
        }
        split_features(m_x, self.layer_type())
    }

    pub fn forward(
        &self,
        m_x: &Array3<f32>,
        mask: Option<&AttentionMask>,
        rng: &mut StdRng,
    ) -> Result<Array3<f32>, ShapeError> {
        self.forward_recorded(m_x, mask, rng).map(|(m_y, _)| m_y)
    }

    /// Forward-Pass, der zusaetzlich die Seeds fuer die Inversion liefert.
    pub fn forward_recorded(
        &self,
        m_x: &Array3<f32>,
        mask: Option<&AttentionMask>,
        rng: &mut StdRng,
    ) -> Result<(Array3<f32>, ReversibleTape), ShapeError> {
        let (mut m_x1, mut m_x2) = self.split_checked(m_x)?;
        let mut tape = ReversibleTape::default();
        for pair in &self.pairs {
            let seeds = PairSeeds::draw(rng);
            let (m_y1, m_y2) = pair.forward(&m_x1, &m_x2, mask, seeds)?;
            m_x1 = m_y1;
            m_x2 = m_y2;
            tape.v_seeds.push(seeds);
        }
        Ok((concat_features(&m_x1, &m_x2, self.layer_type())?, tape))
    }

    /// Rekonstruiert die Eingabe von [`ReversibleSequence::forward_recorded`] aus deren Ausgabe.
    pub fn inverse(
        &self,
        m_y: &Array3<f32>,
        mask: Option<&AttentionMask>,
        tape: &ReversibleTape,
    ) -> Result<Array3<f32>, ShapeError> {
        if tape.len() != self.pairs.len() {
            return Err(ShapeError::new(
                self.layer_type(),
                format!("tape holds {} entries for {} pairs", tape.len(), self.pairs.len()),
            ));
        }
        let (mut m_y1, mut m_y2) = self.split_checked(m_y)?;
        for (pair, &seeds) in self.pairs.iter().zip(tape.seeds()).rev() {
            let (m_x1, m_x2) = pair.inverse(&m_y1, &m_y2, mask, seeds)?;
            m_y1 = m_x1;
            m_y2 = m_x2;
        }
        concat_features(&m_y1, &m_y2, self.layer_type())
    }
}

impl Layer for ReversibleSequence {
    fn layer_type(&self) -> &str {
        "ReversibleSequence"
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        self.pairs.iter().flat_map(|p| p.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        self.pairs.iter_mut().flat_map(|p| p.parameters_mut()).collect()
    }

    fn set_train_mode(&mut self, b_train: bool) {
        for pair in &mut self.pairs {
            pair.set_train_mode(b_train);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed_forward::Activation;
    use crate::layers::LayerNormStyle;

    fn pair(i_embed: usize, f_dropout: f32, rng: &mut StdRng) -> CouplingPair {
        CouplingPair::new(
            AttentionBranch {
                norm: NormWrapper::new(i_embed, LayerNormStyle::Pre),
                attention: MultiHeadAttention::new(i_embed, 2, f_dropout, f_dropout, false, rng),
            },
            FeedForwardBranch {
                norm: NormWrapper::new(i_embed, LayerNormStyle::Pre),
                feedforward: FeedForward::new(i_embed, 4 * i_embed, Activation::Gelu, f_dropout, rng),
                final_norm: None,
            },
        )
    }

    fn input(i_width: usize) -> Array3<f32> {
        Array3::from_shape_fn((2, 5, i_width), |(b, s, f)| ((b * 31 + s * 7 + f * 3) as f32).sin())
    }

    fn assert_close(a: &Array3<f32>, b: &Array3<f32>, f_tol: f32) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < f_tol, "{x} vs {y}");
        }
    }

    #[test]
    fn pair_round_trip() {
        let mut rng = StdRng::seed_from_u64(3);
        let p = pair(8, 0.0, &mut rng);
        let (m_x1, m_x2) = split_features(&input(16), "test").unwrap();
        let seeds = PairSeeds { f: 1, g: 2 };
        let (m_y1, m_y2) = p.forward(&m_x1, &m_x2, None, seeds).unwrap();
        let (r1, r2) = p.inverse(&m_y1, &m_y2, None, seeds).unwrap();
        assert_close(&r1, &m_x1, 1e-4);
        assert_close(&r2, &m_x2, 1e-4);
    }

    #[test]
    fn sequence_round_trip_with_dropout() {
        let mut rng = StdRng::seed_from_u64(4);
        let seq = ReversibleSequence::new((0..3).map(|_| pair(8, 0.3, &mut rng)).collect());
        let m_x = input(16);
        let mask = AttentionMask::zeros(5);

        let (m_y, tape) = seq.forward_recorded(&m_x, Some(&mask), &mut rng).unwrap();
        assert_eq!(tape.len(), 3);
        assert!(m_y.iter().all(|v| v.is_finite()));
        let m_back = seq.inverse(&m_y, Some(&mask), &tape).unwrap();
        assert_close(&m_back, &m_x, 1e-3);
    }

    #[test]
    fn terminal_norm_in_g_stays_invertible() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut last = pair(8, 0.0, &mut rng);
        last.g.final_norm = Some(LayerNorm::new(8));
        let i_plain = pair(8, 0.0, &mut rng).parameters().len();
        assert_eq!(last.parameters().len(), i_plain + 2);

        let (m_x1, m_x2) = split_features(&input(16), "test").unwrap();
        let seeds = PairSeeds { f: 3, g: 4 };
        let (m_y1, m_y2) = last.forward(&m_x1, &m_x2, None, seeds).unwrap();
        let m_g = last.g.apply(&m_y1, seeds.g).unwrap();
        for lane in m_g.lanes(ndarray::Axis(2)) {
            assert!(lane.mean().unwrap().abs() < 1e-4);
        }
        let (r1, r2) = last.inverse(&m_y1, &m_y2, None, seeds).unwrap();
        assert_close(&r1, &m_x1, 1e-4);
        assert_close(&r2, &m_x2, 1e-4);
    }

    #[test]
    fn width_must_be_doubled() {
        let mut rng = StdRng::seed_from_u64(5);
        let seq = ReversibleSequence::new(vec![pair(8, 0.0, &mut rng)]);
        assert!(seq.forward(&input(8), None, &mut rng).is_err());
        assert!(seq.forward(&input(17), None, &mut rng).is_err());
        let err = seq.forward(&input(16), Some(&AttentionMask::zeros(7)), &mut rng).unwrap_err();
        assert_eq!(err.layer, "MultiHeadAttention");
    }

    #[test]
    fn inverse_rejects_foreign_tape() {
        let mut rng = StdRng::seed_from_u64(6);
        let seq = ReversibleSequence::new(vec![pair(8, 0.0, &mut rng), pair(8, 0.0, &mut rng)]);
        assert!(seq.inverse(&input(16), None, &ReversibleTape::default()).is_err());
    }
}
