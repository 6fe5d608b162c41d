/***********************************************************************
*  layer_pos_encoding.rs  –  Positionskodierungen fuer den ersten Block
*
*  vocab : gelernte Token- und Positions-Embeddings (Eingabe: Token-Ids)
*  sine  : feste Sinus/Cosinus-Kodierung, addiert auf Embeddings
***********************************************************************/
use std::borrow::Cow;

use ndarray::{Array2, Array3, ArrayViewD, ArrayViewMutD, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::ShapeError;
use crate::layers::Layer;
use crate::math::embedding_matrix;

/// Eingabe eines Stacks oder Blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Sequence {
    /// Token-Ids, `(batch, seq)`.
    Tokens(Array2<usize>),
    /// Eingebettete Darstellung, `(batch, seq, dim)`.
    Embedded(Array3<f32>),
}

impl Sequence {
    pub fn batch_and_len(&self) -> (usize, usize) {
        match self {
            Sequence::Tokens(m) => m.dim(),
            Sequence::Embedded(m) => (m.dim().0, m.dim().1),
        }
    }

    /// Eingebetteter Tensor; fuer rohe Token-Ids ein `ShapeError` mit `s_layer`.
    pub fn embedded(&self, s_layer: &str) -> Result<Cow<'_, Array3<f32>>, ShapeError> {
        match self {
            Sequence::Embedded(m) => Ok(Cow::Borrowed(m)),
            Sequence::Tokens(m) => Err(ShapeError::new(
                s_layer,
                format!("received token ids of shape {:?} but has no position encoding to embed them", m.dim()),
            )),
        }
    }
}

impl From<Array3<f32>> for Sequence {
    fn from(m: Array3<f32>) -> Self {
        Sequence::Embedded(m)
    }
}

impl From<Array2<usize>> for Sequence {
    fn from(m: Array2<usize>) -> Self {
        Sequence::Tokens(m)
    }
}

// ---------------------------------------------------------------------------
// vocab
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabEmbedding {
    pub word_embeddings: Array2<f32>,     // [vocab, embed]
    pub position_embeddings: Array2<f32>, // [max_seq, embed]
}

impl VocabEmbedding {
    pub fn new(i_vocab: usize, i_max_seq: usize, i_embed: usize, rng: &mut StdRng) -> Self {
        Self {
            word_embeddings: embedding_matrix(i_vocab, i_embed, rng),
            position_embeddings: embedding_matrix(i_max_seq, i_embed, rng),
        }
    }

    fn embed(&self, m_tokens: &Array2<usize>) -> Result<Array3<f32>, ShapeError> {
        let (i_batch, i_seq) = m_tokens.dim();
        let i_vocab = self.word_embeddings.nrows();
        let i_embed = self.word_embeddings.ncols();
        if i_seq > self.position_embeddings.nrows() {
            return Err(ShapeError::new(
                "VocabEmbedding",
                format!("sequence length {i_seq} exceeds maximum {}", self.position_embeddings.nrows()),
            ));
        }
        if let Some(&i_bad) = m_tokens.iter().find(|&&t| t >= i_vocab) {
            return Err(ShapeError::new(
                "VocabEmbedding",
                format!("token id {i_bad} out of vocabulary of size {i_vocab}"),
            ));
        }

        let mut m_out = Array3::<f32>::zeros((i_batch, i_seq, i_embed));
        for ((b, s), &i_tok) in m_tokens.indexed_iter() {
            let mut row = m_out.slice_mut(ndarray::s![b, s, ..]);
            row.assign(&self.word_embeddings.row(i_tok));
            row += &self.position_embeddings.row(s);
        }
        Ok(m_out)
    }
}

// ---------------------------------------------------------------------------
// sine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SineEncoding {
    pub i_embed: usize,
}

impl SineEncoding {
    /// Klassische Tabelle: gerade Indizes sin, ungerade cos.
    pub fn table(&self, i_seq: usize) -> Array2<f32> {
        let i_embed = self.i_embed;
        Array2::from_shape_fn((i_seq, i_embed), |(pos, i)| {
            let exp = (2 * (i / 2)) as f32 / i_embed as f32;
            let theta = pos as f32 / 10000_f32.powf(exp);
            if i % 2 == 0 {
                theta.sin()
            } else {
                theta.cos()
            }
        })
    }

    fn encode(&self, m_x: &Array3<f32>) -> Result<Array3<f32>, ShapeError> {
        if m_x.dim().2 != self.i_embed {
            return Err(ShapeError::new(
                "SineEncoding",
                format!("expected feature width {}, got {:?}", self.i_embed, m_x.dim()),
            ));
        }
        let m_table = self.table(m_x.dim().1).insert_axis(Axis(0));
        Ok(m_x + &m_table)
    }
}

// ---------------------------------------------------------------------------
// PositionEncoding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PositionEncoding {
    Vocab(VocabEmbedding),
    Sine(SineEncoding),
}

impl PositionEncoding {
    pub fn forward(&self, x: &Sequence) -> Result<Array3<f32>, ShapeError> {
        match (self, x) {
            (PositionEncoding::Vocab(vocab), Sequence::Tokens(m)) => vocab.embed(m),
            (PositionEncoding::Vocab(_), Sequence::Embedded(m)) => Err(ShapeError::new(
                "VocabEmbedding",
                format!("expects token ids, got embedded input {:?}", m.dim()),
            )),
            (PositionEncoding::Sine(sine), x) => sine.encode(x.embedded("SineEncoding")?.as_ref()),
        }
    }
}

impl Layer for PositionEncoding {
    fn layer_type(&self) -> &str {
        match self {
            PositionEncoding::Vocab(_) => "VocabEmbedding",
            PositionEncoding::Sine(_) => "SineEncoding",
        }
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        match self {
            PositionEncoding::Vocab(v) => vec![
                v.word_embeddings.view().into_dyn(),
                v.position_embeddings.view().into_dyn(),
            ],
            PositionEncoding::Sine(_) => Vec::new(),
        }
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        match self {
            PositionEncoding::Vocab(v) => vec![
                v.word_embeddings.view_mut().into_dyn(),
                v.position_embeddings.view_mut().into_dyn(),
            ],
            PositionEncoding::Sine(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn vocab_embeds_tokens_plus_positions() {
        let mut rng = StdRng::seed_from_u64(5);
        let vocab = VocabEmbedding::new(10, 6, 4, &mut rng);
        let pe = PositionEncoding::Vocab(vocab.clone());
        let m_tokens = array![[1usize, 2, 3], [9, 0, 0]];
        let m_out = pe.forward(&Sequence::Tokens(m_tokens)).unwrap();
        assert_eq!(m_out.dim(), (2, 3, 4));
        let expected = &vocab.word_embeddings.row(9) + &vocab.position_embeddings.row(0);
        assert_eq!(m_out.slice(ndarray::s![1, 0, ..]), expected);
    }

    #[test]
    fn vocab_rejects_out_of_range() {
        let mut rng = StdRng::seed_from_u64(5);
        let pe = PositionEncoding::Vocab(VocabEmbedding::new(4, 2, 4, &mut rng));
        assert!(pe.forward(&Sequence::Tokens(array![[4usize]])).is_err());
        assert!(pe.forward(&Sequence::Tokens(array![[0usize, 1, 2]])).is_err());
        assert!(pe.forward(&Sequence::Embedded(Array3::zeros((1, 1, 4)))).is_err());
    }

    #[test]
    fn sine_adds_table() {
        let pe = PositionEncoding::Sine(SineEncoding { i_embed: 4 });
        let m_out = pe.forward(&Sequence::Embedded(Array3::zeros((2, 3, 4)))).unwrap();
        assert_eq!(m_out[(1, 0, 0)], 0.0);
        assert_eq!(m_out[(1, 0, 1)], 1.0);
        assert!((m_out[(0, 1, 0)] - 1.0f32.sin()).abs() < 1e-6);
        assert!(pe.forward(&Sequence::Tokens(array![[0usize]])).is_err());
        assert_eq!(pe.parameter_count(), 0);
    }
}
