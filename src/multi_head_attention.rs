// src/multi_head_attention.rs
// MultiHeadAttention – getrennte Q/K/V-Eingaenge (Self- und Cross-Attention),
// additive Masken mit Broadcasting, optional kausal, Dropout per Seed.
use ndarray::{s, Array1, Array2, Array3, ArrayD, ArrayViewD, ArrayViewMutD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ShapeError;
use crate::layers::Layer;
use crate::math::{dropout, linear, normal_matrix, softmax_rows_inplace};

// ---------------------------------------------------------------------------
// AttentionMask
// ---------------------------------------------------------------------------

/// Additive Attention-Maske: `0.0` behaelt einen Score, `-inf` entfernt ihn.
///
/// Rang 0 bis 3, Broadcast gegen `(batch, seq_q, seq_k)` ueber die hinteren
/// Achsen; jede Achse muss passen oder Laenge eins haben.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionMask {
    m_mask: ArrayD<f32>,
}

impl AttentionMask {
    pub fn new(m_mask: ArrayD<f32>) -> Self {
        Self { m_mask }
    }

    /// Key-Maske der Laenge `i_seq`, die alles behaelt.
    pub fn zeros(i_seq: usize) -> Self {
        Self::new(ArrayD::zeros(IxDyn(&[i_seq])))
    }

    /// `(seq, seq)`-Maske, die alle Keys nach der Query-Position verbirgt.
    pub fn causal(i_seq: usize) -> Self {
        let m = Array2::from_shape_fn((i_seq, i_seq), |(i, j)| if j > i { f32::NEG_INFINITY } else { 0.0 });
        Self::new(m.into_dyn())
    }

    /// Padding-Maske pro Sequenz aus einer `(batch, seq_k)`-Matrix von Keep-Flags.
    pub fn from_keep(m_keep: &Array2<bool>) -> Self {
        let (i_batch, i_seq) = m_keep.dim();
        let m = Array3::from_shape_fn((i_batch, 1, i_seq), |(b, _, k)| {
            if m_keep[(b, k)] {
                0.0
            } else {
                f32::NEG_INFINITY
            }
        });
        Self::new(m.into_dyn())
    }

    pub fn shape(&self) -> &[usize] {
        self.m_mask.shape()
    }

    /// Materialisiert die Maske in voller Score-Form.
    pub fn expand(
        &self,
        i_batch: usize,
        i_seq_q: usize,
        i_seq_k: usize,
        s_layer: &str,
    ) -> Result<Array3<f32>, ShapeError> {
        let v_target = [i_batch, i_seq_q, i_seq_k];
        let shape = self.m_mask.shape();
        if shape.len() > v_target.len() {
            return Err(ShapeError::new(
                s_layer,
                format!("mask of shape {shape:?} has more axes than scores {v_target:?}"),
            ));
        }
        let i_offset = v_target.len() - shape.len();
        for (i_axis, &i_len) in shape.iter().enumerate() {
            let i_want = v_target[i_offset + i_axis];
            if i_len != i_want && i_len != 1 {
                return Err(ShapeError::new(
                    s_layer,
                    format!("mask of shape {shape:?} does not broadcast to scores {v_target:?}"),
                ));
            }
        }

        Ok(Array3::from_shape_fn((i_batch, i_seq_q, i_seq_k), |(b, q, k)| {
            let v_full = [b, q, k];
            let mut v_idx = [0usize; 3];
            for (i_axis, &i_len) in shape.iter().enumerate() {
                v_idx[i_axis] = if i_len == 1 { 0 } else { v_full[i_offset + i_axis] };
            }
            self.m_mask[&v_idx[..shape.len()]]
        }))
    }
}

// ---------------------------------------------------------------------------
// MultiHeadAttention
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiHeadAttention {
    pub i_embed: usize,
    pub i_heads: usize,
    pub i_head_dim: usize,
    w_q: Array2<f32>, // [embed, embed]
    w_k: Array2<f32>,
    w_v: Array2<f32>,
    w_o: Array2<f32>,
    b_q: Array1<f32>,
    b_k: Array1<f32>,
    b_v: Array1<f32>,
    b_o: Array1<f32>,
    pub f_attention_dropout: f32,
    pub f_residual_dropout: f32,
    pub b_causal: bool,
    pub b_train_mode: bool,
}

impl MultiHeadAttention {
    /// `i_embed` muss durch `i_heads` teilbar sein (prueft der Config-Validator).
    pub fn new(
        i_embed: usize,
        i_heads: usize,
        f_attention_dropout: f32,
        f_residual_dropout: f32,
        b_causal: bool,
        rng: &mut StdRng,
    ) -> Self {
        let i_heads = i_heads.max(1);
        MultiHeadAttention {
            i_embed,
            i_heads,
            i_head_dim: i_embed / i_heads,
            w_q: normal_matrix(i_embed, i_embed, rng),
            w_k: normal_matrix(i_embed, i_embed, rng),
            w_v: normal_matrix(i_embed, i_embed, rng),
            w_o: normal_matrix(i_embed, i_embed, rng),
            b_q: Array1::zeros(i_embed),
            b_k: Array1::zeros(i_embed),
            b_v: Array1::zeros(i_embed),
            b_o: Array1::zeros(i_embed),
            f_attention_dropout,
            f_residual_dropout,
            b_causal,
            b_train_mode: true,
        }
    }

    fn check_input(&self, m: &Array3<f32>, s_role: &str) -> Result<(), ShapeError> {
        if m.dim().2 != self.i_embed {
            return Err(ShapeError::new(
                self.layer_type(),
                format!("{s_role} has shape {:?}, expected feature width {}", m.dim(), self.i_embed),
            ));
        }
        Ok(())
    }

    /// Scaled-Dot-Product-Attention ueber alle Koepfe.
    ///
    /// `m_q` ist `(batch, seq_q, embed)`, `m_k` und `m_v` sind `(batch, seq_k, embed)`.
    pub fn forward(
        &self,
        m_q: &Array3<f32>,
        m_k: &Array3<f32>,
        m_v: &Array3<f32>,
        mask: Option<&AttentionMask>,
        rng: &mut StdRng,
    ) -> Result<Array3<f32>, ShapeError> {
        self.check_input(m_q, "query")?;
        self.check_input(m_k, "key")?;
        self.check_input(m_v, "value")?;
        let (i_batch, i_seq_q, _) = m_q.dim();
        let (i_batch_k, i_seq_k, _) = m_k.dim();
        if i_batch_k != i_batch || m_v.dim().0 != i_batch || m_v.dim().1 != i_seq_k {
            return Err(ShapeError::new(
                self.layer_type(),
                format!(
                    "query {:?}, key {:?} and value {:?} do not line up",
                    m_q.dim(),
                    m_k.dim(),
                    m_v.dim()
                ),
            ));
        }

        let m_mask = mask
            .map(|m| m.expand(i_batch, i_seq_q, i_seq_k, self.layer_type()))
            .transpose()?;

        // 1) Projektionen
        let q = linear(m_q, &self.w_q, &self.b_q);
        let k = linear(m_k, &self.w_k, &self.b_k);
        let v = linear(m_v, &self.w_v, &self.b_v);

        // 2) Attention pro Batch-Element (parallel), Seeds vorab ziehen
        let f_scale = (self.i_head_dim as f32).sqrt();
        let f_drop = if self.b_train_mode { self.f_attention_dropout } else { 0.0 };
        let v_seeds: Vec<u64> = (0..i_batch).map(|_| rng.random()).collect();

        let v_ctx: Vec<Array2<f32>> = (0..i_batch)
            .into_par_iter()
            .map(|b| {
                let mut rng_b = StdRng::seed_from_u64(v_seeds[b]);
                let q_b = q.index_axis(Axis(0), b);
                let k_b = k.index_axis(Axis(0), b);
                let v_b = v.index_axis(Axis(0), b);
                let mut m_ctx = Array2::<f32>::zeros((i_seq_q, self.i_embed));

                for h in 0..self.i_heads {
                    let c0 = h * self.i_head_dim;
                    let c1 = c0 + self.i_head_dim;
                    let q_h = q_b.slice(s![.., c0..c1]);
                    let k_h = k_b.slice(s![.., c0..c1]);
                    let v_h = v_b.slice(s![.., c0..c1]);

                    let mut scores = q_h.dot(&k_h.t()) / f_scale; // [seq_q, seq_k]
                    if let Some(m) = &m_mask {
                        scores += &m.index_axis(Axis(0), b);
                    }
                    if self.b_causal {
                        for i in 0..i_seq_q {
                            for j in (i + 1)..i_seq_k {
                                scores[(i, j)] = f32::NEG_INFINITY;
                            }
                        }
                    }
                    softmax_rows_inplace(&mut scores);
                    let probs = dropout(scores, f_drop, &mut rng_b);
                    m_ctx.slice_mut(s![.., c0..c1]).assign(&probs.dot(&v_h));
                }
                m_ctx
            })
            .collect();

        let mut m_concat = Array3::<f32>::zeros((i_batch, i_seq_q, self.i_embed));
        for (b, m_ctx) in v_ctx.into_iter().enumerate() {
            m_concat.index_axis_mut(Axis(0), b).assign(&m_ctx);
        }

        // 3) Ausgabeprojektion + Residual-Dropout
        let m_out = linear(&m_concat, &self.w_o, &self.b_o);
        let f_res_drop = if self.b_train_mode { self.f_residual_dropout } else { 0.0 };
        Ok(dropout(m_out, f_res_drop, rng))
    }
}

impl Layer for MultiHeadAttention {
    fn layer_type(&self) -> &str {
        "MultiHeadAttention"
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![
            self.w_q.view().into_dyn(),
            self.w_k.view().into_dyn(),
            self.w_v.view().into_dyn(),
            self.w_o.view().into_dyn(),
            self.b_q.view().into_dyn(),
            self.b_k.view().into_dyn(),
            self.b_v.view().into_dyn(),
            self.b_o.view().into_dyn(),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        vec![
            self.w_q.view_mut().into_dyn(),
            self.w_k.view_mut().into_dyn(),
            self.w_v.view_mut().into_dyn(),
            self.w_o.view_mut().into_dyn(),
            self.b_q.view_mut().into_dyn(),
            self.b_k.view_mut().into_dyn(),
            self.b_v.view_mut().into_dyn(),
            self.b_o.view_mut().into_dyn(),
        ]
    }

    fn set_train_mode(&mut self, b_train: bool) {
        self.b_train_mode = b_train;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn attention(b_causal: bool) -> MultiHeadAttention {
        let mut rng = StdRng::seed_from_u64(11);
        MultiHeadAttention::new(8, 2, 0.0, 0.0, b_causal, &mut rng)
    }

    fn input(i_batch: usize, i_seq: usize) -> Array3<f32> {
        Array3::from_shape_fn((i_batch, i_seq, 8), |(b, s, f)| ((b + 1) * (s + 2) * (f + 3)) as f32 * 0.01)
    }

    #[test]
    fn output_keeps_query_shape() {
        let mha = attention(false);
        let m_q = input(2, 5);
        let m_kv = input(2, 7);
        let mut rng = StdRng::seed_from_u64(0);
        let m_out = mha.forward(&m_q, &m_kv, &m_kv, None, &mut rng).unwrap();
        assert_eq!(m_out.dim(), (2, 5, 8));
    }

    #[test]
    fn zero_mask_matches_no_mask() {
        let mha = attention(false);
        let m_x = input(2, 4);
        let mask = AttentionMask::zeros(4);
        let mut rng = StdRng::seed_from_u64(0);
        let a = mha.forward(&m_x, &m_x, &m_x, None, &mut rng).unwrap();
        let b = mha.forward(&m_x, &m_x, &m_x, Some(&mask), &mut rng).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn causal_flag_equals_causal_mask() {
        let m_x = input(1, 6);
        let mut rng = StdRng::seed_from_u64(0);
        let a = attention(true).forward(&m_x, &m_x, &m_x, None, &mut rng).unwrap();
        let b = attention(false)
            .forward(&m_x, &m_x, &m_x, Some(&AttentionMask::causal(6)), &mut rng)
            .unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn mask_broadcasting_rules() {
        let mask = AttentionMask::new(Array1::from(vec![0.0f32, f32::NEG_INFINITY, 0.0]).into_dyn());
        let m = mask.expand(2, 4, 3, "test").unwrap();
        assert_eq!(m.dim(), (2, 4, 3));
        assert_eq!(m[(1, 3, 1)], f32::NEG_INFINITY);
        assert_eq!(m[(1, 3, 2)], 0.0);

        assert!(mask.expand(2, 4, 5, "test").is_err());
        let too_deep = AttentionMask::new(ArrayD::zeros(IxDyn(&[1, 1, 1, 3])));
        assert!(too_deep.expand(2, 4, 3, "test").is_err());
    }

    #[test]
    fn bad_mask_is_shape_error() {
        let mha = attention(false);
        let m_x = input(1, 4);
        let mut rng = StdRng::seed_from_u64(0);
        let err = mha
            .forward(&m_x, &m_x, &m_x, Some(&AttentionMask::zeros(9)), &mut rng)
            .unwrap_err();
        assert_eq!(err.layer, "MultiHeadAttention");
    }

    #[test]
    fn key_padding_from_keep_flags() {
        let m_keep = ndarray::array![[true, false], [true, true]];
        let mask = AttentionMask::from_keep(&m_keep);
        assert_eq!(mask.shape(), &[2, 1, 2]);
        let m = mask.expand(2, 3, 2, "test").unwrap();
        assert_eq!(m[(0, 2, 1)], f32::NEG_INFINITY);
        assert_eq!(m[(1, 2, 1)], 0.0);
    }
}
