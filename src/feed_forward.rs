// ===========================================================================
//  Datei:        feed_forward.rs
//  Modul:        FeedForward (MLP)
// ---------------------------------------------------------------------------
//  Beschreibung:
//      Zweistufige Feed-Forward-Schicht
//
//          1) Linear     :  input · w1 + b1
//          2) Aktivierung:  ReLU oder GELU
//          3) Dropout
//          4) Linear     :  hidden · w2 + b2
//          5) Dropout
//
//      Keine Residual-Verbindung: die liegt in der Norm-Huelle des Blocks
//      bzw. in der Kopplung G eines reversiblen Paares.
// ===========================================================================

use ndarray::{Array1, Array2, Array3, ArrayViewD, ArrayViewMutD};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::ShapeError;
use crate::layers::Layer;
use crate::math::{dropout, gelu, linear, normal_matrix, relu};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Relu,
    Gelu,
}

impl Activation {
    fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Relu => relu(x),
            Activation::Gelu => gelu(x),
        }
    }
}

/// Feed-Forward-Schicht Linear-Aktivierung-Linear
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedForward {
    pub w1: Array2<f32>, // [embed, hidden]
    pub b1: Array1<f32>, // [hidden]
    pub w2: Array2<f32>, // [hidden, embed]
    pub b2: Array1<f32>, // [embed]
    pub activation: Activation,
    pub f_dropout: f32,
    pub b_train_mode: bool,
}

impl FeedForward {
    pub fn new(i_embed: usize, i_hidden: usize, activation: Activation, f_dropout: f32, rng: &mut StdRng) -> Self {
        FeedForward {
            w1: normal_matrix(i_embed, i_hidden, rng),
            b1: Array1::zeros(i_hidden),
            w2: normal_matrix(i_hidden, i_embed, rng),
            b2: Array1::zeros(i_embed),
            activation,
            f_dropout,
            b_train_mode: true,
        }
    }

    pub fn forward(&self, m_x: &Array3<f32>, rng: &mut StdRng) -> Result<Array3<f32>, ShapeError> {
        if m_x.dim().2 != self.w1.nrows() {
            return Err(ShapeError::new(
                self.layer_type(),
                format!("expected feature width {}, got {:?}", self.w1.nrows(), m_x.dim()),
            ));
        }
        let f_drop = if self.b_train_mode { self.f_dropout } else { 0.0 };
        let activation = self.activation;

        let m_hidden = linear(m_x, &self.w1, &self.b1).mapv_into(|v| activation.apply(v));
        let m_hidden = dropout(m_hidden, f_drop, rng);
        let m_out = linear(&m_hidden, &self.w2, &self.b2);
        Ok(dropout(m_out, f_drop, rng))
    }
}

impl Layer for FeedForward {
    fn layer_type(&self) -> &str {
        "FeedForward"
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![
            self.w1.view().into_dyn(),
            self.b1.view().into_dyn(),
            self.w2.view().into_dyn(),
            self.b2.view().into_dyn(),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        vec![
            self.w1.view_mut().into_dyn(),
            self.b1.view_mut().into_dyn(),
            self.w2.view_mut().into_dyn(),
            self.b2.view_mut().into_dyn(),
        ]
    }

    fn set_train_mode(&mut self, b_train: bool) {
        self.b_train_mode = b_train;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn keeps_shape_and_counts_parameters() {
        let mut rng = StdRng::seed_from_u64(1);
        let ff = FeedForward::new(4, 16, Activation::Gelu, 0.0, &mut rng);
        let m_x = Array3::<f32>::ones((2, 3, 4));
        let m_y = ff.forward(&m_x, &mut rng).unwrap();
        assert_eq!(m_y.dim(), (2, 3, 4));
        assert_eq!(ff.parameter_count(), 4 * 16 + 16 + 16 * 4 + 4);
    }

    #[test]
    fn eval_mode_disables_dropout() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut ff = FeedForward::new(4, 8, Activation::Relu, 0.5, &mut rng);
        ff.set_train_mode(false);
        let m_x = Array3::from_shape_fn((1, 5, 4), |(_, s, f)| (s + f) as f32 * 0.1);
        let a = ff.forward(&m_x, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = ff.forward(&m_x, &mut StdRng::seed_from_u64(2)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn wrong_width_is_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let ff = FeedForward::new(4, 8, Activation::Relu, 0.0, &mut rng);
        assert!(ff.forward(&Array3::zeros((1, 1, 3)), &mut rng).is_err());
    }
}
