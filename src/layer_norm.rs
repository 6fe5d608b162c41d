// ===========================================================================
//  Datei:        layer_norm.rs
//  Modul:        Layer Normalisation
// ---------------------------------------------------------------------------
//  Normalisiert jede Position eines (batch, seq, feature)-Tensors ueber die
//  Feature-Achse und wendet anschliessend die lernbare affine Abbildung
//  gamma * x_hat + beta an. gamma und beta sind Vektoren (Rang 1) und werden
//  daher von der Xavier-Initialisierung des Stacks nicht erfasst.
// ===========================================================================

use ndarray::{Array1, Array3, ArrayViewD, ArrayViewMutD, Axis};
use serde::{Deserialize, Serialize};

use crate::error::ShapeError;
use crate::layers::Layer;

/// Layer-Normalisierung mit lernbaren Parametern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerNorm {
    epsilon: f32,
    gamma: Array1<f32>,
    beta: Array1<f32>,
}

impl LayerNorm {
    /// Erzeugt eine LayerNorm-Instanz mit γ = 1, β = 0.
    pub fn new(i_embed: usize) -> Self {
        LayerNorm {
            epsilon: 1e-5,
            gamma: Array1::ones(i_embed),
            beta: Array1::zeros(i_embed),
        }
    }

    pub fn dim(&self) -> usize {
        self.gamma.len()
    }

    /// Normalisierung + affine Transformation, denom = sqrt(var + epsilon).
    pub fn normalize(&self, input: &Array3<f32>) -> Result<Array3<f32>, ShapeError> {
        let i_width = input.dim().2;
        if i_width != self.dim() {
            return Err(ShapeError::new(
                self.layer_type(),
                format!("expected feature width {}, got {:?}", self.dim(), input.dim()),
            ));
        }
        if input.is_empty() {
            return Ok(input.clone());
        }

        // Mittelwert je Position (ueber Features) -> [batch, seq, 1]
        let mean = input
            .mean_axis(Axis(2))
            .ok_or_else(|| ShapeError::new(self.layer_type(), "empty feature axis"))?
            .insert_axis(Axis(2));

        // Varianz je Position, ddof = 0
        let var = input.var_axis(Axis(2), 0.0).insert_axis(Axis(2));
        let denom = var.mapv(|v| (v + self.epsilon).sqrt());

        let x_hat = (input - &mean) / &denom;
        Ok(x_hat * &self.gamma + &self.beta)
    }
}

impl Layer for LayerNorm {
    fn layer_type(&self) -> &str {
        "LayerNorm"
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![self.gamma.view().into_dyn(), self.beta.view().into_dyn()]
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        vec![self.gamma.view_mut().into_dyn(), self.beta.view_mut().into_dyn()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_have_zero_mean_unit_variance() {
        let m_x = Array3::from_shape_fn((2, 3, 8), |(b, s, f)| (b * 7 + s * 3 + f * f) as f32);
        let m_y = LayerNorm::new(8).normalize(&m_x).unwrap();
        for row in m_y.rows() {
            let f_mean = row.mean().unwrap();
            let f_var = row.var(0.0);
            assert!(f_mean.abs() < 1e-4);
            assert!((f_var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn width_mismatch_is_shape_error() {
        let m_x = Array3::<f32>::zeros((1, 2, 5));
        let err = LayerNorm::new(4).normalize(&m_x).unwrap_err();
        assert_eq!(err.layer, "LayerNorm");
    }

    #[test]
    fn parameters_are_vectors() {
        let norm = LayerNorm::new(6);
        assert_eq!(norm.parameter_count(), 12);
        assert!(norm.parameters().iter().all(|p| p.ndim() == 1));
    }
}
