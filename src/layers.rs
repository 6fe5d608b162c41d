// layers.rs
// ============================================================================
// Hinweis: Gemeinsames Layer-Trait aller Module sowie die Norm-/Residual-
//          Huelle (Pre-Norm oder Post-Norm) um Attention und Feed-Forward.
// ============================================================================

use ndarray::{Array3, ArrayViewD, ArrayViewMutD};
use serde::{Deserialize, Serialize};

use crate::error::ShapeError;
use crate::layer_norm::LayerNorm;

// ---------------------------------------------------------------------------
// Trait: Layer
// ---------------------------------------------------------------------------

/// Gemeinsame Schnittstelle aller Module eines Stacks.
///
/// `parameters_mut` liefert alle lernbaren Tensoren; darauf arbeitet der
/// stackweite Xavier-Reset.
pub trait Layer {
    fn layer_type(&self) -> &str;
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>>;
    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>>;

    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    /// Schaltet Dropout an oder aus. Module ohne Dropout ignorieren das.
    fn set_train_mode(&mut self, _b_train: bool) {}
}

// ---------------------------------------------------------------------------
// Norm-Stil
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerNormStyle {
    /// `x + f(norm(x))`
    #[default]
    Pre,
    /// `norm(x + f(x))`
    Post,
}

/// LayerNorm um eine Teilschicht, platziert nach [`LayerNormStyle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormWrapper {
    pub norm: LayerNorm,
    pub style: LayerNormStyle,
}

impl NormWrapper {
    pub fn new(i_embed: usize, style: LayerNormStyle) -> Self {
        Self {
            norm: LayerNorm::new(i_embed),
            style,
        }
    }

    /// Eingabe der umschlossenen Teilschicht.
    pub fn prepare(&self, m_x: &Array3<f32>) -> Result<Array3<f32>, ShapeError> {
        match self.style {
            LayerNormStyle::Pre => self.norm.normalize(m_x),
            LayerNormStyle::Post => Ok(m_x.clone()),
        }
    }

    /// Residualpfad: pre-norm `x + f(norm(x))`, post-norm `norm(x + f(x))`.
    pub fn residual<F>(&self, m_x: &Array3<f32>, sublayer: F) -> Result<Array3<f32>, ShapeError>
    where
        F: FnOnce(&Array3<f32>) -> Result<Array3<f32>, ShapeError>,
    {
        let m_in = self.prepare(m_x)?;
        let m_sum = sublayer(&m_in)? + m_x;
        match self.style {
            LayerNormStyle::Pre => Ok(m_sum),
            LayerNormStyle::Post => self.norm.normalize(&m_sum),
        }
    }

    /// Zweig ohne Residual fuer Kopplungsfunktionen:
    /// pre-norm `f(norm(x))`, post-norm `norm(f(x))`.
    pub fn branch<F>(&self, m_x: &Array3<f32>, sublayer: F) -> Result<Array3<f32>, ShapeError>
    where
        F: FnOnce(&Array3<f32>) -> Result<Array3<f32>, ShapeError>,
    {
        let m_in = self.prepare(m_x)?;
        let m_out = sublayer(&m_in)?;
        match self.style {
            LayerNormStyle::Pre => Ok(m_out),
            LayerNormStyle::Post => self.norm.normalize(&m_out),
        }
    }
}

impl Layer for NormWrapper {
    fn layer_type(&self) -> &str {
        "NormWrapper"
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        self.norm.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        self.norm.parameters_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Array3<f32> {
        Array3::from_shape_fn((1, 2, 4), |(_, s, f)| (s * 4 + f) as f32)
    }

    #[test]
    fn pre_norm_residual_keeps_skip_path() {
        let wrapper = NormWrapper::new(4, LayerNormStyle::Pre);
        let m_x = ramp();
        let m_y = wrapper.residual(&m_x, |m| Ok(m.mapv(|_| 0.0))).unwrap();
        assert_eq!(m_y, m_x);
    }

    #[test]
    fn post_norm_residual_normalizes_sum() {
        let wrapper = NormWrapper::new(4, LayerNormStyle::Post);
        let m_x = ramp();
        let m_y = wrapper.residual(&m_x, |m| Ok(m.mapv(|_| 0.0))).unwrap();
        assert_eq!(m_y, wrapper.norm.normalize(&m_x).unwrap());
    }

    #[test]
    fn branch_drops_skip_path() {
        let wrapper = NormWrapper::new(4, LayerNormStyle::Pre);
        let m_y = wrapper.branch(&ramp(), |m| Ok(m.mapv(|_| 0.0))).unwrap();
        assert!(m_y.iter().all(|&v| v == 0.0));
    }
}
