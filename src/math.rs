// math.rs
// ============================================================================
// Hinweis: Numerik fuer die Bloecke: Softmax, Linear-Projektion auf
//          (batch, seq, feature)-Tensoren, Aktivierungen, Dropout,
//          Initialisierung (Normal / Xavier) und Feature-Split/Concat.
// ============================================================================

use ndarray::{concatenate, s, Array, Array1, Array2, Array3, ArrayViewMutD, Axis, Dimension};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::error::ShapeError;

// ---------------- Softmax ----------------

/// Zeilenweises Softmax in place. Zeilen ohne endlichen Score werden null
/// (vollstaendig maskierte Query liefert kein NaN).
pub fn softmax_rows_inplace(m: &mut Array2<f32>) {
    for mut row in m.rows_mut() {
        let max_v = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !max_v.is_finite() {
            row.fill(0.0);
            continue;
        }
        let mut sum = 0.0f32;
        for v in row.iter_mut() {
            *v = (*v - max_v).exp();
            sum += *v;
        }
        if sum > 0.0 {
            for v in row.iter_mut() {
                *v /= sum;
            }
        }
    }
}

// ---------------- Linear ----------------

/// `x · w + b` fuer jedes Batch-Element, `w` als `[in, out]`.
///
/// Der Aufrufer prueft `m_x.dim().2 == w.nrows()`.
pub fn linear(m_x: &Array3<f32>, w: &Array2<f32>, b: &Array1<f32>) -> Array3<f32> {
    let (i_batch, i_seq, _) = m_x.dim();
    let mut m_out = Array3::<f32>::zeros((i_batch, i_seq, w.ncols()));
    for (mut m_o, m_in) in m_out.outer_iter_mut().zip(m_x.outer_iter()) {
        m_o.assign(&m_in.dot(w));
        m_o += b;
    }
    m_out
}

// ---------------- Aktivierungen ----------------

pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

// tanh-Approximation
pub fn gelu(x: f32) -> f32 {
    let c = (2.0f32 / std::f32::consts::PI).sqrt();
    0.5 * x * (1.0 + (c * (x + 0.044715 * x.powi(3))).tanh())
}

// ---------------- Dropout ----------------

/// Inverted Dropout. Alle Entscheidungen kommen aus `rng`; derselbe Seed
/// ergibt dieselbe Maske.
pub fn dropout<D: Dimension>(mut m: Array<f32, D>, f_rate: f32, rng: &mut StdRng) -> Array<f32, D> {
    if f_rate <= 0.0 {
        return m;
    }
    let p_drop = f_rate.clamp(0.0, 1.0);
    let scale = if p_drop < 1.0 { 1.0 / (1.0 - p_drop) } else { 0.0 };
    for v in m.iter_mut() {
        if rng.random::<f32>() < p_drop {
            *v = 0.0;
        } else {
            *v *= scale;
        }
    }
    m
}

// ---------------- Initialisierung ----------------

/// He-Initialisierung, `std = sqrt(2 / fan_in)`.
pub fn normal_matrix(i_rows: usize, i_cols: usize, rng: &mut StdRng) -> Array2<f32> {
    let f_std = (2.0 / i_rows.max(1) as f32).sqrt();
    match Normal::new(0.0, f_std) {
        Ok(dist) => Array2::from_shape_fn((i_rows, i_cols), |_| dist.sample(rng)),
        Err(e) => {
            tracing::warn!("invalid normal distribution (std={f_std}): {e}, falling back to zeros");
            Array2::zeros((i_rows, i_cols))
        }
    }
}

/// Kleine Normalverteilung fuer Embedding-Tabellen.
pub fn embedding_matrix(i_rows: usize, i_cols: usize, rng: &mut StdRng) -> Array2<f32> {
    match Normal::new(0.0, 0.02f32) {
        Ok(dist) => Array2::from_shape_fn((i_rows, i_cols), |_| dist.sample(rng)),
        Err(_) => Array2::zeros((i_rows, i_cols)),
    }
}

/// Xavier/Glorot-Reset: `U(-a, a)` mit `a = sqrt(6 / (fan_in + fan_out))`.
/// Tensoren mit Rang < 2 bleiben unveraendert.
pub fn xavier_uniform(mut m: ArrayViewMutD<'_, f32>, rng: &mut StdRng) {
    if m.ndim() < 2 || m.is_empty() {
        return;
    }
    let shape = m.shape();
    let i_receptive: usize = shape[2..].iter().product();
    let i_fan_in = shape[1] * i_receptive;
    let i_fan_out = shape[0] * i_receptive;
    let f_bound = (6.0 / (i_fan_in + i_fan_out) as f32).sqrt();
    let Ok(dist) = Uniform::new_inclusive(-f_bound, f_bound) else {
        return;
    };
    m.mapv_inplace(|_| dist.sample(rng));
}

// ---------------- Feature-Achse ----------------

/// Haengt zwei `(batch, seq, d)`-Tensoren entlang der Feature-Achse an.
pub fn concat_features(a: &Array3<f32>, b: &Array3<f32>, s_layer: &str) -> Result<Array3<f32>, ShapeError> {
    concatenate(Axis(2), &[a.view(), b.view()])
        .map_err(|e| ShapeError::new(s_layer, format!("cannot concatenate {:?} and {:?}: {e}", a.dim(), b.dim())))
}

/// Teilt einen `(batch, seq, 2d)`-Tensor in zwei Haelften der Feature-Achse.
pub fn split_features(m_x: &Array3<f32>, s_layer: &str) -> Result<(Array3<f32>, Array3<f32>), ShapeError> {
    let i_width = m_x.dim().2;
    if i_width % 2 != 0 {
        return Err(ShapeError::new(
            s_layer,
            format!("feature width {i_width} cannot be split into two halves"),
        ));
    }
    let i_half = i_width / 2;
    Ok((
        m_x.slice(s![.., .., ..i_half]).to_owned(),
        m_x.slice(s![.., .., i_half..]).to_owned(),
    ))
}
