use ndarray::{Array1, Array2, Array3};
use rand::rngs::StdRng;
use rand::Rng;

// All initializers draw from a caller-supplied seeded RNG so model
// construction is reproducible under a fixed seed.

pub fn xavier_uniform(rng: &mut StdRng, fan_in: usize, fan_out: usize, n: usize) -> Vec<f32> {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    (0..n).map(|_| rng.gen_range(-limit..limit)).collect()
}

pub fn uniform(rng: &mut StdRng, n: usize, low: f32, high: f32) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(low..high)).collect()
}

pub fn zeros(n: usize) -> Vec<f32> {
    vec![0.0; n]
}

pub fn xavier_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
    let data = xavier_uniform(rng, cols, rows, rows * cols);
    Array2::from_shape_vec((rows, cols), data).expect("shape matches data length")
}

pub fn xavier_vector(rng: &mut StdRng, n: usize) -> Array1<f32> {
    Array1::from_vec(xavier_uniform(rng, n, 1, n))
}

pub fn zero_vector(n: usize) -> Array1<f32> {
    Array1::from_vec(zeros(n))
}

/// Embedding tables use a small uniform range rather than Xavier so
/// padding rows and rare ids start close to zero.
pub fn embedding_table(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
    let scale = (1.0 / cols as f32).sqrt();
    let data = uniform(rng, rows * cols, -scale, scale);
    Array2::from_shape_vec((rows, cols), data).expect("shape matches data length")
}

pub fn conv_kernel(rng: &mut StdRng, filters: usize, window: usize, in_dim: usize) -> Array3<f32> {
    let fan_in = window * in_dim;
    let data = xavier_uniform(rng, fan_in, filters, filters * window * in_dim);
    Array3::from_shape_vec((filters, window, in_dim), data).expect("shape matches data length")
}
