use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;

use crate::algorithms::initializer;

/// Additive attention: each row of the input is scored by a learned
/// query (`score_i = q . tanh(W h_i + b)`), scores are softmaxed over
/// the unmasked rows and the output is the probability-weighted sum of
/// the rows.
///
/// The same primitive is instantiated at three scales: word positions
/// inside a title/sapo, the handful of views of one news item, and the
/// positions of a click history.
#[derive(Debug, Clone)]
pub struct AdditiveAttention {
    pub proj: Array2<f32>,  // query_dim x input_dim
    pub bias: Array1<f32>,  // query_dim
    pub query: Array1<f32>, // query_dim
}

#[derive(Debug, Clone)]
pub struct AttentionCache {
    input: Array2<f32>,  // n x input_dim
    hidden: Array2<f32>, // n x query_dim, tanh(W h_i + b)
    pub weights: Array1<f32>,
    mask: Vec<bool>,
}

#[derive(Debug, Clone)]
pub struct AttentionGrads {
    pub proj: Array2<f32>,
    pub bias: Array1<f32>,
    pub query: Array1<f32>,
}

impl AdditiveAttention {
    pub fn new(rng: &mut StdRng, query_dim: usize, input_dim: usize) -> Self {
        Self {
            proj: initializer::xavier_matrix(rng, query_dim, input_dim),
            bias: initializer::zero_vector(query_dim),
            query: initializer::xavier_vector(rng, query_dim),
        }
    }

    pub fn zero_grads(&self) -> AttentionGrads {
        AttentionGrads {
            proj: Array2::zeros(self.proj.raw_dim()),
            bias: Array1::zeros(self.bias.raw_dim()),
            query: Array1::zeros(self.query.raw_dim()),
        }
    }

    /// Pool `input` (n x d) into one d-vector. Masked-off rows get
    /// exactly zero weight; if every row is masked the output is the
    /// zero vector (degenerate-history contract).
    pub fn forward(&self, input: ArrayView2<f32>, mask: &[bool]) -> (Array1<f32>, AttentionCache) {
        let n = input.nrows();
        let d = input.ncols();
        let q_dim = self.query.len();
        debug_assert_eq!(mask.len(), n);

        let mut hidden = Array2::zeros((n, q_dim));
        let mut scores = vec![f32::NEG_INFINITY; n];
        for i in 0..n {
            if !mask[i] {
                continue;
            }
            let mut u = self.proj.dot(&input.row(i)) + &self.bias;
            u.mapv_inplace(f32::tanh);
            scores[i] = self.query.dot(&u);
            hidden.row_mut(i).assign(&u);
        }

        let weights = Array1::from_vec(crate::utils::softmax(&scores));

        let mut output = Array1::zeros(d);
        for i in 0..n {
            if weights[i] != 0.0 {
                output.scaled_add(weights[i], &input.row(i));
            }
        }

        let cache = AttentionCache {
            input: input.to_owned(),
            hidden,
            weights,
            mask: mask.to_vec(),
        };
        (output, cache)
    }

    /// Backward pass. Accumulates parameter gradients into `grads` and
    /// returns the gradient w.r.t. the input rows.
    pub fn backward(
        &self,
        cache: &AttentionCache,
        d_output: ArrayView1<f32>,
        grads: &mut AttentionGrads,
    ) -> Array2<f32> {
        let n = cache.input.nrows();
        let alpha = &cache.weights;

        let mut d_input = Array2::zeros(cache.input.raw_dim());

        // d alpha_i = d_output . h_i, plus the direct weighted-sum path
        let mut d_alpha = Array1::zeros(n);
        for i in 0..n {
            d_alpha[i] = d_output.dot(&cache.input.row(i));
            if alpha[i] != 0.0 {
                d_input.row_mut(i).scaled_add(alpha[i], &d_output);
            }
        }

        // Softmax backward; masked rows carry alpha = 0 and drop out
        let inner: f32 = (0..n).map(|i| alpha[i] * d_alpha[i]).sum();
        for i in 0..n {
            if !cache.mask[i] || alpha[i] == 0.0 {
                continue;
            }
            let d_score = alpha[i] * (d_alpha[i] - inner);

            // score_i = q . u_i with u_i = tanh(W h_i + b)
            let u = cache.hidden.row(i);
            grads.query.scaled_add(d_score, &u);

            let mut d_z = Array1::zeros(u.len());
            for k in 0..u.len() {
                d_z[k] = d_score * self.query[k] * (1.0 - u[k] * u[k]);
            }

            grads.bias += &d_z;
            let h = cache.input.row(i);
            for k in 0..d_z.len() {
                if d_z[k] != 0.0 {
                    grads.proj.row_mut(k).scaled_add(d_z[k], &h);
                }
            }
            let back = self.proj.t().dot(&d_z);
            d_input.row_mut(i).scaled_add(1.0, &back);
        }

        d_input
    }

    pub fn input_dim(&self) -> usize {
        self.proj.ncols()
    }
}

impl AttentionGrads {
    pub fn add_assign(&mut self, other: &AttentionGrads) {
        self.proj += &other.proj;
        self.bias += &other.bias;
        self.query += &other.query;
    }

    pub fn scale(&mut self, factor: f32) {
        self.proj *= factor;
        self.bias *= factor;
        self.query *= factor;
    }

    pub fn squared_norm(&self) -> f32 {
        self.proj.iter().map(|g| g * g).sum::<f32>()
            + self.bias.iter().map(|g| g * g).sum::<f32>()
            + self.query.iter().map(|g| g * g).sum::<f32>()
    }
}
