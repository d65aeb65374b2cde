use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::Rng;

use crate::algorithms::initializer;

/// 1-D convolution over a token sequence with same-length padding and
/// a ReLU, producing one contextual vector per position.
#[derive(Debug, Clone)]
pub struct Conv1d {
    pub kernel: Array3<f32>, // filters x window x in_dim
    pub bias: Array1<f32>,   // filters
}

#[derive(Debug, Clone)]
pub struct ConvCache {
    input: Array2<f32>,  // seq_len x in_dim
    output: Array2<f32>, // seq_len x filters, post-ReLU
}

#[derive(Debug, Clone)]
pub struct ConvGrads {
    pub kernel: Array3<f32>,
    pub bias: Array1<f32>,
}

impl Conv1d {
    pub fn new(rng: &mut StdRng, filters: usize, window: usize, in_dim: usize) -> Self {
        Self {
            kernel: initializer::conv_kernel(rng, filters, window, in_dim),
            bias: initializer::zero_vector(filters),
        }
    }

    pub fn zero_grads(&self) -> ConvGrads {
        ConvGrads {
            kernel: Array3::zeros(self.kernel.raw_dim()),
            bias: Array1::zeros(self.bias.raw_dim()),
        }
    }

    fn pad_left(&self) -> usize {
        (self.kernel.dim().1 - 1) / 2
    }

    pub fn forward(&self, input: ArrayView2<f32>) -> (Array2<f32>, ConvCache) {
        let (filters, window, in_dim) = self.kernel.dim();
        let seq_len = input.nrows();
        debug_assert_eq!(input.ncols(), in_dim);
        let pad = self.pad_left() as isize;

        let mut output = Array2::zeros((seq_len, filters));
        for t in 0..seq_len {
            for o in 0..filters {
                let mut acc = self.bias[o];
                for j in 0..window {
                    let src = t as isize + j as isize - pad;
                    if src < 0 || src >= seq_len as isize {
                        continue;
                    }
                    let src = src as usize;
                    for c in 0..in_dim {
                        acc += self.kernel[[o, j, c]] * input[[src, c]];
                    }
                }
                output[[t, o]] = acc.max(0.0);
            }
        }

        let cache = ConvCache {
            input: input.to_owned(),
            output: output.clone(),
        };
        (output, cache)
    }

    pub fn backward(
        &self,
        cache: &ConvCache,
        d_output: ArrayView2<f32>,
        grads: &mut ConvGrads,
    ) -> Array2<f32> {
        let (filters, window, in_dim) = self.kernel.dim();
        let seq_len = cache.input.nrows();
        let pad = self.pad_left() as isize;

        let mut d_input = Array2::zeros(cache.input.raw_dim());
        for t in 0..seq_len {
            for o in 0..filters {
                // ReLU gate
                if cache.output[[t, o]] <= 0.0 {
                    continue;
                }
                let d_pre = d_output[[t, o]];
                if d_pre == 0.0 {
                    continue;
                }
                grads.bias[o] += d_pre;
                for j in 0..window {
                    let src = t as isize + j as isize - pad;
                    if src < 0 || src >= seq_len as isize {
                        continue;
                    }
                    let src = src as usize;
                    for c in 0..in_dim {
                        grads.kernel[[o, j, c]] += d_pre * cache.input[[src, c]];
                        d_input[[src, c]] += d_pre * self.kernel[[o, j, c]];
                    }
                }
            }
        }

        d_input
    }
}

impl ConvGrads {
    pub fn add_assign(&mut self, other: &ConvGrads) {
        self.kernel += &other.kernel;
        self.bias += &other.bias;
    }

    pub fn scale(&mut self, factor: f32) {
        self.kernel *= factor;
        self.bias *= factor;
    }

    pub fn squared_norm(&self) -> f32 {
        self.kernel.iter().map(|g| g * g).sum::<f32>()
            + self.bias.iter().map(|g| g * g).sum::<f32>()
    }
}

/// Fully connected layer, optionally gated by a ReLU.
#[derive(Debug, Clone)]
pub struct Dense {
    pub weight: Array2<f32>, // out_dim x in_dim
    pub bias: Array1<f32>,   // out_dim
    pub relu: bool,
}

#[derive(Debug, Clone)]
pub struct DenseCache {
    input: Array1<f32>,
    output: Array1<f32>,
}

#[derive(Debug, Clone)]
pub struct DenseGrads {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Dense {
    pub fn new(rng: &mut StdRng, out_dim: usize, in_dim: usize, relu: bool) -> Self {
        Self {
            weight: initializer::xavier_matrix(rng, out_dim, in_dim),
            bias: initializer::zero_vector(out_dim),
            relu,
        }
    }

    pub fn zero_grads(&self) -> DenseGrads {
        DenseGrads {
            weight: Array2::zeros(self.weight.raw_dim()),
            bias: Array1::zeros(self.bias.raw_dim()),
        }
    }

    pub fn forward(&self, input: ArrayView1<f32>) -> (Array1<f32>, DenseCache) {
        let mut output = self.weight.dot(&input) + &self.bias;
        if self.relu {
            output.mapv_inplace(|x| x.max(0.0));
        }
        let cache = DenseCache {
            input: input.to_owned(),
            output: output.clone(),
        };
        (output, cache)
    }

    pub fn backward(
        &self,
        cache: &DenseCache,
        d_output: ArrayView1<f32>,
        grads: &mut DenseGrads,
    ) -> Array1<f32> {
        let mut d_pre = d_output.to_owned();
        if self.relu {
            for (d, &out) in d_pre.iter_mut().zip(cache.output.iter()) {
                if out <= 0.0 {
                    *d = 0.0;
                }
            }
        }

        grads.bias += &d_pre;
        for k in 0..d_pre.len() {
            if d_pre[k] != 0.0 {
                grads.weight.row_mut(k).scaled_add(d_pre[k], &cache.input);
            }
        }

        self.weight.t().dot(&d_pre)
    }
}

impl DenseGrads {
    pub fn add_assign(&mut self, other: &DenseGrads) {
        self.weight += &other.weight;
        self.bias += &other.bias;
    }

    pub fn scale(&mut self, factor: f32) {
        self.weight *= factor;
        self.bias *= factor;
    }

    pub fn squared_norm(&self) -> f32 {
        self.weight.iter().map(|g| g * g).sum::<f32>()
            + self.bias.iter().map(|g| g * g).sum::<f32>()
    }
}

/// Inverted dropout: surviving entries are scaled by `1 / (1 - rate)`
/// at training time so inference is the identity. Returns `None` when
/// the rate is zero, which callers treat as a pass-through.
pub fn dropout_mask(rng: &mut StdRng, shape: (usize, usize), rate: f32) -> Option<Array2<f32>> {
    if rate == 0.0 {
        return None;
    }
    let keep = 1.0 - rate;
    let scale = 1.0 / keep;
    let mut mask = Array2::zeros(shape);
    for m in mask.iter_mut() {
        if rng.gen::<f32>() < keep {
            *m = scale;
        }
    }
    Some(mask)
}

pub fn apply_mask(x: &mut Array2<f32>, mask: &Option<Array2<f32>>) {
    if let Some(mask) = mask {
        *x *= mask;
    }
}
