use std::collections::HashMap;

/// First-order optimizers over named flat parameter slices. Keys are
/// stable per tensor (embedding rows get one key per touched row), so
/// sparse updates only advance moment state for rows that received a
/// gradient.
pub trait Optimizer: Send + Sync {
    fn update(&mut self, key: &str, params: &mut [f32], gradients: &[f32]);
    fn set_learning_rate(&mut self, learning_rate: f64);
    fn learning_rate(&self) -> f64;
    fn reset(&mut self);
}

#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn update(&mut self, _key: &str, params: &mut [f32], gradients: &[f32]) {
        let lr = self.learning_rate as f32;
        for (p, g) in params.iter_mut().zip(gradients) {
            *p -= lr * g;
        }
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn reset(&mut self) {
        // SGD doesn't maintain state
    }
}

#[derive(Debug, Clone)]
struct AdamSlot {
    m: Vec<f32>,
    v: Vec<f32>,
    t: u32,
}

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    slots: HashMap<String, AdamSlot>,
}

impl Adam {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            slots: HashMap::new(),
        }
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(0.001, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn update(&mut self, key: &str, params: &mut [f32], gradients: &[f32]) {
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| AdamSlot {
            m: vec![0.0; params.len()],
            v: vec![0.0; params.len()],
            t: 0,
        });
        slot.t += 1;

        let b1 = self.beta1 as f32;
        let b2 = self.beta2 as f32;
        let lr = self.learning_rate as f32;
        let eps = self.epsilon as f32;

        // Bias correction for this slot's step count
        let m_correction = 1.0 / (1.0 - b1.powi(slot.t as i32));
        let v_correction = 1.0 / (1.0 - b2.powi(slot.t as i32));

        for i in 0..params.len() {
            let g = gradients[i];

            // Update biased first moment estimate
            slot.m[i] = b1 * slot.m[i] + (1.0 - b1) * g;

            // Update biased second raw moment estimate
            slot.v[i] = b2 * slot.v[i] + (1.0 - b2) * g * g;

            let m_hat = slot.m[i] * m_correction;
            let v_hat = slot.v[i] * v_correction;

            params[i] -= lr * m_hat / (v_hat.sqrt() + eps);
        }
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn reset(&mut self) {
        self.slots.clear();
    }
}
