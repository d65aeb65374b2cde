use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;

use crate::model::attention::{AdditiveAttention, AttentionCache, AttentionGrads};

/// Pools a user's history of news vectors into one user vector with
/// additive attention over the `his_length` positions. Padding slots
/// are masked to exactly zero weight; a user with no real history gets
/// the zero vector, which is the documented degenerate case rather
/// than an error.
#[derive(Debug, Clone)]
pub struct UserEncoder {
    pub attn: AdditiveAttention,
}

pub type UserCache = AttentionCache;
pub type UserEncoderGrads = AttentionGrads;

impl UserEncoder {
    pub fn new(rng: &mut StdRng, query_dim: usize, news_dim: usize) -> Self {
        Self {
            attn: AdditiveAttention::new(rng, query_dim, news_dim),
        }
    }

    pub fn zero_grads(&self) -> UserEncoderGrads {
        self.attn.zero_grads()
    }

    /// `history_vectors` is `his_length x news_dim`; `mask[i]` is true
    /// for real clicks and false for padding slots.
    pub fn forward(
        &self,
        history_vectors: ArrayView2<f32>,
        mask: &[bool],
    ) -> (Array1<f32>, UserCache) {
        self.attn.forward(history_vectors, mask)
    }

    pub fn encode(&self, history_vectors: ArrayView2<f32>, mask: &[bool]) -> Array1<f32> {
        self.forward(history_vectors, mask).0
    }

    pub fn backward(
        &self,
        cache: &UserCache,
        d_user: ArrayView1<f32>,
        grads: &mut UserEncoderGrads,
    ) -> Array2<f32> {
        self.attn.backward(cache, d_user, grads)
    }
}
