pub mod initializer;
pub mod optimizer;

pub use optimizer::{Adam, Optimizer, Sgd};
