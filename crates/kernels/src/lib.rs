//! CPU kernels backing the Themis transformer forward pass.
//!
//! Everything here operates on `ndarray` views and reports failures through
//! `anyhow`. Row-wise work is spread over the rayon pool.

pub mod activation;
pub mod attention;
pub mod dropout;
pub mod layernorm;
pub mod mask;
pub mod matmul;
pub mod utils;

pub use activation::*;
pub use attention::*;
pub use dropout::*;
pub use layernorm::*;
pub use mask::*;
pub use matmul::*;
pub use utils::*;
