//! Scalar quantization (f32 → u8) and the cosine kernels used by tier searches.

pub mod scalar;

pub use scalar::{cosine_asym, cosine_f32, QuantizedVector, VectorRef};
