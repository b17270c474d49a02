//! Scalar quantization implementation.
//!
//! Each f32 vector is compressed to u8 by finding the min and max values,
//! then linearly mapping each component to \[0, 255\]. The `min` and `scale`
//! parameters are stored per vector for dequantization.
//!
//! Similarity functions use SIMD-friendly chunked loops with f32 inner
//! accumulators and f64 outer accumulation to minimize rounding error.

use serde::{Deserialize, Serialize};

/// Scalar-quantized vector: f32 → u8 with min/max for reconstruction.
/// `scale` is precomputed as (max - min) / 255.0 to avoid redundant division in hot paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedVector {
    pub data: Vec<u8>,
    pub min: f32,
    pub max: f32,
    pub scale: f32,
}

/// Lightweight reference to quantized vector data. Zero allocation.
#[derive(Debug, Clone, Copy)]
pub struct VectorRef<'a> {
    pub data: &'a [u8],
    pub min: f32,
    pub scale: f32,
}

impl VectorRef<'_> {
    #[inline]
    fn value(&self, i: usize) -> f32 {
        self.min + self.data[i] as f32 * self.scale
    }
}

impl QuantizedVector {
    /// Quantize a f32 vector to u8 using min-max scaling.
    ///
    /// Deterministic: the same input always yields the same bytes. A constant
    /// vector maps to `128` in every lane with `scale = 0`.
    pub fn quantize(vector: &[f32]) -> Self {
        if vector.is_empty() {
            return Self {
                data: Vec::new(),
                min: 0.0,
                max: 0.0,
                scale: 0.0,
            };
        }

        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for &v in vector {
            if v < min {
                min = v;
            }
            if v > max {
                max = v;
            }
        }

        let range = max - min;
        let (data, scale) = if range < f32::EPSILON {
            (vec![128u8; vector.len()], 0.0)
        } else {
            let inv_scale = 255.0 / range;
            let data = vector
                .iter()
                .map(|&v| ((v - min) * inv_scale).round().clamp(0.0, 255.0) as u8)
                .collect();
            (data, range / 255.0)
        };

        Self {
            data,
            min,
            max,
            scale,
        }
    }

    /// Dequantize back to f32. Lossy.
    pub fn dequantize(&self) -> Vec<f32> {
        if self.scale == 0.0 {
            return vec![self.min; self.data.len()];
        }
        self.data
            .iter()
            .map(|&v| self.min + (v as f32) * self.scale)
            .collect()
    }

    /// Returns the dimensionality of the quantized vector.
    pub fn dim(&self) -> usize {
        self.data.len()
    }

    /// Create a VectorRef borrowing this vector's data.
    pub fn as_ref(&self) -> VectorRef<'_> {
        VectorRef {
            data: &self.data,
            min: self.min,
            scale: self.scale,
        }
    }
}

/// Chunk size for the f32 inner loops.
const CHUNK_F32: usize = 16;

/// Exact cosine similarity between two f32 slices. Returns a value in \[-1, 1\],
/// or `0.0` when either vector has zero norm.
#[allow(clippy::needless_range_loop)]
pub fn cosine_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let len = a.len().min(b.len());
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    let full_chunks = len / CHUNK_F32;
    for c in 0..full_chunks {
        let base = c * CHUNK_F32;
        let mut cd = 0.0f32;
        let mut cna = 0.0f32;
        let mut cnb = 0.0f32;
        for j in 0..CHUNK_F32 {
            let x = a[base + j];
            let y = b[base + j];
            cd += x * y;
            cna += x * x;
            cnb += y * y;
        }
        dot += cd as f64;
        norm_a += cna as f64;
        norm_b += cnb as f64;
    }

    for i in (full_chunks * CHUNK_F32)..len {
        let x = a[i] as f64;
        let y = b[i] as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    (dot / denom) as f32
}

/// Asymmetric cosine similarity: f32 query vs u8 stored.
/// More accurate than comparing two quantized vectors since the query keeps full precision.
#[allow(clippy::needless_range_loop)]
pub fn cosine_asym(query: &[f32], stored: VectorRef<'_>) -> f32 {
    debug_assert_eq!(query.len(), stored.data.len());

    let len = query.len().min(stored.data.len());
    let mut dot = 0.0f64;
    let mut norm_q = 0.0f64;
    let mut norm_s = 0.0f64;

    let full_chunks = len / CHUNK_F32;
    for c in 0..full_chunks {
        let base = c * CHUNK_F32;
        let mut cd = 0.0f32;
        let mut cnq = 0.0f32;
        let mut cns = 0.0f32;
        for j in 0..CHUNK_F32 {
            let q = query[base + j];
            let s = stored.value(base + j);
            cd += q * s;
            cnq += q * q;
            cns += s * s;
        }
        dot += cd as f64;
        norm_q += cnq as f64;
        norm_s += cns as f64;
    }

    for i in (full_chunks * CHUNK_F32)..len {
        let q = query[i] as f64;
        let s = stored.value(i) as f64;
        dot += q * s;
        norm_q += q * q;
        norm_s += s * s;
    }

    let denom = norm_q.sqrt() * norm_s.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    (dot / denom) as f32
}
