use rayon::prelude::*;
use std::sync::Arc;

/// Non-owning, bounds-checked view into the shared weight buffer.
///
/// The loader materializes the whole checkpoint weight region as one
/// contiguous `Arc<[f32]>`; every named tensor is an (offset, len) window
/// into it. Views are validated once at construction, so the hot path can
/// slice without further checks.
#[derive(Clone)]
pub struct Tensor {
    data: Arc<[f32]>,
    offset: usize,
    len: usize,
}

impl Tensor {
    pub fn new(data: Arc<[f32]>, offset: usize, len: usize) -> anyhow::Result<Self> {
        if offset + len > data.len() {
            anyhow::bail!(
                "Tensor view out of bounds: offset {} + len {} > buffer len {}",
                offset,
                len,
                data.len()
            );
        }
        Ok(Self { data, offset, len })
    }

    /// Owned tensor backed by its own buffer (used by tests and the tied
    /// classifier construction).
    pub fn from_vec(values: Vec<f32>) -> Self {
        let len = values.len();
        Self { data: values.into(), offset: 0, len }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Dense matrix-vector product: W (d,n) @ x (n,) -> xout (d,).
///
/// Row-major weights; rows are computed in parallel. This is where nearly
/// all inference time is spent.
pub fn matmul(xout: &mut [f32], x: &[f32], w: &[f32], n: usize, d: usize) {
    assert!(
        xout.len() >= d,
        "Output slice length must be at least d parameter: {} >= {}",
        xout.len(),
        d
    );
    debug_assert_eq!(w.len(), n * d, "Weight matrix must be exactly d x n");
    debug_assert_eq!(x.len(), n, "Input vector length must match n");

    xout.par_iter_mut().enumerate().take(d).for_each(|(i, out_val)| {
        *out_val = w[i * n..(i + 1) * n]
            .iter()
            .zip(x.iter())
            .map(|(&w_val, &x_val)| w_val * x_val)
            .sum();
    });
}
