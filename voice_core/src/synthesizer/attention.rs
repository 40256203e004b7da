use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::nn::{Conv1d, Linear};

/// Location-sensitive additive attention.
///
/// Energies are `v . tanh(W q + V m_j + U f_j)` where `f_j` are location
/// features convolved from the previous and cumulative weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationAttention {
    pub query: Linear,
    pub memory: Linear,
    pub location_conv: Conv1d,
    pub location_dense: Linear,
    pub energy: Linear,
}

impl LocationAttention {
    pub fn random<R: Rng>(
        rng: &mut R,
        query_dim: usize,
        memory_dim: usize,
        attention_dim: usize,
        filters: usize,
        kernel: usize,
    ) -> Self {
        Self {
            query: Linear::random(rng, query_dim, attention_dim),
            memory: Linear::random(rng, memory_dim, attention_dim),
            location_conv: Conv1d::random(rng, 2, filters, kernel),
            location_dense: Linear::random(rng, filters, attention_dim),
            energy: Linear::random(rng, attention_dim, 1),
        }
    }

    pub fn check(
        &self,
        query_dim: usize,
        memory_dim: usize,
        attention_dim: usize,
        filters: usize,
        kernel: usize,
    ) -> Result<()> {
        self.query.check("attention.query", query_dim, attention_dim)?;
        self.memory.check("attention.memory", memory_dim, attention_dim)?;
        self.location_conv.check("attention.location_conv", 2, filters, kernel)?;
        self.location_dense.check("attention.location_dense", filters, attention_dim)?;
        self.energy.check("attention.energy", attention_dim, 1)
    }

    /// Memory projection, computed once per call.
    pub fn process_memory(&self, memory: &Array2<f32>) -> Array2<f32> {
        self.memory.forward_rows(memory.view())
    }

    /// Normalized attention weights over the memory positions.
    pub fn weights(
        &self,
        query: ArrayView1<'_, f32>,
        processed_memory: &Array2<f32>,
        previous: &Array1<f32>,
        cumulative: &Array1<f32>,
    ) -> Array1<f32> {
        let n = processed_memory.nrows();
        let mut location = Array2::<f32>::zeros((n, 2));
        location.column_mut(0).assign(previous);
        location.column_mut(1).assign(cumulative);
        let location = self
            .location_dense
            .forward_rows(self.location_conv.forward(location.view()).view());

        let q = self.query.forward(query);
        let hidden = (processed_memory + &location + &q).mapv(f32::tanh);
        let energies = self.energy.forward_rows(hidden.view()).column(0).to_owned();
        softmax(energies)
    }
}

fn softmax(mut x: Array1<f32>) -> Array1<f32> {
    let max = x.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    x.mapv_inplace(|v| (v - max).exp());
    let sum = x.sum();
    if sum > 0.0 {
        x /= sum;
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_weights_are_a_distribution() {
        let mut rng = StdRng::seed_from_u64(11);
        let attention = LocationAttention::random(&mut rng, 6, 5, 4, 3, 5);
        assert!(attention.check(6, 5, 4, 3, 5).is_ok());

        let memory = Array2::from_shape_fn((7, 5), |(i, j)| (i as f32 - j as f32) * 0.1);
        let processed = attention.process_memory(&memory);
        let query = Array1::from_elem(6, 0.3);
        let previous = Array1::zeros(7);
        let cumulative = Array1::zeros(7);
        let w = attention.weights(query.view(), &processed, &previous, &cumulative);
        assert_eq!(w.len(), 7);
        assert!((w.sum() - 1.0).abs() < 1e-5);
        assert!(w.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_softmax_is_stable_for_large_inputs() {
        let w = softmax(ndarray::array![1000.0, 1000.0]);
        assert!((w[0] - 0.5).abs() < 1e-6);
    }
}
