//! Activation cache filled during a forward pass

use candle_core::Tensor;

/// Last-token residual-stream activations collected layer by layer.
///
/// Each entry is the hidden state after one decoder layer at the final
/// token position. Entry `i` corresponds to decoder layer `i`.
#[derive(Debug)]
pub struct ActivationCache {
    activations: Vec<Tensor>,
}

impl ActivationCache {
    /// Create an empty cache with capacity for n_layers
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            activations: Vec::with_capacity(n_layers),
        }
    }

    /// Add a layer's activation to the cache
    pub fn push(&mut self, tensor: Tensor) {
        self.activations.push(tensor);
    }

    /// Get the activation captured after a specific layer
    pub fn get_layer(&self, layer: usize) -> Option<&Tensor> {
        self.activations.get(layer)
    }

    /// Get the number of cached layers
    pub fn n_layers(&self) -> usize {
        self.activations.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Get all activations
    pub fn activations(&self) -> &[Tensor] {
        &self.activations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_cache_push_and_get() {
        let device = Device::Cpu;
        let mut cache = ActivationCache::with_capacity(2);

        assert!(cache.is_empty());

        let t1 = Tensor::zeros((4096,), DType::F32, &device).unwrap();
        let t2 = Tensor::zeros((4096,), DType::F32, &device).unwrap();
        cache.push(t1);
        cache.push(t2);

        assert_eq!(cache.n_layers(), 2);
        assert!(cache.get_layer(0).is_some());
        assert!(cache.get_layer(1).is_some());
        assert!(cache.get_layer(2).is_none());
    }
}
