//! Cached causal attention masks
//!
//! Masks are cached by `(seq_len, device_id, dtype)` to avoid recreating
//! large tensors on every forward pass. The cache hands out shallow clones
//! (Arc bump, no data copy).

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Type alias for the causal mask cache to reduce type complexity
type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, usize, DType), Tensor>>>;

/// Cache for causal masks indexed by (seq_len, device_ordinal, dtype)
static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Get device identifier for cache key
///
/// Assumes a single device per type; multi-GPU runs would need ordinals.
fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Create or retrieve a cached causal mask for the given sequence length
///
/// # Returns
///
/// A tensor of shape `[1, 1, seq_len, seq_len]` where:
/// - `0.0` for positions that can attend (j <= i)
/// - `-inf` for positions that cannot attend (j > i)
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (seq_len, device_id(device), dtype);

    {
        let cache = CAUSAL_MASK_CACHE.lock().unwrap();
        if let Some(cached) = cache.get(&cache_key) {
            return Ok(cached.clone());
        }
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask_tensor = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    {
        let mut cache = CAUSAL_MASK_CACHE.lock().unwrap();
        cache.insert(cache_key, mask_tensor.clone());
    }

    Ok(mask_tensor)
}

/// Clear all cached masks
pub fn clear_mask_caches() {
    CAUSAL_MASK_CACHE.lock().unwrap().clear();
}

/// Get the current number of cached masks
pub fn mask_cache_size() -> usize {
    CAUSAL_MASK_CACHE.lock().unwrap().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_causal_mask_shape() {
        let device = Device::Cpu;
        let mask = create_causal_mask(4, &device, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 4, 4]);
    }

    #[test]
    #[serial]
    fn test_causal_mask_values() {
        let device = Device::Cpu;
        let mask = create_causal_mask(3, &device, DType::F32).unwrap();
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();

        // Row 0: [0, -inf, -inf]
        assert_eq!(data[0], 0.0);
        assert!(data[1].is_infinite() && data[1] < 0.0);
        assert!(data[2].is_infinite() && data[2] < 0.0);

        // Row 1: [0, 0, -inf]
        assert_eq!(data[3], 0.0);
        assert_eq!(data[4], 0.0);
        assert!(data[5].is_infinite() && data[5] < 0.0);

        // Row 2: [0, 0, 0]
        assert_eq!(data[6], 0.0);
        assert_eq!(data[7], 0.0);
        assert_eq!(data[8], 0.0);
    }

    #[test]
    #[serial]
    fn test_causal_mask_caching() {
        let device = Device::Cpu;

        clear_mask_caches();
        assert_eq!(mask_cache_size(), 0);

        let _mask1 = create_causal_mask(4, &device, DType::F32).unwrap();
        assert_eq!(mask_cache_size(), 1);

        let _mask2 = create_causal_mask(4, &device, DType::F32).unwrap();
        assert_eq!(mask_cache_size(), 1); // reused

        let _mask3 = create_causal_mask(8, &device, DType::F32).unwrap();
        assert_eq!(mask_cache_size(), 2);
    }
}
