use candle_core::Tensor;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::TrainingError;

/// History of generated images shown to the discriminator.
///
/// Until the pool is full every queried image is stored and returned as is.
/// Afterwards each image is, with probability one half, swapped with a random
/// stored image (the stored one is returned) or passed through unchanged.
/// A pool of size zero is a pass-through.
#[derive(Debug)]
pub struct ImagePool {
    capacity: usize,
    images: Vec<Tensor>,
    rng: StdRng,
}

impl ImagePool {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            images: Vec::with_capacity(capacity),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// `images` is a `(b, c, h, w)` batch; the returned batch has the same
    /// shape and is detached from the graph.
    pub fn query(&mut self, images: &Tensor) -> Result<Tensor, TrainingError> {
        let images = images.detach();
        if self.capacity == 0 {
            return Ok(images);
        }
        let batch = images.dim(0)?;
        let mut out = Vec::with_capacity(batch);
        for i in 0..batch {
            let image = images.get(i)?;
            if self.images.len() < self.capacity {
                self.images.push(image.clone());
                out.push(image);
            } else if self.rng.gen::<f64>() > 0.5 {
                let idx = self.rng.gen_range(0..self.images.len());
                let stored = std::mem::replace(&mut self.images[idx], image);
                out.push(stored);
            } else {
                out.push(image);
            }
        }
        Ok(Tensor::stack(&out, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn pool_never_exceeds_capacity() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let mut pool = ImagePool::new(3, 0);
        for step in 0..5 {
            let batch = Tensor::full(step as f32, (2, 3, 4, 4), &device)?;
            let out = pool.query(&batch)?;
            assert_eq!(out.dims(), &[2, 3, 4, 4]);
            assert!(pool.len() <= 3);
        }
        assert_eq!(pool.len(), 3);
        Ok(())
    }

    #[test]
    fn empty_pool_passes_through() -> Result<(), TrainingError> {
        let mut pool = ImagePool::new(0, 0);
        let batch = Tensor::ones((2, 3, 4, 4), DType::F32, &Device::Cpu)?;
        let out = pool.query(&batch)?;
        assert_eq!(out.sum_all()?.to_vec0::<f32>()?, 96.0);
        assert!(pool.is_empty());
        Ok(())
    }
}
