use anyhow::Result;
use candle_core::{Device, Tensor};
use layers::pooling::noisy_or;

fn pooled(values: &[f32], shape: (usize, usize, usize, usize)) -> Result<Vec<f32>> {
    let map = Tensor::from_slice(values, shape, &Device::Cpu)?;
    Ok(noisy_or(&map)?.flatten_all()?.to_vec1::<f32>()?)
}

#[test]
fn pooled_probabilities_stay_in_unit_interval() -> Result<()> {
    let device = Device::Cpu;
    for _ in 0..8 {
        let map = Tensor::rand(0f32, 1.0, (3, 5, 7, 7), &device)?;
        let out = noisy_or(&map)?;
        assert_eq!(out.dims(), &[3, 5]);
        let min = out.min_all()?.to_vec0::<f32>()?;
        let max = out.max_all()?.to_vec0::<f32>()?;
        assert!(min >= 0.0, "min {min}");
        assert!(max <= 1.0, "max {max}");
    }
    let zeros = pooled(&[0.0; 9], (1, 1, 3, 3))?;
    assert_eq!(zeros, vec![0.0]);
    Ok(())
}

#[test]
fn raising_any_location_never_lowers_output() -> Result<()> {
    let base = [0.05f32, 0.3, 0.0, 0.7, 0.2, 0.01];
    let reference = pooled(&base, (1, 1, 2, 3))?[0];
    for idx in 0..base.len() {
        let mut previous = reference;
        for step in 1..=4 {
            let mut bumped = base;
            bumped[idx] = (base[idx] + 0.25 * step as f32).min(1.0);
            let value = pooled(&bumped, (1, 1, 2, 3))?[0];
            assert!(
                value >= previous,
                "location {idx}: {value} < {previous} after raising to {}",
                bumped[idx]
            );
            previous = value;
        }
    }
    Ok(())
}

#[test]
fn channels_pool_independently() -> Result<()> {
    let values = [0.5f32, 0.5, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0];
    let out = pooled(&values, (1, 2, 2, 2))?;
    assert!((out[0] - (1.0 - 0.5f32.powi(4))).abs() < 1e-6);
    assert_eq!(out[1], 0.0);
    Ok(())
}
