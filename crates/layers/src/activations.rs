//! Activation catalogue for convolutional stacks.
//!
//! # Built-in formulas
//!
//! * **LeakyReLU** computes `max(x, slope * x)`, valid for `0 <= slope <= 1`.
//! * **Sigmoid** uses Candle's fused kernel from `candle_nn::ops`.
//! * **Tanh** bounds generator outputs to `[-1, 1]`.

use std::str::FromStr;

use candle_core::{Result, Tensor};
use candle_nn::Module;

use crate::LayerError;

/// Slope used by discriminators and U-Net encoders.
pub const LEAKY_SLOPE: f64 = 0.2;

/// Identifies which non-linearity is applied after a conv block.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ActivationKind {
    /// Identity function, used for projection heads.
    Identity,
    #[default]
    Relu,
    LeakyRelu(f64),
    Tanh,
    Sigmoid,
}

impl ActivationKind {
    pub fn leaky() -> Self {
        ActivationKind::LeakyRelu(LEAKY_SLOPE)
    }
}

impl FromStr for ActivationKind {
    type Err = LayerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "identity" | "none" => Ok(ActivationKind::Identity),
            "relu" => Ok(ActivationKind::Relu),
            "leaky_relu" | "lrelu" => Ok(ActivationKind::leaky()),
            "tanh" => Ok(ActivationKind::Tanh),
            "sigmoid" => Ok(ActivationKind::Sigmoid),
            other => Err(LayerError::UnknownActivation(other.to_string())),
        }
    }
}

impl Module for ActivationKind {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match *self {
            ActivationKind::Identity => Ok(xs.clone()),
            ActivationKind::Relu => xs.relu(),
            ActivationKind::LeakyRelu(slope) => xs.maximum(&xs.affine(slope, 0.0)?),
            ActivationKind::Tanh => xs.tanh(),
            ActivationKind::Sigmoid => candle_nn::ops::sigmoid(xs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn leaky_relu_matches_reference_formula() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let output = ActivationKind::leaky().forward(&input)?.to_vec1::<f32>()?;
        let reference = [-0.5f32, -0.1, 0.0, 1.0, 3.0];
        for (o, r) in output.iter().zip(reference.iter()) {
            assert!((o - r).abs() < 5e-6);
        }
        Ok(())
    }

    #[test]
    fn sigmoid_matches_logistic_reference() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-3.0f32, -1.0, 0.0, 0.5, 2.0], (5,), &device)?;
        let output = ActivationKind::Sigmoid.forward(&input)?;

        let one = Tensor::ones_like(&input)?;
        let denom = (one.clone() + input.neg()?.exp()?)?;
        let reference = one.broadcast_div(&denom)?;
        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn parses_names() {
        assert_eq!("relu".parse::<ActivationKind>(), Ok(ActivationKind::Relu));
        assert_eq!(
            "leaky_relu".parse::<ActivationKind>(),
            Ok(ActivationKind::LeakyRelu(0.2))
        );
        assert!("gelu".parse::<ActivationKind>().is_err());
    }
}
