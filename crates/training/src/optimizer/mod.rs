use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl AdamConfig {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon: 1e-8,
        }
    }
}

/// Adam over a named set of parameters, possibly drawn from several
/// networks. Names are expected to be unique (`<network>.<param>`).
#[derive(Debug)]
pub struct Adam {
    config: AdamConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl Adam {
    pub fn new(named_parameters: Vec<(String, Var)>, config: AdamConfig) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let first_moment = Tensor::zeros(tensor.dims(), DType::F32, tensor.device())?;
            let second_moment = Tensor::zeros(tensor.dims(), DType::F32, tensor.device())?;
            params.push(ParameterSlot {
                name,
                dtype: tensor.dtype(),
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn num_parameters(&self) -> usize {
        self.params.len()
    }

    /// Applies one update from the gradients of this optimizer's parameters,
    /// removing them from `grads`. Parameters without a gradient are skipped.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut updates = Vec::new();
        for (idx, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                updates.push((idx, grad.to_dtype(DType::F32)?));
            }
        }
        if updates.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let cfg = self.config;
        let scale_m = 1.0 / (1.0 - cfg.beta1.powi(self.step as i32));
        let scale_v = 1.0 / (1.0 - cfg.beta2.powi(self.step as i32));

        for (idx, grad) in updates {
            let slot = &mut self.params[idx];
            let new_m = (slot.first_moment.affine(cfg.beta1, 0.0)?
                + grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let new_v = (slot.second_moment.affine(cfg.beta2, 0.0)?
                + grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = new_m
                .affine(scale_m, 0.0)?
                .div(&denom)?
                .affine(cfg.learning_rate, 0.0)?;

            let next = slot.param.as_tensor().to_dtype(DType::F32)?.sub(&update)?;
            slot.param.set(&next.to_dtype(slot.dtype)?)?;
            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape: slot.param.as_tensor().dims().to_vec(),
                first_moment: slot.first_moment.flatten_all()?.to_vec1::<f32>()?,
                second_moment: slot.second_moment.flatten_all()?.to_vec1::<f32>()?,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            learning_rate: self.config.learning_rate,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        let mut restored = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;
            let dims = slot.param.as_tensor().dims();
            if dims != saved.shape.as_slice() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}': expected {:?}, found {:?}",
                    slot.name, dims, saved.shape
                )));
            }
            let expected: usize = dims.iter().product();
            if saved.first_moment.len() != expected || saved.second_moment.len() != expected {
                return Err(TrainingError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }
            let device = slot.param.as_tensor().device();
            restored.push((
                Tensor::from_vec(saved.first_moment, dims, device)?,
                Tensor::from_vec(saved.second_moment, dims, device)?,
            ));
        }

        if !by_name.is_empty() {
            let mut extra: Vec<_> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::runtime(format!(
                "optimizer state has parameters not present in the model: {}",
                extra.join(", ")
            )));
        }

        for (slot, (first, second)) in self.params.iter_mut().zip(restored) {
            slot.first_moment = first;
            slot.second_moment = second;
        }
        self.step = state.step;
        self.config.learning_rate = state.learning_rate;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub learning_rate: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn quadratic_step(opt: &mut Adam, var: &Var) -> Result<(), TrainingError> {
        let loss = var.as_tensor().sqr()?.sum_all()?;
        let mut grads = loss.backward()?;
        opt.step(&mut grads)
    }

    #[test]
    fn first_step_moves_by_learning_rate() -> Result<(), TrainingError> {
        let var = Var::from_tensor(&Tensor::new(&[1f32, -2.0], &Device::Cpu)?)?;
        let mut opt = Adam::new(vec![("w".into(), var.clone())], AdamConfig::new(0.1, 0.5, 0.999))?;
        quadratic_step(&mut opt, &var)?;
        let values = var.as_tensor().to_vec1::<f32>()?;
        assert!((values[0] - 0.9).abs() < 1e-4, "{values:?}");
        assert!((values[1] + 1.9).abs() < 1e-4, "{values:?}");
        Ok(())
    }

    #[test]
    fn state_round_trip_resumes_identically() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let a = Var::from_tensor(&Tensor::new(&[0.5f32, 1.5], &device)?)?;
        let b = Var::from_tensor(&Tensor::new(&[0.5f32, 1.5], &device)?)?;
        let config = AdamConfig::new(0.05, 0.5, 0.999);
        let mut opt_a = Adam::new(vec![("w".into(), a.clone())], config)?;
        quadratic_step(&mut opt_a, &a)?;

        let mut opt_b = Adam::new(vec![("w".into(), b.clone())], config)?;
        opt_b.load_state(opt_a.state()?)?;
        b.set(a.as_tensor())?;

        quadratic_step(&mut opt_a, &a)?;
        quadratic_step(&mut opt_b, &b)?;
        assert_eq!(a.as_tensor().to_vec1::<f32>()?, b.as_tensor().to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn mismatched_state_is_rejected() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let var = Var::from_tensor(&Tensor::zeros(3, DType::F32, &device)?)?;
        let other = Var::from_tensor(&Tensor::zeros(2, DType::F32, &device)?)?;
        let opt = Adam::new(vec![("w".into(), other)], AdamConfig::new(0.1, 0.5, 0.999))?;
        let mut target = Adam::new(vec![("w".into(), var)], AdamConfig::new(0.1, 0.5, 0.999))?;
        assert!(target.load_state(opt.state()?).is_err());
        Ok(())
    }
}
