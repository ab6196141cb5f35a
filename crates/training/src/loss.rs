use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{config::GanKind, TrainingError};

const PROB_EPS: f64 = 1e-7;

/// Adversarial loss against constant real/fake targets.
///
/// Least-squares GANs use the mean squared error on raw scores; DCGAN uses
/// binary cross entropy on sigmoid outputs. Target tensors are cached and
/// only rebuilt when the prediction shape changes.
#[derive(Debug)]
pub struct GanLoss {
    kind: GanKind,
    real_target: Option<Tensor>,
    fake_target: Option<Tensor>,
}

impl GanLoss {
    pub fn new(kind: GanKind) -> Self {
        Self {
            kind,
            real_target: None,
            fake_target: None,
        }
    }

    pub fn kind(&self) -> GanKind {
        self.kind
    }

    pub fn compute(&mut self, pred: &Tensor, target_is_real: bool) -> Result<Tensor, TrainingError> {
        let target = self.target(pred, target_is_real)?;
        match self.kind {
            GanKind::Lsgan => Ok((pred - target)?.sqr()?.mean_all()?),
            GanKind::Dcgan => binary_cross_entropy(pred, &target),
        }
    }

    fn target(&mut self, pred: &Tensor, target_is_real: bool) -> Result<Tensor, TrainingError> {
        let (slot, value) = if target_is_real {
            (&mut self.real_target, 1.0)
        } else {
            (&mut self.fake_target, 0.0)
        };
        let stale = match slot {
            Some(cached) => {
                cached.elem_count() != pred.elem_count()
                    || cached.dims() != pred.dims()
                    || cached.dtype() != pred.dtype()
                    || !cached.device().same_device(pred.device())
            }
            None => true,
        };
        if stale {
            *slot = Some(Tensor::full(value as f32, pred.dims(), pred.device())?.to_dtype(pred.dtype())?);
        }
        slot.clone()
            .ok_or_else(|| TrainingError::runtime("gan target cache is empty"))
    }
}

pub fn l1_loss(pred: &Tensor, target: &Tensor) -> Result<Tensor, TrainingError> {
    Ok((pred - target)?.abs()?.mean_all()?)
}

/// Mean binary cross entropy on probabilities, clamped away from 0 and 1.
pub fn binary_cross_entropy(prob: &Tensor, target: &Tensor) -> Result<Tensor, TrainingError> {
    let prob = prob.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
    let pos = (target * prob.log()?)?;
    let neg = (target.affine(-1.0, 1.0)? * prob.affine(-1.0, 1.0)?.log()?)?;
    Ok((pos + neg)?.neg()?.mean_all()?)
}

/// Binary cross entropy re-weighting positives and negatives of every
/// attribute by the inverse of their frequency in the training labels.
#[derive(Debug, Clone)]
pub struct WeightedBceLoss {
    w_pos: Tensor,
    w_neg: Tensor,
    class_norm: bool,
}

impl WeightedBceLoss {
    /// `pos_rate[i]` is the share of training samples where attribute `i` is
    /// present; rates are clamped into `(0, 1)`.
    pub fn new(pos_rate: &[f32], class_norm: bool, device: &candle_core::Device) -> Result<Self, TrainingError> {
        if pos_rate.is_empty() {
            return Err(TrainingError::initialization(
                "weighted bce requires at least one attribute",
            ));
        }
        let eps = PROB_EPS as f32;
        let w_pos: Vec<f32> = pos_rate.iter().map(|&r| 0.5 / r.clamp(eps, 1.0 - eps)).collect();
        let w_neg: Vec<f32> = pos_rate
            .iter()
            .map(|&r| 0.5 / (1.0 - r.clamp(eps, 1.0 - eps)))
            .collect();
        let n = pos_rate.len();
        Ok(Self {
            w_pos: Tensor::from_vec(w_pos, (1, n), device)?,
            w_neg: Tensor::from_vec(w_neg, (1, n), device)?,
            class_norm,
        })
    }

    pub fn compute(&self, prob: &Tensor, target: &Tensor) -> Result<Tensor, TrainingError> {
        let (_, n) = prob.dims2()?;
        if target.dims() != prob.dims() || self.w_pos.dim(1)? != n {
            return Err(TrainingError::runtime(format!(
                "weighted bce shape mismatch: prob {:?}, target {:?}, weights {}",
                prob.dims(),
                target.dims(),
                self.w_pos.dim(1)?
            )));
        }
        let target = target.to_dtype(prob.dtype())?;
        let neg_target = target.affine(-1.0, 1.0)?;
        let w_mask = (target.broadcast_mul(&self.w_pos.to_dtype(prob.dtype())?)?
            + neg_target.broadcast_mul(&self.w_neg.to_dtype(prob.dtype())?)?)?;

        let prob = prob.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
        let bce = ((&target * prob.log()?)? + (&neg_target * prob.affine(-1.0, 1.0)?.log()?)?)?
            .neg()?;
        let loss = (bce * &w_mask)?;
        let loss = if self.class_norm {
            loss.broadcast_div(&w_mask.mean_keepdim(0)?)?
        } else {
            loss.broadcast_div(&w_mask.mean_all()?)?
        };
        Ok(loss.mean_all()?)
    }
}

/// Multi-class cross entropy from logits `(batch, classes)` and `u32` class
/// indices `(batch,)`.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
        let (batch, classes) = logits.dims2()?;
        if classes == 0 || targets.dims() != [batch] {
            return Err(TrainingError::runtime(format!(
                "cross entropy expects (batch, classes) logits and (batch,) targets, got {:?} and {:?}",
                logits.dims(),
                targets.dims()
            )));
        }
        let targets = match targets.dtype() {
            DType::U32 => targets.clone(),
            DType::I64 | DType::U8 => targets.to_dtype(DType::U32)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };
        let log_probs = ops::log_softmax(logits, D::Minus1)?;
        let nll = log_probs.gather(&targets.unsqueeze(1)?, 1)?.neg()?;
        Ok(nll.mean_all()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: &Tensor) -> f32 {
        t.to_vec0::<f32>().unwrap()
    }

    #[test]
    fn lsgan_targets_follow_prediction_shape() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let mut loss = GanLoss::new(GanKind::Lsgan);
        let pred = Tensor::full(0.5f32, (2, 1, 4, 4), &device)?;
        assert!((scalar(&loss.compute(&pred, true)?) - 0.25).abs() < 1e-6);
        assert!((scalar(&loss.compute(&pred, false)?) - 0.25).abs() < 1e-6);

        let pred = Tensor::ones((1, 1, 2, 2), DType::F32, &device)?;
        assert_eq!(scalar(&loss.compute(&pred, true)?), 0.0);
        assert_eq!(loss.real_target.as_ref().map(|t| t.elem_count()), Some(4));
        Ok(())
    }

    #[test]
    fn dcgan_loss_is_small_for_confident_correct_scores() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let mut loss = GanLoss::new(GanKind::Dcgan);
        let pred = Tensor::full(0.999f32, (1, 1, 2, 2), &device)?;
        assert!(scalar(&loss.compute(&pred, true)?) < 0.01);
        assert!(scalar(&loss.compute(&pred, false)?) > 5.0);
        Ok(())
    }

    #[test]
    fn weighted_bce_balances_rare_attributes() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let loss = WeightedBceLoss::new(&[0.25, 0.5], false, &device)?;
        let target = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &device)?;
        let perfect = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &device)?;
        assert!(scalar(&loss.compute(&perfect, &target)?) < 1e-5);

        let unsure = Tensor::full(0.5f32, (2, 2), &device)?;
        let value = scalar(&loss.compute(&unsure, &target)?);
        // Every element costs ln 2 scaled by its weight over the mean weight.
        assert!((value - std::f32::consts::LN_2).abs() < 1e-5, "{value}");
        Ok(())
    }

    #[test]
    fn cross_entropy_of_uniform_logits() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((3, 4), DType::F32, &device)?;
        let targets = Tensor::new(&[0u32, 1, 3], &device)?;
        let value = scalar(&CrossEntropyLoss::new().compute(&logits, &targets)?);
        assert!((value - 4f32.ln()).abs() < 1e-5);
        Ok(())
    }
}
