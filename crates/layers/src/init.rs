//! Weight initialisation over the variables of a [`VarMap`].
//!
//! Networks are built first (Candle assigns its own default init) and then
//! re-initialised in place by walking the map:
//!
//! * conv / linear weights (rank >= 2) follow the selected [`InitKind`];
//! * rank-1 `*.weight` entries are norm scales and are drawn from `N(1, std)`;
//! * `*.bias` entries are zeroed;
//! * batch-norm running statistics are left untouched.

use std::str::FromStr;

use candle_core::{Error, Result, Tensor, Var};
use candle_nn::VarMap;

use crate::LayerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitKind {
    /// `N(0, 0.02)`
    #[default]
    Normal,
    /// `N(0, 0.001)`
    Normal2,
    /// Xavier normal with gain 0.02.
    Xavier,
    /// Kaiming normal, fan-in mode.
    Kaiming,
    Orthogonal,
}

impl FromStr for InitKind {
    type Err = LayerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "normal" => Ok(InitKind::Normal),
            "normal2" => Ok(InitKind::Normal2),
            "xavier" => Ok(InitKind::Xavier),
            "kaiming" => Ok(InitKind::Kaiming),
            "orthogonal" => Ok(InitKind::Orthogonal),
            other => Err(LayerError::UnknownInit(other.to_string())),
        }
    }
}

impl InitKind {
    fn norm_scale_std(self) -> f64 {
        match self {
            InitKind::Normal2 => 0.001,
            _ => 0.02,
        }
    }

    fn weight(self, var: &Var) -> Result<Tensor> {
        let dims = var.dims().to_vec();
        let receptive: usize = dims[2..].iter().product();
        let fan_in = dims[1] * receptive;
        let fan_out = dims[0] * receptive;
        let std = match self {
            InitKind::Normal => 0.02,
            InitKind::Normal2 => 0.001,
            InitKind::Xavier => 0.02 * (2.0 / (fan_in + fan_out) as f64).sqrt(),
            InitKind::Kaiming => (2.0 / fan_in as f64).sqrt(),
            InitKind::Orthogonal => return orthogonal(var),
        };
        Tensor::randn(0f32, std as f32, dims.as_slice(), var.device())?.to_dtype(var.dtype())
    }
}

/// Re-initialises every variable whose name passes `filter`.
pub fn init_vars<F>(varmap: &VarMap, kind: InitKind, filter: F) -> Result<()>
where
    F: Fn(&str) -> bool,
{
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::Msg("variable map mutex poisoned".into()))?;
    for (name, var) in data.iter() {
        if !filter(name) || name.contains("running_") {
            continue;
        }
        let value = if name.ends_with("bias") {
            var.zeros_like()?
        } else if var.rank() >= 2 {
            kind.weight(var)?
        } else {
            Tensor::randn(1f32, kind.norm_scale_std() as f32, var.dims(), var.device())?
                .to_dtype(var.dtype())?
        };
        var.set(&value)?;
    }
    Ok(())
}

/// Re-initialises every variable in the map.
pub fn init_varmap(varmap: &VarMap, kind: InitKind) -> Result<()> {
    init_vars(varmap, kind, |_| true)
}

/// Overwrites a single named variable with a constant.
pub fn fill_var(varmap: &VarMap, name: &str, value: f64) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::Msg("variable map mutex poisoned".into()))?;
    let var = data
        .get(name)
        .ok_or_else(|| Error::Msg(format!("unknown variable {name}")))?;
    var.set(&var.ones_like()?.affine(value, 0.0)?)
}

/// Orthogonal rows (or columns when there are more rows than columns) via
/// Gram-Schmidt on a Gaussian sample.
fn orthogonal(var: &Var) -> Result<Tensor> {
    let dims = var.dims().to_vec();
    let rows = dims[0];
    let cols: usize = dims[1..].iter().product();
    let transpose = rows > cols;
    let (n, m) = if transpose { (cols, rows) } else { (rows, cols) };
    let sample = Tensor::randn(0f32, 1.0, (n, m), var.device())?.to_vec2::<f32>()?;

    let mut basis: Vec<Vec<f32>> = Vec::with_capacity(n);
    for mut v in sample {
        for u in &basis {
            let dot: f32 = v.iter().zip(u).map(|(a, b)| a * b).sum();
            v.iter_mut().zip(u).for_each(|(a, b)| *a -= dot * b);
        }
        let norm = v.iter().map(|a| a * a).sum::<f32>().sqrt().max(1e-12);
        v.iter_mut().for_each(|a| *a /= norm);
        basis.push(v);
    }

    let flat: Vec<f32> = basis.into_iter().flatten().collect();
    let matrix = Tensor::from_vec(flat, (n, m), var.device())?;
    let matrix = if transpose { matrix.t()?.contiguous()? } else { matrix };
    matrix.reshape(dims.as_slice())?.to_dtype(var.dtype())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{batch_norm, conv2d, VarBuilder};

    #[test]
    fn resets_biases_and_norm_scales() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        conv2d(3, 16, 3, Default::default(), vb.pp("conv"))?;
        batch_norm(16, 1e-5, vb.pp("bn"))?;
        init_varmap(&varmap, InitKind::Normal)?;

        let data = varmap.data().lock().unwrap();
        let bias = data["conv.bias"].as_tensor().abs()?.sum_all()?.to_vec0::<f32>()?;
        assert_eq!(bias, 0.0);
        let scale = data["bn.weight"].as_tensor().mean_all()?.to_vec0::<f32>()?;
        assert!((scale - 1.0).abs() < 0.05);
        let running = data["bn.running_var"].as_tensor().mean_all()?.to_vec0::<f32>()?;
        assert_eq!(running, 1.0);
        Ok(())
    }

    #[test]
    fn orthogonal_rows_are_orthonormal() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        conv2d(2, 4, 3, Default::default(), vb.pp("conv"))?;
        init_varmap(&varmap, InitKind::Orthogonal)?;
        let data = varmap.data().lock().unwrap();
        let w = data["conv.weight"].as_tensor().reshape((4, 18))?;
        let gram = w.matmul(&w.t()?)?;
        let eye = Tensor::eye(4, DType::F32, &device)?;
        let err = (gram - eye)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(err < 1e-4);
        Ok(())
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!("uniform".parse::<InitKind>().is_err());
    }
}
