//! Local patch encoder of the two-stage generator.
//!
//! Every patch is squeezed to a `nof` vector by a shared strided conv stack;
//! the vector is then splatted onto the heatmap of the joint the patch was
//! cut around, and the splats of all patches are summed.

use candle_core::{Error, Result, Tensor};
use candle_nn::{ModuleT, VarBuilder};
use layers::{checks, ActivationKind, ConvBlock, ConvBlockConfig, NormKind};

use crate::config::LocalEncoderConfig;

#[derive(Debug, Clone)]
pub struct LocalEncoder {
    config: LocalEncoderConfig,
    layers: Vec<ConvBlock>,
}

impl LocalEncoder {
    pub fn new(config: LocalEncoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let n_layers = config.patch_size.trailing_zeros() as usize;
        let mut layers = Vec::with_capacity(n_layers);
        let mut c_in = config.input_nc;
        let mut c_out = config.nf;
        for i in 0..n_layers {
            let last = i + 1 == n_layers;
            let block = if last {
                ConvBlockConfig::new(4, 2, 1, NormKind::None)
                    .with_activation(ActivationKind::Identity)
                    .with_bias(true)
            } else {
                ConvBlockConfig::new(4, 2, 1, config.norm).with_activation(ActivationKind::leaky())
            };
            let width = if last { config.nof } else { c_out };
            layers.push(ConvBlock::new(c_in, width, block, vb.pp(format!("layer{i}")))?);
            c_in = width;
            c_out = (c_out * 2).min(config.max_nf);
        }
        Ok(Self { config, layers })
    }

    pub fn config(&self) -> &LocalEncoderConfig {
        &self.config
    }

    /// `(b, input_nc, p, p)` patch to a `(b, nof)` vector.
    pub fn encode_patch(&self, patch: &Tensor, train: bool) -> Result<Tensor> {
        let p = self.config.patch_size;
        checks::expect_channels("local_encoder", patch, self.config.input_nc)?;
        let (b, _, h, w) = checks::expect_nchw("local_encoder", patch)?;
        if (h, w) != (p, p) {
            return Err(Error::Msg(format!(
                "local_encoder: expected {p}x{p} patches, got {h}x{w}"
            )));
        }
        let mut xs = patch.clone();
        for layer in &self.layers {
            xs = layer.forward_t(&xs, train)?;
        }
        xs.reshape((b, self.config.nof))
    }

    /// Encodes `patches[i]` and places it on `joint_maps[:, i]`.
    ///
    /// `joint_maps` is `(b, n_patch, h, w)`; the result is `(b, nof, h, w)`.
    pub fn forward(&self, patches: &[Tensor], joint_maps: &Tensor, train: bool) -> Result<Tensor> {
        let (b, n, h, w) = checks::expect_nchw("local_encoder joint maps", joint_maps)?;
        if patches.len() != self.config.n_patch || n != self.config.n_patch {
            return Err(Error::Msg(format!(
                "local_encoder: expected {} patches and joint maps, got {} and {n}",
                self.config.n_patch,
                patches.len()
            )));
        }
        let mut out = Tensor::zeros(
            (b, self.config.nof, h, w),
            joint_maps.dtype(),
            joint_maps.device(),
        )?;
        for (i, patch) in patches.iter().enumerate() {
            let code = self
                .encode_patch(patch, train)?
                .reshape((b, self.config.nof, 1, 1))?;
            let map = joint_maps.narrow(1, i, 1)?;
            out = (out + code.broadcast_mul(&map)?)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn config() -> LocalEncoderConfig {
        LocalEncoderConfig {
            n_patch: 2,
            input_nc: 3,
            nof: 6,
            nf: 4,
            max_nf: 8,
            patch_size: 8,
            norm: NormKind::Instance,
        }
    }

    #[test]
    fn splats_codes_only_where_joints_are() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = LocalEncoder::new(config(), vb)?;
        let patches = vec![
            Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device)?,
            Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device)?,
        ];
        let maps = Tensor::zeros((2, 2, 16, 16), DType::F32, &device)?;
        let out = net.forward(&patches, &maps, false)?;
        assert_eq!(out.dims(), &[2, 6, 16, 16]);
        assert_eq!(out.abs()?.sum_all()?.to_vec0::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn rejects_wrong_patch_size() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = LocalEncoder::new(config(), vb)?;
        let patch = Tensor::zeros((1, 3, 16, 16), DType::F32, &device)?;
        assert!(net.encode_patch(&patch, false).is_err());
        Ok(())
    }
}
