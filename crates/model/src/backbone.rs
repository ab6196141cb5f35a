//! Convolutional trunks for the attribute encoder.
//!
//! `stackconv` is five strided 4x4 conv + batch-norm + ReLU layers ending at
//! 1024 channels. `resnet18`/`resnet34` follow the ImageNet ResNet layout with
//! basic blocks; their variable names match the usual ResNet checkpoint names
//! (`conv1`, `bn1`, `layer1.0.conv1`, `layer1.0.downsample.0`, ...) so
//! pretrained weights load by name.

use std::path::Path;

use candle_core::{Device, Error, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d_no_bias, BatchNorm, Conv2d, Conv2dConfig, Module, ModuleT, VarBuilder,
    VarMap,
};
use layers::{ConvBlock, ConvBlockConfig, NormKind};

use crate::config::Backbone;

const STACK_LAYERS: usize = 5;
const STACK_FIRST_NC: usize = 64;
const STACK_OUTPUT_NC: usize = 1024;
const BN_EPS: f64 = 1e-5;

/// Five 4x4 stride-2 conv + batch-norm + ReLU layers; `first_nc` doubles per
/// layer and the last layer jumps to `output_nc`.
pub fn stack_conv_layers(
    input_nc: usize,
    first_nc: usize,
    output_nc: usize,
    vb: VarBuilder,
) -> Result<Vec<ConvBlock>> {
    let mut layers = Vec::with_capacity(STACK_LAYERS);
    let (mut c_in, mut c_out) = (input_nc, first_nc);
    for n in 0..STACK_LAYERS {
        layers.push(ConvBlock::new(
            c_in,
            c_out,
            ConvBlockConfig::new(4, 2, 1, NormKind::Batch),
            vb.pp(format!("layer{n}")),
        )?);
        c_in = c_out;
        c_out = if n + 2 == STACK_LAYERS { output_nc } else { c_out * 2 };
    }
    Ok(layers)
}

#[derive(Debug, Clone)]
struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl BasicBlock {
    fn new(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let conv3 = |stride| Conv2dConfig {
            padding: 1,
            stride,
            ..Default::default()
        };
        let conv1 = conv2d_no_bias(in_c, out_c, 3, conv3(stride), vb.pp("conv1"))?;
        let bn1 = batch_norm(out_c, BN_EPS, vb.pp("bn1"))?;
        let conv2 = conv2d_no_bias(out_c, out_c, 3, conv3(1), vb.pp("conv2"))?;
        let bn2 = batch_norm(out_c, BN_EPS, vb.pp("bn2"))?;

        let downsample = if stride != 1 || in_c != out_c {
            let ds = vb.pp("downsample");
            let conv = conv2d_no_bias(
                in_c,
                out_c,
                1,
                Conv2dConfig {
                    stride,
                    ..Default::default()
                },
                ds.pp("0"),
            )?;
            Some((conv, batch_norm(out_c, BN_EPS, ds.pp("1"))?))
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            downsample,
        })
    }
}

impl ModuleT for BasicBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let identity = match &self.downsample {
            Some((conv, bn)) => bn.forward_t(&conv.forward(xs)?, train)?,
            None => xs.clone(),
        };
        let out = self.bn1.forward_t(&self.conv1.forward(xs)?, train)?.relu()?;
        let out = self.bn2.forward_t(&self.conv2.forward(&out)?, train)?;
        (out + identity)?.relu()
    }
}

/// ImageNet-style ResNet trunk without the classifier.
#[derive(Debug, Clone)]
pub struct ResnetTrunk {
    conv1: Conv2d,
    bn1: BatchNorm,
    stages: Vec<Vec<BasicBlock>>,
}

impl ResnetTrunk {
    pub const OUTPUT_NC: usize = 512;

    pub fn new(input_nc: usize, block_counts: [usize; 4], vb: VarBuilder) -> Result<Self> {
        let conv1 = conv2d_no_bias(
            input_nc,
            64,
            7,
            Conv2dConfig {
                padding: 3,
                stride: 2,
                ..Default::default()
            },
            vb.pp("conv1"),
        )?;
        let bn1 = batch_norm(64, BN_EPS, vb.pp("bn1"))?;

        let mut stages = Vec::with_capacity(4);
        let mut in_c = 64;
        for (i, &count) in block_counts.iter().enumerate() {
            let out_c = 64 << i;
            let stride = if i == 0 { 1 } else { 2 };
            let stage_vb = vb.pp(format!("layer{}", i + 1));
            let mut blocks = Vec::with_capacity(count);
            for b in 0..count {
                let (c, s) = if b == 0 { (in_c, stride) } else { (out_c, 1) };
                blocks.push(BasicBlock::new(c, out_c, s, stage_vb.pp(b.to_string()))?);
            }
            stages.push(blocks);
            in_c = out_c;
        }

        Ok(Self { conv1, bn1, stages })
    }
}

/// 3x3 stride-2 max pool with one pixel of padding. Replicated borders leave
/// the window maxima unchanged, so they stand in for `-inf` padding.
fn max_pool_3x3_s2(xs: &Tensor) -> Result<Tensor> {
    let xs = xs.pad_with_same(2, 1, 1)?.pad_with_same(3, 1, 1)?;
    xs.max_pool2d_with_stride(3, 2)
}

impl ModuleT for ResnetTrunk {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.bn1.forward_t(&self.conv1.forward(xs)?, train)?.relu()?;
        let mut xs = max_pool_3x3_s2(&xs)?;
        for stage in &self.stages {
            for block in stage {
                xs = block.forward_t(&xs, train)?;
            }
        }
        Ok(xs)
    }
}

#[derive(Debug, Clone)]
pub enum BackboneNet {
    StackConv(Vec<ConvBlock>),
    Resnet(ResnetTrunk),
}

impl BackboneNet {
    pub fn new(kind: Backbone, input_nc: usize, vb: VarBuilder) -> Result<Self> {
        match kind {
            Backbone::StackConv => Ok(Self::StackConv(stack_conv_layers(
                input_nc,
                STACK_FIRST_NC,
                STACK_OUTPUT_NC,
                vb,
            )?)),
            Backbone::Resnet18 => Ok(Self::Resnet(ResnetTrunk::new(input_nc, [2, 2, 2, 2], vb)?)),
            Backbone::Resnet34 => Ok(Self::Resnet(ResnetTrunk::new(input_nc, [3, 4, 6, 3], vb)?)),
        }
    }

    pub fn output_nc(&self) -> usize {
        match self {
            Self::StackConv(_) => STACK_OUTPUT_NC,
            Self::Resnet(_) => ResnetTrunk::OUTPUT_NC,
        }
    }
}

impl ModuleT for BackboneNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::StackConv(layers) => {
                let mut xs = xs.clone();
                for layer in layers {
                    xs = layer.forward_t(&xs, train)?;
                }
                Ok(xs)
            }
            Self::Resnet(trunk) => trunk.forward_t(xs, train),
        }
    }
}

/// Copies tensors from a safetensors file into `varmap` variables named
/// `<prefix>.<tensor name>`. Tensors without a matching variable (the
/// ImageNet classifier, `num_batches_tracked`) are skipped; a matching name
/// with a different shape is an error. Returns the number of tensors copied.
pub fn load_pretrained(varmap: &VarMap, path: &Path, prefix: &str) -> Result<usize> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::Msg("variable map mutex poisoned".into()))?;
    let mut copied = 0;
    for (name, tensor) in tensors {
        let Some(var) = data.get(&format!("{prefix}.{name}")) else {
            continue;
        };
        if var.dims() != tensor.dims() {
            return Err(Error::Msg(format!(
                "pretrained tensor {name} has shape {:?}, expected {:?}",
                tensor.dims(),
                var.dims()
            )));
        }
        var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn stackconv_reduces_by_32() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = BackboneNet::new(Backbone::StackConv, 3, vb)?;
        let xs = Tensor::randn(0f32, 1.0, (2, 3, 64, 64), &Device::Cpu)?;
        assert_eq!(net.forward_t(&xs, true)?.dims(), &[2, 1024, 2, 2]);
        Ok(())
    }

    #[test]
    fn resnet18_uses_checkpoint_names() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = BackboneNet::new(Backbone::Resnet18, 3, vb.pp("conv"))?;
        let xs = Tensor::randn(0f32, 1.0, (1, 3, 64, 64), &Device::Cpu)?;
        assert_eq!(net.forward_t(&xs, false)?.dims(), &[1, 512, 2, 2]);

        let data = varmap.data().lock().map_err(|_| Error::Msg("poisoned".into()))?;
        assert!(data.contains_key("conv.layer2.0.downsample.0.weight"));
        assert!(data.contains_key("conv.layer4.1.bn2.running_var"));
        Ok(())
    }
}
