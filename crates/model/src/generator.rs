//! Image generators.
//!
//! * [`ResnetGenerator`]: conv7 stem, two stride-2 downsamples, residual
//!   bottleneck, two transposed-conv upsamples, conv7 + tanh head.
//! * [`ConditionedResnetGenerator`]: same trunk; a condition (vector or map)
//!   is concatenated to the bottleneck input of the first or every residual
//!   block.
//! * [`UnetGenerator`]: skip-connected encoder/decoder with `num_downs`
//!   stride-2 levels.
//!
//! All outputs go through `tanh`, so images live in `[-1, 1]`.

use candle_core::{Error, Result, Tensor};
use candle_nn::{ModuleT, VarBuilder};
use layers::{
    checks, resample, ActivationKind, ConditionedResnetBlock, ConvBlock, ConvBlockConfig,
    NormKind, PaddingKind, ResnetBlock, ResnetBlockConfig, UpConvBlock,
};

use crate::{
    config::{ConditionLayer, ConditionedGeneratorConfig, GeneratorConfig},
    network::ConditionedModule,
};

const N_DOWNSAMPLING: usize = 2;

fn stem(config: &GeneratorConfig, vb: VarBuilder) -> Result<ConvBlock> {
    let block = ConvBlockConfig::new(7, 1, 3, config.norm).with_padding_kind(PaddingKind::Reflect);
    ConvBlock::new(config.input_nc, config.nf, block, vb)
}

fn downsampling(config: &GeneratorConfig, vb: VarBuilder) -> Result<Vec<ConvBlock>> {
    (0..N_DOWNSAMPLING)
        .map(|i| {
            let mult = 1 << i;
            ConvBlock::new(
                config.nf * mult,
                config.nf * mult * 2,
                ConvBlockConfig::new(3, 2, 1, config.norm),
                vb.pp(format!("down{i}")),
            )
        })
        .collect()
}

fn upsampling(config: &GeneratorConfig, vb: VarBuilder) -> Result<Vec<UpConvBlock>> {
    (0..N_DOWNSAMPLING)
        .map(|i| {
            let mult = 1 << (N_DOWNSAMPLING - i);
            UpConvBlock::double(
                config.nf * mult,
                config.nf * mult / 2,
                config.norm,
                vb.pp(format!("up{i}")),
            )
        })
        .collect()
}

fn head(config: &GeneratorConfig, vb: VarBuilder) -> Result<ConvBlock> {
    let block = ConvBlockConfig::new(7, 1, 3, NormKind::None)
        .with_padding_kind(PaddingKind::Reflect)
        .with_activation(ActivationKind::Tanh)
        .with_bias(true);
    ConvBlock::new(config.nf, config.output_nc, block, vb)
}

fn block_config(config: &GeneratorConfig) -> ResnetBlockConfig {
    ResnetBlockConfig::new(config.norm)
        .with_dropout(config.use_dropout)
        .with_padding(config.padding)
}

fn run_down(stem: &ConvBlock, down: &[ConvBlock], xs: &Tensor, train: bool) -> Result<Tensor> {
    let mut xs = stem.forward_t(xs, train)?;
    for block in down {
        xs = block.forward_t(&xs, train)?;
    }
    Ok(xs)
}

fn run_up(up: &[UpConvBlock], head: &ConvBlock, xs: &Tensor, train: bool) -> Result<Tensor> {
    let mut xs = xs.clone();
    for block in up {
        xs = block.forward_t(&xs, train)?;
    }
    head.forward_t(&xs, train)
}

fn expect_divisible(name: &str, xs: &Tensor, factor: usize) -> Result<()> {
    let (_, _, h, w) = checks::expect_nchw(name, xs)?;
    if h % factor != 0 || w % factor != 0 {
        return Err(Error::Msg(format!(
            "{name}: input size {h}x{w} must be divisible by {factor}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ResnetGenerator {
    config: GeneratorConfig,
    stem: ConvBlock,
    down: Vec<ConvBlock>,
    blocks: Vec<ResnetBlock>,
    up: Vec<UpConvBlock>,
    head: ConvBlock,
}

impl ResnetGenerator {
    pub fn new(config: GeneratorConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let dim = config.nf << N_DOWNSAMPLING;
        let blocks = (0..config.n_blocks)
            .map(|i| ResnetBlock::new(dim, block_config(&config), vb.pp(format!("block{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            stem: stem(&config, vb.pp("stem"))?,
            down: downsampling(&config, vb.clone())?,
            blocks,
            up: upsampling(&config, vb.clone())?,
            head: head(&config, vb.pp("head"))?,
            config,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }
}

impl ModuleT for ResnetGenerator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_channels("resnet_generator", xs, self.config.input_nc)?;
        expect_divisible("resnet_generator", xs, 1 << N_DOWNSAMPLING)?;
        let mut hidden = run_down(&self.stem, &self.down, xs, train)?;
        for block in &self.blocks {
            hidden = block.forward_t(&hidden, train)?;
        }
        run_up(&self.up, &self.head, &hidden, train)
    }
}

#[derive(Debug, Clone)]
enum BottleneckBlock {
    Plain(ResnetBlock),
    Conditioned(ConditionedResnetBlock),
}

#[derive(Debug, Clone)]
pub struct ConditionedResnetGenerator {
    config: ConditionedGeneratorConfig,
    stem: ConvBlock,
    down: Vec<ConvBlock>,
    blocks: Vec<BottleneckBlock>,
    up: Vec<UpConvBlock>,
    head: ConvBlock,
}

impl ConditionedResnetGenerator {
    pub fn new(config: ConditionedGeneratorConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let base = &config.base;
        let dim = base.nf << N_DOWNSAMPLING;
        let n_blocks = base.n_blocks;
        let mut blocks = Vec::with_capacity(n_blocks);
        for i in 0..n_blocks {
            let vb_block = vb.pp(format!("block{i}"));
            let conditioned = match config.condition_layer {
                ConditionLayer::First => i == 0,
                ConditionLayer::All => true,
            };
            let block = if conditioned {
                let output_c = config.condition_layer == ConditionLayer::All && i + 1 < n_blocks;
                BottleneckBlock::Conditioned(ConditionedResnetBlock::new(
                    dim,
                    config.condition_nc,
                    output_c,
                    block_config(base),
                    vb_block,
                )?)
            } else {
                BottleneckBlock::Plain(ResnetBlock::new(dim, block_config(base), vb_block)?)
            };
            blocks.push(block);
        }
        Ok(Self {
            stem: stem(base, vb.pp("stem"))?,
            down: downsampling(base, vb.clone())?,
            blocks,
            up: upsampling(base, vb.clone())?,
            head: head(base, vb.pp("head"))?,
            config,
        })
    }

    pub fn config(&self) -> &ConditionedGeneratorConfig {
        &self.config
    }

    /// Broadcasts a `(b, c)` vector or resizes a `(b, c, h', w')` map to the
    /// bottleneck resolution `(h, w)`.
    fn spatial_condition(&self, condition: &Tensor, h: usize, w: usize) -> Result<Tensor> {
        let nc = self.config.condition_nc;
        match condition.dims() {
            &[b, c] if c == nc => condition
                .reshape((b, nc, 1, 1))?
                .broadcast_as((b, nc, h, w))?
                .contiguous(),
            &[_, c, _, _] if c == nc => resample::bilinear_resize(condition, h, w),
            dims => Err(Error::Msg(format!(
                "condition must be (batch, {nc}) or (batch, {nc}, h, w), got {dims:?}"
            ))),
        }
    }
}

impl ConditionedModule for ConditionedResnetGenerator {
    fn forward_c(&self, xs: &Tensor, condition: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_channels("conditioned_resnet_generator", xs, self.config.base.input_nc)?;
        expect_divisible("conditioned_resnet_generator", xs, 1 << N_DOWNSAMPLING)?;
        let hidden = run_down(&self.stem, &self.down, xs, train)?;
        let (_, _, h, w) = hidden.dims4()?;
        let c = self.spatial_condition(condition, h, w)?;
        let mut hidden = Tensor::cat(&[&hidden, &c], 1)?;
        for block in &self.blocks {
            hidden = match block {
                BottleneckBlock::Plain(block) => block.forward_t(&hidden, train)?,
                BottleneckBlock::Conditioned(block) => block.forward_t(&hidden, train)?,
            };
        }
        run_up(&self.up, &self.head, &hidden, train)
    }
}

#[derive(Debug, Clone)]
struct UnetLevel {
    outermost: bool,
    down: ConvBlock,
    up: UpConvBlock,
}

impl UnetLevel {
    #[allow(clippy::too_many_arguments)]
    fn new(
        outer_nc: usize,
        inner_nc: usize,
        input_nc: usize,
        outermost: bool,
        innermost: bool,
        norm: NormKind,
        dropout: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let use_bias = norm.use_bias();
        let down_norm = if outermost || innermost { NormKind::None } else { norm };
        let down = ConvBlock::new(
            input_nc,
            inner_nc,
            ConvBlockConfig::new(4, 2, 1, down_norm)
                .with_activation(ActivationKind::Identity)
                .with_bias(use_bias),
            vb.pp("down"),
        )?;
        let up_in = if innermost { inner_nc } else { inner_nc * 2 };
        let up = if outermost {
            UpConvBlock::new(
                up_in,
                outer_nc,
                4,
                2,
                1,
                0,
                NormKind::None,
                ActivationKind::Tanh,
                true,
                vb.pp("up"),
            )?
        } else {
            UpConvBlock::new(
                up_in,
                outer_nc,
                4,
                2,
                1,
                0,
                norm,
                ActivationKind::Identity,
                use_bias,
                vb.pp("up"),
            )?
            .with_dropout(dropout.then_some(0.5))
        };
        Ok(Self {
            outermost,
            down,
            up,
        })
    }

    fn down(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if self.outermost {
            self.down.forward_t(xs, train)
        } else {
            let xs = ActivationKind::leaky().forward_t(xs, train)?;
            self.down.forward_t(&xs, train)
        }
    }

    fn up(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.up.forward_t(&xs.relu()?, train)
    }
}

#[derive(Debug, Clone)]
pub struct UnetGenerator {
    config: GeneratorConfig,
    /// Outermost level first.
    levels: Vec<UnetLevel>,
}

impl UnetGenerator {
    pub fn new(config: GeneratorConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        if config.num_downs < 5 {
            return Err(Error::Msg(format!(
                "unet generator needs num_downs >= 5, got {}",
                config.num_downs
            )));
        }
        let nf = config.nf;
        let n = config.num_downs;
        let mut levels = Vec::with_capacity(n);
        for level in 0..n {
            let (outer_nc, inner_nc, input_nc) = match level {
                0 => (config.output_nc, nf, config.input_nc),
                1 => (nf, nf * 2, nf),
                2 => (nf * 2, nf * 4, nf * 2),
                3 => (nf * 4, nf * 8, nf * 4),
                _ => (nf * 8, nf * 8, nf * 8),
            };
            let innermost = level + 1 == n;
            let dropout = config.use_dropout && level >= 4 && !innermost;
            levels.push(UnetLevel::new(
                outer_nc,
                inner_nc,
                input_nc,
                level == 0,
                innermost,
                config.norm,
                dropout,
                vb.pp(format!("level{level}")),
            )?);
        }
        Ok(Self { config, levels })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }
}

impl ModuleT for UnetGenerator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_channels("unet_generator", xs, self.config.input_nc)?;
        expect_divisible("unet_generator", xs, 1 << self.config.num_downs)?;
        let mut skips = Vec::with_capacity(self.levels.len());
        let mut hidden = xs.clone();
        for level in &self.levels {
            skips.push(hidden.clone());
            hidden = level.down(&hidden, train)?;
        }
        for (level, skip) in self.levels.iter().zip(skips.iter()).rev() {
            hidden = level.up(&hidden, train)?;
            if !level.outermost {
                hidden = Tensor::cat(&[skip, &hidden], 1)?;
            }
        }
        Ok(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn resnet_generator_keeps_resolution() -> Result<()> {
        let varmap = VarMap::new();
        let mut config = GeneratorConfig::new(5, 3);
        config.nf = 8;
        config.n_blocks = 2;
        let net = ResnetGenerator::new(config, vb(&varmap))?;
        let xs = Tensor::randn(0f32, 1.0, (2, 5, 16, 12), &Device::Cpu)?;
        let out = net.forward_t(&xs, true)?;
        assert_eq!(out.dims(), &[2, 3, 16, 12]);
        assert!(out.abs()?.max_all()?.to_vec0::<f32>()? <= 1.0);
        Ok(())
    }

    #[test]
    fn unet_generator_keeps_resolution() -> Result<()> {
        let varmap = VarMap::new();
        let mut config = GeneratorConfig::new(4, 3);
        config.nf = 4;
        config.num_downs = 6;
        config.norm = NormKind::Batch;
        config.use_dropout = true;
        let net = UnetGenerator::new(config, vb(&varmap))?;
        let xs = Tensor::randn(0f32, 1.0, (2, 4, 64, 64), &Device::Cpu)?;
        assert_eq!(net.forward_t(&xs, true)?.dims(), &[2, 3, 64, 64]);
        let odd = Tensor::randn(0f32, 1.0, (1, 4, 48, 64), &Device::Cpu)?;
        assert!(net.forward_t(&odd, false).is_err());
        Ok(())
    }

    #[test]
    fn conditioned_generator_accepts_map_condition() -> Result<()> {
        let varmap = VarMap::new();
        let mut base = GeneratorConfig::new(3, 3);
        base.nf = 4;
        base.n_blocks = 3;
        let config = ConditionedGeneratorConfig {
            base,
            condition_nc: 6,
            condition_layer: ConditionLayer::All,
        };
        let net = ConditionedResnetGenerator::new(config, vb(&varmap))?;
        let xs = Tensor::zeros((2, 3, 16, 16), DType::F32, &Device::Cpu)?;
        let c = Tensor::ones((2, 6, 8, 8), DType::F32, &Device::Cpu)?;
        assert_eq!(net.forward_c(&xs, &c, true)?.dims(), &[2, 3, 16, 16]);
        let bad = Tensor::ones((2, 5), DType::F32, &Device::Cpu)?;
        assert!(net.forward_c(&xs, &bad, true).is_err());
        Ok(())
    }
}
