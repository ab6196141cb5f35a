//! Pieces shared by the image-generating pipelines.

use candle_core::{backprop::GradStore, DType, Device, Tensor};
use candle_nn::ModuleT;
use model::{
    pose::{AppearanceType, PoseType},
    registry, DiscriminatorConfig, GeneratorConfig, Network, Vgg19,
};

use crate::{
    config::GanKind,
    data::Batch,
    image_pool::ImagePool,
    loss::{l1_loss, GanLoss},
    metrics::{self, Errors},
    TrainingConfig, TrainingError,
};

use super::{ExecutionPlan, TrainableGroup};

pub(crate) type Result<T> = std::result::Result<T, TrainingError>;

pub(crate) fn scalar(tensor: &Tensor) -> Result<f64> {
    Ok(tensor.to_dtype(DType::F32)?.to_vec0::<f32>()? as f64)
}

/// Running weighted sum of loss terms.
#[derive(Default)]
pub(crate) struct LossSum(Option<Tensor>);

impl LossSum {
    pub fn add(&mut self, loss: &Tensor, weight: f64) -> Result<()> {
        let term = loss.affine(weight, 0.0)?;
        self.0 = Some(match self.0.take() {
            Some(total) => (total + term)?,
            None => term,
        });
        Ok(())
    }

    pub fn into_inner(self) -> Option<Tensor> {
        self.0
    }
}

/// Backpropagates `loss` and steps every group named in `names`.
pub(crate) fn backward_and_step(
    loss: Option<Tensor>,
    groups: &mut [TrainableGroup],
    names: &[&str],
) -> Result<()> {
    let Some(loss) = loss else {
        return Ok(());
    };
    let mut grads: GradStore = loss.backward()?;
    for group in groups.iter_mut().filter(|g| names.contains(&g.name.as_str())) {
        group.optimizer.step(&mut grads)?;
    }
    Ok(())
}

/// Suffixes of the reference and target side of a pose-transfer pair. An
/// unsupervised model in training reconstructs the reference image.
pub(crate) fn sides(supervised: bool, train: bool) -> (&'static str, &'static str) {
    if supervised || !train {
        ("1", "2")
    } else {
        ("1", "1")
    }
}

pub(crate) fn pose_of(batch: &Batch, pose: &PoseType, side: &str) -> Result<Tensor> {
    Ok(pose.compose(|name| {
        let field = match name {
            "seg" => format!("seg_mask_{side}"),
            other => format!("{other}_{side}"),
        };
        batch.try_get(&field)
    })?)
}

pub(crate) fn appearance_of<'a>(
    batch: &'a Batch,
    appearance: AppearanceType,
    side: &str,
) -> Result<&'a Tensor> {
    match appearance {
        AppearanceType::Image => batch.get(&format!("img_{side}")),
        AppearanceType::Limb => batch.get(&format!("limb_{side}")),
    }
}

pub(crate) fn generator_config(
    config: &TrainingConfig,
    input_nc: usize,
    output_nc: usize,
    nf: usize,
    n_blocks: usize,
) -> Result<GeneratorConfig> {
    let mut generator = GeneratorConfig::new(input_nc, output_nc);
    generator.nf = nf;
    generator.norm = config.model.norm_kind()?;
    generator.use_dropout = !config.model.no_dropout;
    generator.n_blocks = n_blocks;
    generator.num_downs = config.pose_transfer.t_ndowns;
    Ok(generator)
}

pub(crate) fn build_generator(
    name: &str,
    tag: &str,
    generator: &GeneratorConfig,
    device: &Device,
) -> Result<Network<Box<dyn ModuleT>>> {
    Ok(Network::build(name, DType::F32, device, |vb| {
        registry::generators().build(tag, generator, vb)
    })?)
}

/// VGG19 for the perceptual terms, when any of them is weighted.
pub(crate) fn load_vgg(config: &TrainingConfig, device: &Device) -> Result<Option<Vgg19>> {
    if !config.loss.needs_vgg() {
        return Ok(None);
    }
    let Some(path) = &config.loss.vgg_weights else {
        return Err(TrainingError::validation(vec![
            "loss.vgg_weights is required for perceptual losses".to_string(),
        ]));
    };
    log::info!("loading vgg19 weights from {}", path.display());
    Ok(Some(Vgg19::load(path, DType::F32, device)?))
}

/// PSNR, and SSIM when `with_ssim` (reported as zero otherwise).
pub(crate) fn image_errors(
    errors: &mut Errors,
    out: &Tensor,
    target: &Tensor,
    with_ssim: bool,
) -> Result<()> {
    let out = out.detach();
    errors.insert("PSNR", metrics::psnr(&out, target)?);
    let ssim = if with_ssim { metrics::ssim(&out, target)? } else { 0.0 };
    errors.insert("SSIM", ssim);
    Ok(())
}

/// Pixel and perceptual reconstruction terms shared by the generators.
pub(crate) fn reconstruction_terms(
    plan: &ExecutionPlan,
    vgg: Option<&Vgg19>,
    out: &Tensor,
    target: &Tensor,
    total: &mut LossSum,
    errors: &mut Errors,
) -> Result<()> {
    if plan.uses("l1") {
        let loss = l1_loss(out, target)?;
        errors.insert("loss_L1", scalar(&loss)?);
        total.add(&loss, plan.weight("l1"))?;
    }
    for (term, error) in [("content", "loss_content"), ("style", "loss_style")] {
        if !plan.uses(term) {
            continue;
        }
        let vgg = vgg.ok_or_else(|| TrainingError::runtime(format!("{term} loss needs vgg19")))?;
        let loss = if term == "content" {
            vgg.content_loss(out, target)?
        } else {
            vgg.style_loss(out, target)?
        };
        errors.insert(error, scalar(&loss)?);
        total.add(&loss, plan.weight(term))?;
    }
    Ok(())
}

/// `netD` with its loss and fake-image history.
pub(crate) struct Adversary {
    net: Network<Box<dyn ModuleT>>,
    gan_loss: GanLoss,
    pool: ImagePool,
}

impl Adversary {
    pub fn new(config: &TrainingConfig, input_nc: usize, device: &Device) -> Result<Self> {
        let mut disc = DiscriminatorConfig::new(input_nc);
        disc.nf = config.gan.d_nf;
        disc.n_layers = config.gan.d_n_layers;
        disc.norm = config.model.norm_kind()?;
        disc.use_sigmoid = config.gan.which_gan == GanKind::Dcgan;
        let net = Network::build("netD", DType::F32, device, |vb| {
            registry::discriminators().build(&config.gan.which_model_d, &disc, vb)
        })?;
        Ok(Self {
            net,
            gan_loss: GanLoss::new(config.gan.which_gan),
            pool: ImagePool::new(config.gan.pool_size, config.runtime.seed),
        })
    }

    pub fn network(&self) -> &Network<Box<dyn ModuleT>> {
        &self.net
    }

    /// Discriminator input: the image, optionally next to its condition.
    pub fn input(image: &Tensor, condition: Option<&Tensor>) -> Result<Tensor> {
        match condition {
            Some(condition) => Ok(Tensor::cat(&[image, condition], 1)?),
            None => Ok(image.clone()),
        }
    }

    /// Adversarial term of the generator: `D(fake)` against the real label.
    pub fn generator_loss(&mut self, fake: &Tensor) -> Result<Tensor> {
        let pred = self.net.forward_t(fake, true)?;
        self.gan_loss.compute(&pred, true)
    }

    /// `0.5 * (loss(D(pool(fake)), fake) + loss(D(real), real))`.
    pub fn discriminator_loss(&mut self, fake: &Tensor, real: &Tensor) -> Result<Tensor> {
        let fake = self.pool.query(&fake.detach())?;
        let pred_fake = self.net.forward_t(&fake, true)?;
        let loss_fake = self.gan_loss.compute(&pred_fake, false)?;
        let pred_real = self.net.forward_t(&real.detach(), true)?;
        let loss_real = self.gan_loss.compute(&pred_real, true)?;
        Ok(((loss_fake + loss_real)? * 0.5)?)
    }
}
