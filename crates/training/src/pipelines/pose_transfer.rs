//! Single-stage pose transfer: `netT(cat(appearance_1, pose_2)) -> img_2`.

use candle_core::{Device, Tensor};
use candle_nn::{ModuleT, VarMap};
use model::{pose::AppearanceType, Network, PoseType, Vgg19};

use super::{
    build_groups,
    common::{
        appearance_of, backward_and_step, build_generator, generator_config, image_errors,
        load_vgg, pose_of, reconstruction_terms, scalar, sides, Adversary, LossSum, Result,
    },
    ExecutionPlan, Pipeline, TrainableGroup,
};
use crate::{
    data::Batch,
    metrics::Errors,
    visualization::{Visual, VisualKind},
    TrainingConfig,
};

pub struct PoseTransferPipeline {
    plan: ExecutionPlan,
    pose: PoseType,
    appearance: AppearanceType,
    supervised: bool,
    d_cond: bool,
    test_mode: bool,
    net_t: Network<Box<dyn ModuleT>>,
    adversary: Option<Adversary>,
    vgg: Option<Vgg19>,
    groups: Vec<TrainableGroup>,
}

impl PoseTransferPipeline {
    pub fn new(config: &TrainingConfig, plan: ExecutionPlan, device: &Device) -> Result<Self> {
        let opt = &config.pose_transfer;
        let pose = opt.pose()?;
        let appearance = opt.appearance()?;
        let generator = generator_config(
            config,
            appearance.dim() + pose.dim(),
            3,
            opt.t_nf,
            opt.t_nblocks,
        )?;
        let net_t = build_generator("netT", &opt.which_model_t, &generator, device)?;
        let adversary = if plan.discriminator_step {
            let cond_nc = if config.gan.d_cond { pose.dim() } else { 0 };
            Some(Adversary::new(config, 3 + cond_nc, device)?)
        } else {
            None
        };
        let vgg = load_vgg(config, device)?;

        let mut networks: Vec<(&str, &VarMap)> = vec![("netT", net_t.varmap())];
        if let Some(adversary) = &adversary {
            networks.push(("netD", adversary.network().varmap()));
        }
        let groups = build_groups(&plan, &networks, config)?;
        Ok(Self {
            plan,
            pose,
            appearance,
            supervised: opt.supervised,
            d_cond: config.gan.d_cond,
            test_mode: !config.is_train,
            net_t,
            adversary,
            vgg,
            groups,
        })
    }

    /// Generated image and the target side it should match.
    fn generate(&self, batch: &Batch, train: bool) -> Result<(Tensor, &'static str)> {
        let (reference, target) = sides(self.supervised, train);
        let appearance = appearance_of(batch, self.appearance, reference)?;
        let pose = pose_of(batch, &self.pose, target)?;
        let input = Tensor::cat(&[appearance, &pose], 1)?;
        Ok((self.net_t.forward_t(&input, train)?, target))
    }
}

impl Pipeline for PoseTransferPipeline {
    fn name(&self) -> &'static str {
        "pose_transfer"
    }

    fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    fn networks(&self) -> Vec<(&str, &VarMap)> {
        let mut networks: Vec<(&str, &VarMap)> = vec![("netT", self.net_t.varmap())];
        if let Some(adversary) = &self.adversary {
            networks.push(("netD", adversary.network().varmap()));
        }
        networks
    }

    fn groups(&self) -> &[TrainableGroup] {
        &self.groups
    }

    fn groups_mut(&mut self) -> &mut [TrainableGroup] {
        &mut self.groups
    }

    fn train_step(&mut self, batch: &Batch) -> Result<Errors> {
        let (out, side) = self.generate(batch, true)?;
        let target = batch.get(&format!("img_{side}"))?;
        let condition = if self.d_cond {
            Some(pose_of(batch, &self.pose, side)?)
        } else {
            None
        };
        let mut errors = Errors::new();
        image_errors(&mut errors, &out, target, false)?;

        let gan_weight = self.plan.weight("gan");
        if let Some(adversary) = self.adversary.as_mut() {
            let fake = Adversary::input(&out.detach(), condition.as_ref())?;
            let real = Adversary::input(target, condition.as_ref())?;
            let loss_d = adversary.discriminator_loss(&fake, &real)?;
            let mut total = LossSum::default();
            total.add(&loss_d, gan_weight)?;
            backward_and_step(total.into_inner(), &mut self.groups, &["D"])?;

            let mut total = LossSum::default();
            reconstruction_terms(&self.plan, self.vgg.as_ref(), &out, target, &mut total, &mut errors)?;
            let loss_g = adversary.generator_loss(&Adversary::input(&out, condition.as_ref())?)?;
            errors.insert("loss_G", scalar(&loss_g)?);
            errors.insert("loss_D", scalar(&loss_d)?);
            total.add(&loss_g, gan_weight)?;
            backward_and_step(total.into_inner(), &mut self.groups, &["G"])?;
        } else {
            let mut total = LossSum::default();
            reconstruction_terms(&self.plan, self.vgg.as_ref(), &out, target, &mut total, &mut errors)?;
            backward_and_step(total.into_inner(), &mut self.groups, &["G"])?;
        }
        Ok(errors)
    }

    fn evaluate(&mut self, batch: &Batch, compute_loss: bool) -> Result<Errors> {
        let (out, side) = self.generate(batch, false)?;
        let out = out.detach();
        let target = batch.get(&format!("img_{side}"))?;
        let mut errors = Errors::new();
        image_errors(&mut errors, &out, target, self.test_mode)?;
        if compute_loss {
            let mut total = LossSum::default();
            reconstruction_terms(&self.plan, self.vgg.as_ref(), &out, target, &mut total, &mut errors)?;
        }
        Ok(errors)
    }

    fn visuals(&mut self, batch: &Batch) -> Result<Vec<Visual>> {
        let (out, _) = self.generate(batch, false)?;
        Ok(vec![
            Visual::new("img_ref", batch.get("img_1")?.clone(), VisualKind::Rgb),
            Visual::new("joint_ref", batch.get("joint_1")?.clone(), VisualKind::Pose),
            Visual::new("joint_tar", batch.get("joint_2")?.clone(), VisualKind::Pose),
            Visual::new("img_tar", batch.get("img_2")?.clone(), VisualKind::Rgb),
            Visual::new("img_out", out.detach(), VisualKind::Rgb),
        ])
    }

    fn output_images(&mut self, batch: &Batch) -> Result<Option<Tensor>> {
        Ok(Some(self.generate(batch, false)?.0.detach()))
    }
}
