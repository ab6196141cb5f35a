//! Coarse-to-fine pose transfer on top of a trained single-stage model.
//!
//! Stage 1 (`netT_s1`) is rebuilt from the `train_opt.json` of the run named
//! by `two_stage.stage_1_id` and starts from that run's `latest_net_netT`.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use layers::{init, InitKind};
use model::{
    patch::extract_patches,
    pose::AppearanceType,
    two_stage::TwoStageOutput,
    PoseType, TwoStageConfig, TwoStageGenerator, Vgg19,
};

use super::{
    build_groups,
    common::{
        appearance_of, backward_and_step, build_generator, generator_config, image_errors,
        load_vgg, pose_of, reconstruction_terms, scalar, sides, Adversary, LossSum, Result,
    },
    ExecutionPlan, Pipeline, TrainableGroup,
};
use crate::{
    checkpoint::CheckpointStore,
    config::PreservedOptions,
    data::Batch,
    metrics::Errors,
    visualization::{Visual, VisualKind},
    TrainingConfig, TrainingError,
};

pub struct TwoStagePipeline {
    plan: ExecutionPlan,
    /// Encodings stage 1 was trained with.
    pose: PoseType,
    appearance: AppearanceType,
    supervised: bool,
    d_cond: bool,
    test_mode: bool,
    stage_1_store: CheckpointStore,
    generator: TwoStageGenerator,
    adversary: Option<Adversary>,
    vgg: Option<Vgg19>,
    groups: Vec<TrainableGroup>,
}

impl TwoStagePipeline {
    pub fn new(config: &TrainingConfig, plan: ExecutionPlan, device: &Device) -> Result<Self> {
        let store =
            CheckpointStore::resolve(&config.runtime.checkpoints_dir, &config.two_stage.stage_1_id);
        let stage_1_config = TrainingConfig::from_train_opt(
            store.options_path(),
            PreservedOptions {
                devices: config.runtime.devices.clone(),
                batch_size: config.data.batch_size,
                is_train: false,
            },
        )?;
        let s1 = &stage_1_config.pose_transfer;
        let pose = s1.pose()?;
        let appearance = s1.appearance()?;
        let s1_generator = generator_config(
            &stage_1_config,
            appearance.dim() + pose.dim(),
            3,
            s1.t_nf,
            s1.t_nblocks,
        )?;
        let stage_1 = build_generator("netT_s1", &s1.which_model_t, &s1_generator, device)?;
        log::info!(
            "stage 1 from {}: {} ({} -> {})",
            store.dir().display(),
            s1.which_model_t,
            appearance.as_str(),
            pose
        );

        let opt = &config.two_stage;
        let two_stage = TwoStageConfig {
            patch_indices: opt.patch_indices.clone(),
            patch_size: opt.patch_size,
            local_nof: opt.s2e_nof,
            local_nf: opt.s2e_nf,
            local_max_nf: opt.s2e_max_nf,
            decoder: opt.which_model_s2d.clone(),
            decoder_config: generator_config(config, 3 + opt.s2e_nof, 3, opt.s2d_nf, opt.s2d_nblocks)?,
            train_stage_1: opt.train_s1,
        };
        let generator = TwoStageGenerator::new(two_stage, stage_1, DType::F32, device)?;

        let adversary = if plan.discriminator_step {
            let cond_nc = if config.gan.d_cond { pose.dim() } else { 0 };
            Some(Adversary::new(config, 3 + cond_nc, device)?)
        } else {
            None
        };
        let vgg = load_vgg(config, device)?;

        let mut networks = generator_networks(&generator);
        if let Some(adversary) = &adversary {
            networks.push(("netD", adversary.network().varmap()));
        }
        let groups = build_groups(&plan, &networks, config)?;
        Ok(Self {
            plan,
            pose,
            appearance,
            supervised: config.pose_transfer.supervised,
            d_cond: config.gan.d_cond,
            test_mode: !config.is_train,
            stage_1_store: store,
            generator,
            adversary,
            vgg,
            groups,
        })
    }

    fn generate(&self, batch: &Batch, train: bool) -> Result<(TwoStageOutput, &'static str)> {
        let (reference, target) = sides(self.supervised, train);
        let appearance = appearance_of(batch, self.appearance, reference)?;
        let pose = pose_of(batch, &self.pose, target)?;
        let input = Tensor::cat(&[appearance, &pose], 1)?;
        let out = self.generator.forward(
            &input,
            batch.get(&format!("img_{reference}"))?,
            batch.get(&format!("joint_c_{reference}"))?,
            batch.get(&format!("joint_{target}"))?,
            train,
        )?;
        Ok((out, target))
    }

    /// Style distance between patches of the output and of the target around
    /// the target joints; missing target joints give blank patches.
    fn patch_style_loss(&self, batch: &Batch, out: &Tensor, side: &str) -> Result<Tensor> {
        let vgg = self
            .vgg
            .as_ref()
            .ok_or_else(|| TrainingError::runtime("patch style loss needs vgg19"))?;
        let config = self.generator.config();
        let (out_patches, tar_patches) = style_patches(
            out,
            batch.get(&format!("img_{side}"))?,
            batch.get(&format!("joint_c_{side}"))?,
            config.patch_size,
            &config.patch_indices,
        )?;
        Ok(vgg.style_loss(&out_patches, &tar_patches)?)
    }

    fn generator_terms(
        &mut self,
        batch: &Batch,
        out: &TwoStageOutput,
        side: &str,
        condition: Option<&Tensor>,
        errors: &mut Errors,
    ) -> Result<LossSum> {
        let target = batch.get(&format!("img_{side}"))?;
        let mut total = LossSum::default();
        reconstruction_terms(&self.plan, self.vgg.as_ref(), &out.img_out, target, &mut total, errors)?;
        if self.plan.uses("patch_style") {
            let loss = self.patch_style_loss(batch, &out.img_out, side)?;
            errors.insert("loss_patch_style", scalar(&loss)?);
            total.add(&loss, self.plan.weight("patch_style"))?;
        }
        if let Some(adversary) = self.adversary.as_mut() {
            let loss_g = adversary.generator_loss(&Adversary::input(&out.img_out, condition)?)?;
            errors.insert("loss_G", scalar(&loss_g)?);
            total.add(&loss_g, self.plan.weight("gan"))?;
        }
        Ok(total)
    }
}

/// Paired patches of `out` and `target` cut at the same target coordinates,
/// stacked joint-major along the batch axis.
fn style_patches(
    out: &Tensor,
    target: &Tensor,
    joint_c_tar: &Tensor,
    patch_size: usize,
    indices: &[usize],
) -> Result<(Tensor, Tensor)> {
    let out_patches = extract_patches(out, joint_c_tar, patch_size, indices)?;
    let tar_patches = extract_patches(target, joint_c_tar, patch_size, indices)?;
    Ok((Tensor::cat(&out_patches, 0)?, Tensor::cat(&tar_patches, 0)?))
}

fn generator_networks(generator: &TwoStageGenerator) -> Vec<(&str, &VarMap)> {
    vec![
        ("netT_s1", generator.stage_1().varmap()),
        ("netT_s2e", generator.encoder().varmap()),
        ("netT_s2d", generator.decoder().varmap()),
    ]
}

impl Pipeline for TwoStagePipeline {
    fn name(&self) -> &'static str {
        "two_stage"
    }

    fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    fn networks(&self) -> Vec<(&str, &VarMap)> {
        let mut networks = generator_networks(&self.generator);
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

    /// Fresh stage 2 networks; stage 1 always starts from its own run.
    fn init_weights(&self, kind: InitKind) -> Result<()> {
        for (name, varmap) in self.networks() {
            if name != "netT_s1" {
                init::init_varmap(varmap, kind)?;
            }
        }
        self.stage_1_store
            .load_network("latest", "netT", self.generator.stage_1().varmap())
    }

    fn train_step(&mut self, batch: &Batch) -> Result<Errors> {
        let (out, side) = self.generate(batch, true)?;
        let target = batch.get(&format!("img_{side}"))?.clone();
        let condition = if self.d_cond {
            Some(pose_of(batch, &self.pose, side)?)
        } else {
            None
        };
        let mut errors = Errors::new();
        image_errors(&mut errors, &out.img_out, &target, false)?;

        let mut loss_d = None;
        if let Some(adversary) = self.adversary.as_mut() {
            let fake = Adversary::input(&out.img_out.detach(), condition.as_ref())?;
            let real = Adversary::input(&target, condition.as_ref())?;
            let loss = adversary.discriminator_loss(&fake, &real)?;
            loss_d = Some(scalar(&loss)?);
            let mut total = LossSum::default();
            total.add(&loss, self.plan.weight("gan"))?;
            backward_and_step(total.into_inner(), &mut self.groups, &["D"])?;
        }

        let total = self.generator_terms(batch, &out, side, condition.as_ref(), &mut errors)?;
        backward_and_step(total.into_inner(), &mut self.groups, &["G", "S1"])?;
        if let Some(loss_d) = loss_d {
            errors.insert("loss_D", loss_d);
        }
        Ok(errors)
    }

    fn evaluate(&mut self, batch: &Batch, compute_loss: bool) -> Result<Errors> {
        let (out, side) = self.generate(batch, false)?;
        let target = batch.get(&format!("img_{side}"))?;
        let mut errors = Errors::new();
        image_errors(&mut errors, &out.img_out, target, self.test_mode)?;
        if compute_loss {
            let mut total = LossSum::default();
            let img_out = out.img_out.detach();
            reconstruction_terms(&self.plan, self.vgg.as_ref(), &img_out, target, &mut total, &mut errors)?;
            if self.plan.uses("patch_style") {
                let loss = self.patch_style_loss(batch, &img_out, side)?;
                errors.insert("loss_patch_style", scalar(&loss)?);
            }
        }
        Ok(errors)
    }

    fn visuals(&mut self, batch: &Batch) -> Result<Vec<Visual>> {
        let (out, side) = self.generate(batch, false)?;
        let img_s1 = out.img_s1.detach();
        let img_out = out.img_out.detach();
        let residual = (&img_out - &img_s1)?;
        Ok(vec![
            Visual::new("img_ref", batch.get("img_1")?.clone(), VisualKind::Rgb),
            Visual::new("joint_tar", batch.get(&format!("joint_{side}"))?.clone(), VisualKind::Pose),
            Visual::new("stickman_tar", batch.get(&format!("stickman_{side}"))?.clone(), VisualKind::Rgb),
            Visual::new("img_tar", batch.get(&format!("img_{side}"))?.clone(), VisualKind::Rgb),
            Visual::new("img_out_s1", img_s1, VisualKind::Rgb),
            Visual::new("img_out", img_out, VisualKind::Rgb),
            Visual::new("img_out_res", residual, VisualKind::Rgb),
        ])
    }

    fn output_images(&mut self, batch: &Batch) -> Result<Option<Tensor>> {
        Ok(Some(self.generate(batch, false)?.0.img_out.detach()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn style_patches_follow_target_joints() -> Result<()> {
        let device = Device::Cpu;
        let out = Tensor::ones((2, 3, 16, 16), DType::F32, &device)?;
        let target = out.affine(2.0, 0.0)?;
        // Sample 0 has both joints, sample 1 lacks joint 1 on the target.
        let joint_c_tar = Tensor::from_slice(
            &[4f32, 4.0, 8.0, 8.0, 6.0, 6.0, -1.0, -1.0],
            (2, 2, 2),
            &device,
        )?;
        let (out_patches, tar_patches) = style_patches(&out, &target, &joint_c_tar, 4, &[0, 1])?;
        assert_eq!(out_patches.dims(), &[4, 3, 4, 4]);
        assert_eq!(tar_patches.dims(), &[4, 3, 4, 4]);

        let sums = out_patches.sum((1, 2, 3))?.to_vec1::<f32>()?;
        assert_eq!(sums, vec![48.0, 48.0, 48.0, 0.0]);
        let sums = tar_patches.sum((1, 2, 3))?.to_vec1::<f32>()?;
        assert_eq!(sums, vec![96.0, 96.0, 96.0, 0.0]);
        Ok(())
    }
}
