//! Multimodal designer GAN.
//!
//! A shape representation (landmarks, segmentation and/or edges) is both the
//! generator input and the guide of three encoders. Edge and color features
//! are merged with the shape feature into the condition map of a conditioned
//! ResNet generator, either by concatenation, by a guided fusion stack, or by
//! feature-transfer networks that move features from an augmented frame back
//! into the frame of the shape.

use candle_core::{DType, Device, Tensor};
use candle_nn::{ModuleT, VarMap};
use model::{
    config::{FeatureFusionConfig, FeatureTransConfig, FusionKind, ImageEncoderConfig},
    fusion::align_and_concat,
    registry, ConditionedGeneratorConfig, ConditionedModule, FeatureFusionNetwork,
    FeatureTransNetwork, ImageEncoder, Network, Vgg19,
};

use super::{
    build_groups,
    common::{
        backward_and_step, generator_config, image_errors, load_vgg, reconstruction_terms, scalar,
        Adversary, LossSum, Result,
    },
    ExecutionPlan, Pipeline, TrainableGroup,
};
use crate::{
    data::Batch,
    loss::l1_loss,
    metrics::Errors,
    visualization::{Visual, VisualKind},
    TrainingConfig, TrainingError,
};

/// Edge or color encoder with its optional transfer network.
struct Branch {
    field: &'static str,
    shape_guided: bool,
    encoder: Network<ImageEncoder>,
    trans: Option<Network<FeatureTransNetwork>>,
}

impl Branch {
    /// Encodes `<field><suffix>`, next to the shape representation when the
    /// branch is shape guided.
    fn encode(&self, batch: &Batch, shape_repr: &Tensor, suffix: &str, train: bool) -> Result<Tensor> {
        let map = batch.get(&format!("{}{suffix}", self.field))?;
        let input = if self.shape_guided {
            Tensor::cat(&[map, shape_repr], 1)?
        } else {
            map.clone()
        };
        Ok(self.encoder.module().forward_t(&input, train)?)
    }
}

struct DesignerOutput {
    shape_repr: Tensor,
    img_out: Tensor,
    /// `(transferred, directly encoded)` feature pairs of the trans mode.
    feat_pairs: Vec<(Tensor, Tensor)>,
}

pub struct DesignerPipeline {
    plan: ExecutionPlan,
    shape_fields: &'static [&'static str],
    fusion: FusionKind,
    affine_aug: bool,
    d_cond: bool,
    test_mode: bool,
    shape_encoder: Network<ImageEncoder>,
    edge: Option<Branch>,
    color: Option<Branch>,
    fusion_net: Option<Network<FeatureFusionNetwork>>,
    net_g: Network<Box<dyn ConditionedModule>>,
    adversary: Option<Adversary>,
    vgg: Option<Vgg19>,
    groups: Vec<TrainableGroup>,
}

impl DesignerPipeline {
    pub fn new(config: &TrainingConfig, plan: ExecutionPlan, device: &Device) -> Result<Self> {
        let opt = &config.designer;
        let norm = config.model.norm_kind()?;
        let fusion = opt.fusion()?;
        let shape_nc = opt.shape_encode.channels();
        let encoder = |name: &str, input_nc: usize, nof: usize, n_downsample: usize| {
            let cfg = ImageEncoderConfig {
                input_nc,
                nf: opt.encoder_nf,
                max_nf: opt.encoder_max_nf,
                nof,
                n_downsample,
                norm,
            };
            Network::build(name, DType::F32, device, |vb| ImageEncoder::new(cfg, vb))
        };
        let trans = |name: &str, feat_nc: usize| -> Result<Option<Network<FeatureTransNetwork>>> {
            if fusion != FusionKind::Trans {
                return Ok(None);
            }
            let cfg = FeatureTransConfig {
                feat_nc,
                guide_nc: opt.shape_nof,
                nblocks: opt.mid_nblocks,
                ndowns: opt.mid_ndowns,
                norm,
            };
            Ok(Some(Network::build(name, DType::F32, device, |vb| {
                FeatureTransNetwork::new(cfg, vb)
            })?))
        };

        let shape_encoder = encoder("shape_encoder", shape_nc, opt.shape_nof, opt.shape_ndowns)?;
        let guided_nc = |guided: bool| if guided { shape_nc } else { 0 };
        let edge = if opt.use_edge {
            Some(Branch {
                field: "edge_map",
                shape_guided: opt.edge_shape_guided,
                encoder: encoder(
                    "edge_encoder",
                    1 + guided_nc(opt.edge_shape_guided),
                    opt.edge_nof,
                    opt.edge_ndowns,
                )?,
                trans: trans("edge_trans_net", opt.edge_nof)?,
            })
        } else {
            None
        };
        let color = if opt.use_color {
            Some(Branch {
                field: "color_map",
                shape_guided: opt.color_shape_guided,
                encoder: encoder(
                    "color_encoder",
                    3 + guided_nc(opt.color_shape_guided),
                    opt.color_nof,
                    opt.color_ndowns,
                )?,
                trans: trans("color_trans_net", opt.color_nof)?,
            })
        } else {
            None
        };

        let branch_nc: usize = [(opt.use_edge, opt.edge_nof), (opt.use_color, opt.color_nof)]
            .iter()
            .filter(|(used, _)| *used)
            .map(|(_, nof)| nof)
            .sum();
        let fusion_net = if fusion == FusionKind::Fusion {
            let cfg = FeatureFusionConfig {
                feat_nc: branch_nc,
                guide_nc: opt.shape_nof,
                output_nc: branch_nc + opt.shape_nof,
                nblocks: opt.mid_nblocks,
                norm,
            };
            Some(Network::build("fusion_net", DType::F32, device, |vb| {
                FeatureFusionNetwork::new(cfg, vb)
            })?)
        } else {
            None
        };

        let generator = ConditionedGeneratorConfig {
            base: generator_config(config, shape_nc, 3, opt.g_nf, opt.g_nblocks)?,
            condition_nc: opt.shape_nof + branch_nc,
            condition_layer: opt.condition()?,
        };
        let net_g = Network::build("netG", DType::F32, device, |vb| {
            registry::conditioned_generators().build(&opt.which_model_g, &generator, vb)
        })?;

        let adversary = if plan.discriminator_step {
            let cond_nc = if config.gan.d_cond { shape_nc } else { 0 };
            Some(Adversary::new(config, 3 + cond_nc, device)?)
        } else {
            None
        };
        let vgg = load_vgg(config, device)?;

        let mut pipeline = Self {
            plan,
            shape_fields: opt.shape_encode.fields(),
            fusion,
            affine_aug: config.data.affine_aug,
            d_cond: config.gan.d_cond,
            test_mode: !config.is_train,
            shape_encoder,
            edge,
            color,
            fusion_net,
            net_g,
            adversary,
            vgg,
            groups: Vec::new(),
        };
        let groups = build_groups(&pipeline.plan, &pipeline.networks(), config)?;
        pipeline.groups = groups;
        Ok(pipeline)
    }

    fn shape_repr(&self, batch: &Batch, suffix: &str) -> Result<Tensor> {
        let parts = self
            .shape_fields
            .iter()
            .map(|field| batch.get(&format!("{field}{suffix}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, 1)?)
    }

    fn generate(&self, batch: &Batch, train: bool) -> Result<DesignerOutput> {
        let shape_repr = self.shape_repr(batch, "")?;
        let shape_feat = self.shape_encoder.module().forward_t(&shape_repr, train)?;
        let (_, _, h, w) = shape_feat.dims4()?;

        let augmented = if train && self.affine_aug && self.fusion == FusionKind::Trans {
            let repr = self.shape_repr(batch, "_aug")?;
            let feat = self.shape_encoder.module().forward_t(&repr, train)?;
            Some((repr, feat))
        } else {
            None
        };

        let mut branch_feats = Vec::new();
        let mut feat_pairs = Vec::new();
        for branch in [&self.edge, &self.color].into_iter().flatten() {
            let direct = align_and_concat(&[&branch.encode(batch, &shape_repr, "", train)?], h, w)?;
            let feat = match &branch.trans {
                Some(trans) => {
                    let (source, in_guide) = match &augmented {
                        Some((repr, feat)) => (
                            align_and_concat(&[&branch.encode(batch, repr, "_aug", train)?], h, w)?,
                            feat.clone(),
                        ),
                        None => (direct.clone(), shape_feat.clone()),
                    };
                    let transferred = trans.module().forward(&source, &in_guide, &shape_feat, train)?;
                    feat_pairs.push((transferred.clone(), direct.detach()));
                    transferred
                }
                None => direct,
            };
            branch_feats.push(feat);
        }

        let condition = match (&self.fusion_net, self.fusion) {
            (Some(net), FusionKind::Fusion) => {
                let refs: Vec<&Tensor> = branch_feats.iter().collect();
                let feat = align_and_concat(&refs, h, w)?;
                net.module().forward(&feat, &shape_feat, train)?
            }
            _ => {
                let mut refs = vec![&shape_feat];
                refs.extend(branch_feats.iter());
                align_and_concat(&refs, h, w)?
            }
        };
        let img_out = self.net_g.forward_c(&shape_repr, &condition, train)?;
        Ok(DesignerOutput {
            shape_repr,
            img_out,
            feat_pairs,
        })
    }

    fn feat_loss(pairs: &[(Tensor, Tensor)]) -> Result<Tensor> {
        let mut sum = LossSum::default();
        for (transferred, direct) in pairs {
            sum.add(&l1_loss(transferred, direct)?, 1.0)?;
        }
        sum.into_inner()
            .ok_or_else(|| TrainingError::runtime("feature loss needs a transferred branch"))
    }
}

impl Pipeline for DesignerPipeline {
    fn name(&self) -> &'static str {
        "designer"
    }

    fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    fn networks(&self) -> Vec<(&str, &VarMap)> {
        let mut networks: Vec<(&str, &VarMap)> =
            vec![("shape_encoder", self.shape_encoder.varmap())];
        for branch in [&self.edge, &self.color].into_iter().flatten() {
            networks.push((branch.encoder.name(), branch.encoder.varmap()));
        }
        if let Some(net) = &self.fusion_net {
            networks.push(("fusion_net", net.varmap()));
        }
        networks.push(("netG", self.net_g.varmap()));
        for branch in [&self.edge, &self.color].into_iter().flatten() {
            if let Some(trans) = &branch.trans {
                networks.push((trans.name(), trans.varmap()));
            }
        }
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
        let out = self.generate(batch, true)?;
        let target = batch.get("img")?;
        let condition = self.d_cond.then(|| out.shape_repr.clone());
        let mut errors = Errors::new();
        image_errors(&mut errors, &out.img_out, target, false)?;

        let gan_weight = self.plan.weight("gan");
        let mut loss_d = None;
        if let Some(adversary) = self.adversary.as_mut() {
            let fake = Adversary::input(&out.img_out.detach(), condition.as_ref())?;
            let real = Adversary::input(target, condition.as_ref())?;
            let loss = adversary.discriminator_loss(&fake, &real)?;
            loss_d = Some(scalar(&loss)?);
            let mut total = LossSum::default();
            total.add(&loss, gan_weight)?;
            backward_and_step(total.into_inner(), &mut self.groups, &["D"])?;
        }

        let mut total = LossSum::default();
        reconstruction_terms(&self.plan, self.vgg.as_ref(), &out.img_out, target, &mut total, &mut errors)?;
        if self.plan.uses("feat") {
            let loss = Self::feat_loss(&out.feat_pairs)?;
            errors.insert("loss_feat", scalar(&loss)?);
            total.add(&loss, self.plan.weight("feat"))?;
        }
        if let Some(adversary) = self.adversary.as_mut() {
            let loss_g = adversary.generator_loss(&Adversary::input(&out.img_out, condition.as_ref())?)?;
            errors.insert("loss_G", scalar(&loss_g)?);
            total.add(&loss_g, gan_weight)?;
        }
        backward_and_step(total.into_inner(), &mut self.groups, &["G", "FTN"])?;
        if let Some(loss_d) = loss_d {
            errors.insert("loss_D", loss_d);
        }
        Ok(errors)
    }

    fn evaluate(&mut self, batch: &Batch, compute_loss: bool) -> Result<Errors> {
        let out = self.generate(batch, false)?;
        let img_out = out.img_out.detach();
        let target = batch.get("img")?;
        let mut errors = Errors::new();
        image_errors(&mut errors, &img_out, target, self.test_mode)?;
        if compute_loss {
            let mut total = LossSum::default();
            reconstruction_terms(&self.plan, self.vgg.as_ref(), &img_out, target, &mut total, &mut errors)?;
            if self.plan.uses("feat") {
                errors.insert("loss_feat", scalar(&Self::feat_loss(&out.feat_pairs)?)?);
            }
        }
        Ok(errors)
    }

    fn visuals(&mut self, batch: &Batch) -> Result<Vec<Visual>> {
        let out = self.generate(batch, false)?;
        self.plan
            .visuals
            .iter()
            .map(|&name| {
                let (tensor, kind) = match name {
                    "img_out" => (out.img_out.detach(), VisualKind::Rgb),
                    "seg_mask" => (batch.get(name)?.clone(), VisualKind::Seg),
                    "lm_map" => (batch.get(name)?.clone(), VisualKind::Pose),
                    _ => (batch.get(name)?.clone(), VisualKind::Rgb),
                };
                Ok(Visual::new(name, tensor, kind))
            })
            .collect()
    }

    fn output_images(&mut self, batch: &Batch) -> Result<Option<Tensor>> {
        Ok(Some(self.generate(batch, false)?.img_out.detach()))
    }
}
