//! Attribute encoder training and ranking evaluation.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use layers::InitKind;
use model::{
    config::LandmarkBranchConfig, pose::N_JOINTS, AttributeEncoder, AttributeEncoderConfig,
    Network,
};

use super::{
    build_groups,
    common::{backward_and_step, scalar, LossSum, Result},
    ExecutionPlan, Pipeline, TrainableGroup,
};
use crate::{
    data::{attribute::positive_rate, Batch},
    loss::{binary_cross_entropy, CrossEntropyLoss, WeightedBceLoss},
    metrics::{ClassificationAccuracy, Errors, MeanAp},
    visualization::{Visual, VisualKind},
    TrainingConfig,
};

pub struct AttributePipeline {
    plan: ExecutionPlan,
    net: Network<AttributeEncoder>,
    input_lm: bool,
    top_k: Vec<usize>,
    /// Absent at test time, where plain BCE is reported instead.
    bce: Option<WeightedBceLoss>,
    cross_entropy: CrossEntropyLoss,
    mean_ap: MeanAp,
    category: ClassificationAccuracy,
    groups: Vec<TrainableGroup>,
}

impl AttributePipeline {
    pub fn new(config: &TrainingConfig, plan: ExecutionPlan, device: &Device) -> Result<Self> {
        let opt = &config.attribute;
        let mut encoder = AttributeEncoderConfig::new(opt.backbone()?, opt.pool()?, opt.n_attr);
        encoder.n_cat = opt.n_cat;
        encoder.feat_norm = opt.feat_norm;
        encoder.backbone_weights = opt.backbone_weights.clone();
        if opt.input_lm {
            encoder.landmark = Some(LandmarkBranchConfig {
                input_nc: N_JOINTS,
                output_nc: opt.lm_output_nc,
                fusion: opt.landmark_fusion()?,
            });
        }
        let net = Network::build("netAE", DType::F32, device, |vb| {
            AttributeEncoder::new(encoder, vb)
        })?;

        let bce = if config.is_train {
            let rate = positive_rate(&config.data)?;
            Some(WeightedBceLoss::new(&rate, opt.class_norm, device)?)
        } else {
            None
        };
        let groups = build_groups(&plan, &[("netAE", net.varmap())], config)?;
        Ok(Self {
            plan,
            net,
            input_lm: opt.input_lm,
            top_k: opt.top_k.clone(),
            bce,
            cross_entropy: CrossEntropyLoss::new(),
            mean_ap: MeanAp::new(),
            category: ClassificationAccuracy::new(),
            groups,
        })
    }

    /// Attribute and category terms of one batch, weighted into `total`.
    fn losses(
        &self,
        batch: &Batch,
        train: bool,
        errors: &mut Errors,
        total: &mut LossSum,
    ) -> Result<model::AttributeOutput> {
        let lm = if self.input_lm {
            Some(batch.get("lm_map")?)
        } else {
            None
        };
        let out = self.net.module().forward(batch.get("img")?, lm, train)?;
        let label = batch.get("attr_label")?;

        let loss_attr = match &self.bce {
            Some(bce) => bce.compute(&out.prob, label)?,
            None => binary_cross_entropy(&out.prob, label)?,
        };
        errors.insert("loss_attr", scalar(&loss_attr)?);
        total.add(&loss_attr, self.plan.weight("attr"))?;

        if let (Some(logits), true) = (&out.category, self.plan.uses("category")) {
            let loss_cat = self.cross_entropy.compute(logits, batch.get("cat_label")?)?;
            errors.insert("loss_cat", scalar(&loss_cat)?);
            total.add(&loss_cat, self.plan.weight("category"))?;
        }
        Ok(out)
    }
}

impl Pipeline for AttributePipeline {
    fn name(&self) -> &'static str {
        "attribute"
    }

    fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    fn networks(&self) -> Vec<(&str, &VarMap)> {
        vec![("netAE", self.net.varmap())]
    }

    fn groups(&self) -> &[TrainableGroup] {
        &self.groups
    }

    fn groups_mut(&mut self) -> &mut [TrainableGroup] {
        &mut self.groups
    }

    /// Keeps pretrained backbone weights and the noisy-OR bias.
    fn init_weights(&self, kind: InitKind) -> Result<()> {
        Ok(self.net.module().init_weights(self.net.varmap(), kind)?)
    }

    fn train_step(&mut self, batch: &Batch) -> Result<Errors> {
        let mut errors = Errors::new();
        let mut total = LossSum::default();
        self.losses(batch, true, &mut errors, &mut total)?;
        backward_and_step(total.into_inner(), &mut self.groups, &["AE"])?;
        Ok(errors)
    }

    fn evaluate(&mut self, batch: &Batch, compute_loss: bool) -> Result<Errors> {
        let mut errors = Errors::new();
        let mut total = LossSum::default();
        let out = self.losses(batch, false, &mut errors, &mut total)?;
        self.mean_ap.add(&out.prob.detach(), batch.get("attr_label")?)?;
        if let (Some(logits), Some(label)) = (&out.category, batch.try_get("cat_label")) {
            self.category.add(&logits.detach(), label)?;
        }
        if !compute_loss {
            errors = Errors::new();
        }
        Ok(errors)
    }

    fn begin_test(&mut self) {
        self.mean_ap.clear();
        self.category.clear();
    }

    fn finish_test(&mut self) -> Result<Errors> {
        let mut errors = Errors::new();
        if self.mean_ap.is_empty() {
            return Ok(errors);
        }
        errors.insert("mAP", self.mean_ap.compute_mean_ap().0);
        errors.insert("BP", self.mean_ap.compute_balanced_precision().0);
        for &k in &self.top_k {
            let recall = self.mean_ap.compute_recall(k);
            errors.insert(&format!("rec@{k}"), recall.class_avg);
            errors.insert(&format!("rec@{k}_overall"), recall.overall);
            errors.insert(&format!("rec@{k}_sample"), self.mean_ap.compute_recall_sample_avg(k));
        }
        if self.plan.uses("category") {
            errors.insert("cat_acc", self.category.compute_accuracy(1));
            for &k in self.top_k.iter().filter(|&&k| k > 1) {
                errors.insert(&format!("cat_acc@{k}"), self.category.compute_accuracy(k));
            }
        }
        Ok(errors)
    }

    fn visuals(&mut self, batch: &Batch) -> Result<Vec<Visual>> {
        let mut visuals = vec![Visual::new("img", batch.get("img")?.clone(), VisualKind::Rgb)];
        if let Some(lm) = batch.try_get("lm_map") {
            visuals.push(Visual::new("lm_map", lm.clone(), VisualKind::Pose));
        }
        Ok(visuals)
    }

    fn output_images(&mut self, _batch: &Batch) -> Result<Option<Tensor>> {
        Ok(None)
    }
}
