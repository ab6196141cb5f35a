//! Static description of what a pipeline trains and reports.
//!
//! Resolved once from the configuration, before any network is built, so
//! invalid combinations (a GAN loss on the attribute pipeline, patch style
//! outside the two-stage model, a dataset the pipeline cannot read) fail
//! early with every problem listed.

use model::config::FusionKind;

use crate::{config::PipelineKind, TrainingConfig, TrainingError};

#[derive(Debug, Clone, PartialEq)]
pub struct GroupPlan {
    pub name: &'static str,
    pub modules: Vec<&'static str>,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossTerm {
    pub name: &'static str,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub pipeline: PipelineKind,
    pub groups: Vec<GroupPlan>,
    /// Modules built only for inference (frozen stage 1).
    pub frozen: Vec<&'static str>,
    pub discriminator_step: bool,
    /// Loss terms with a positive weight.
    pub losses: Vec<LossTerm>,
    pub errors: Vec<&'static str>,
    pub visuals: Vec<&'static str>,
    /// Test error driving the plateau scheduler.
    pub monitor: &'static str,
}

const DATASET_OF: [(PipelineKind, &str); 4] = [
    (PipelineKind::PoseTransfer, "pose_transfer"),
    (PipelineKind::TwoStage, "pose_transfer"),
    (PipelineKind::Designer, "gan_v2"),
    (PipelineKind::Attribute, "attribute"),
];

impl ExecutionPlan {
    pub fn resolve(config: &TrainingConfig) -> Result<Self, TrainingError> {
        let mut problems = Vec::new();
        let kind = config.pipeline;
        let loss = &config.loss;
        let opt = &config.optimizer;

        if let Some((_, mode)) = DATASET_OF.iter().find(|(k, _)| *k == kind) {
            if config.data.dataset_mode != *mode {
                problems.push(format!(
                    "pipeline {} reads {mode} data, got data.dataset_mode [{}]",
                    kind.as_str(),
                    config.data.dataset_mode
                ));
            }
        }
        if loss.patch_style > 0.0 && kind != PipelineKind::TwoStage {
            problems.push("loss.patch_style is only supported by the two_stage pipeline".to_string());
        }
        if kind == PipelineKind::Attribute && (loss.gan > 0.0 || loss.needs_vgg()) {
            problems.push("the attribute pipeline has no image output; set loss.gan, loss.content and loss.style to 0".to_string());
        }

        let trans = kind == PipelineKind::Designer
            && matches!(config.designer.fusion(), Ok(FusionKind::Trans));
        let with_gan = kind != PipelineKind::Attribute && loss.gan > 0.0;
        let discriminator_step = with_gan && config.is_train;

        let mut groups = Vec::new();
        let mut frozen = Vec::new();
        match kind {
            PipelineKind::PoseTransfer => {
                groups.push(group("G", vec!["netT"], opt.lr));
            }
            PipelineKind::TwoStage => {
                groups.push(group("G", vec!["netT_s2e", "netT_s2d"], opt.lr));
                if config.two_stage.train_s1 {
                    groups.push(group("S1", vec!["netT_s1"], opt.lr_stage_1));
                } else {
                    frozen.push("netT_s1");
                }
            }
            PipelineKind::Designer => {
                let designer = &config.designer;
                let mut modules = vec!["shape_encoder"];
                if designer.use_edge {
                    modules.push("edge_encoder");
                }
                if designer.use_color {
                    modules.push("color_encoder");
                }
                if matches!(designer.fusion(), Ok(FusionKind::Fusion)) {
                    modules.push("fusion_net");
                }
                modules.push("netG");
                groups.push(group("G", modules, opt.lr));
                if trans {
                    let mut modules = Vec::new();
                    if designer.use_edge {
                        modules.push("edge_trans_net");
                    }
                    if designer.use_color {
                        modules.push("color_trans_net");
                    }
                    groups.push(group("FTN", modules, opt.lr));
                }
            }
            PipelineKind::Attribute => {
                groups.push(group("AE", vec!["netAE"], opt.lr));
            }
        }
        if discriminator_step {
            groups.push(group("D", vec!["netD"], opt.lr_d));
        }

        let candidates: Vec<(&'static str, f64)> = match kind {
            PipelineKind::Attribute => {
                let mut terms = vec![("attr", loss.attr)];
                if config.attribute.n_cat.is_some() {
                    terms.push(("category", loss.category));
                }
                terms
            }
            _ => {
                let mut terms = vec![
                    ("l1", loss.l1),
                    ("content", loss.content),
                    ("style", loss.style),
                ];
                if kind == PipelineKind::TwoStage {
                    terms.push(("patch_style", loss.patch_style));
                }
                if trans {
                    terms.push(("feat", loss.feat));
                }
                terms.push(("gan", loss.gan));
                terms
            }
        };
        let losses: Vec<LossTerm> = candidates
            .into_iter()
            .filter(|(_, weight)| *weight > 0.0)
            .map(|(name, weight)| LossTerm { name, weight })
            .collect();

        let mut errors = Vec::new();
        if kind != PipelineKind::Attribute {
            errors.extend(["PSNR", "SSIM"]);
        }
        for term in &losses {
            errors.push(match term.name {
                "l1" => "loss_L1",
                "content" => "loss_content",
                "style" => "loss_style",
                "patch_style" => "loss_patch_style",
                "feat" => "loss_feat",
                "attr" => "loss_attr",
                "category" => "loss_cat",
                _ => "loss_G",
            });
        }
        if discriminator_step {
            errors.push("loss_D");
        }

        let visuals = match kind {
            PipelineKind::PoseTransfer => vec!["img_ref", "joint_ref", "joint_tar", "img_tar", "img_out"],
            PipelineKind::TwoStage => vec![
                "img_ref",
                "joint_tar",
                "stickman_tar",
                "img_tar",
                "img_out_s1",
                "img_out",
                "img_out_res",
            ],
            PipelineKind::Designer => {
                let mut visuals = vec!["img"];
                for field in config.designer.shape_encode.fields() {
                    if !visuals.contains(field) {
                        visuals.push(field);
                    }
                }
                if config.designer.use_edge && !visuals.contains(&"edge_map") {
                    visuals.push("edge_map");
                }
                if config.designer.use_color {
                    visuals.push("color_map");
                }
                visuals.push("img_out");
                visuals
            }
            PipelineKind::Attribute => vec!["img"],
        };

        if !problems.is_empty() {
            return Err(TrainingError::validation(problems));
        }
        Ok(Self {
            pipeline: kind,
            groups,
            frozen,
            discriminator_step,
            losses,
            errors,
            visuals,
            monitor: if kind == PipelineKind::Attribute {
                "loss_attr"
            } else {
                "loss_L1"
            },
        })
    }

    /// Weight of a loss term, zero when the term is not in use.
    pub fn weight(&self, name: &str) -> f64 {
        self.losses
            .iter()
            .find(|term| term.name == name)
            .map_or(0.0, |term| term.weight)
    }

    pub fn uses(&self, name: &str) -> bool {
        self.weight(name) > 0.0
    }

    pub fn group(&self, name: &str) -> Option<&GroupPlan> {
        self.groups.iter().find(|group| group.name == name)
    }

    /// Every module the pipeline builds.
    pub fn modules(&self) -> Vec<&'static str> {
        let mut modules: Vec<&'static str> = self.frozen.clone();
        for group in &self.groups {
            modules.extend(group.modules.iter().copied());
        }
        modules
    }
}

fn group(name: &'static str, modules: Vec<&'static str>, learning_rate: f64) -> GroupPlan {
    GroupPlan {
        name,
        modules,
        learning_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pipeline: &str, dataset_mode: &str) -> TrainingConfig {
        let value = serde_json::json!({
            "id": "plan",
            "pipeline": pipeline,
            "data": { "data_root": "/tmp/data", "dataset_mode": dataset_mode },
        });
        serde_json::from_value(value).expect("config")
    }

    #[test]
    fn pose_transfer_with_gan_adds_discriminator() -> Result<(), TrainingError> {
        let mut cfg = config("pose_transfer", "pose_transfer");
        cfg.loss.gan = 0.1;
        let plan = ExecutionPlan::resolve(&cfg)?;
        let names: Vec<&str> = plan.groups.iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["G", "D"]);
        assert_eq!(plan.group("D").map(|g| g.learning_rate), Some(cfg.optimizer.lr_d));
        assert!(plan.discriminator_step);
        assert_eq!(plan.errors, vec!["PSNR", "SSIM", "loss_L1", "loss_G", "loss_D"]);
        assert_eq!(plan.weight("content"), 0.0);

        cfg.is_train = false;
        let plan = ExecutionPlan::resolve(&cfg)?;
        assert!(!plan.discriminator_step);
        assert_eq!(plan.modules(), vec!["netT"]);
        Ok(())
    }

    #[test]
    fn designer_trans_mode_trains_transfer_networks() -> Result<(), TrainingError> {
        let mut cfg = config("designer", "gan_v2");
        cfg.designer.fusion_model = "trans".into();
        cfg.designer.use_color = false;
        cfg.loss.feat = 1.0;
        let plan = ExecutionPlan::resolve(&cfg)?;
        assert_eq!(
            plan.modules(),
            vec!["shape_encoder", "edge_encoder", "netG", "edge_trans_net"]
        );
        assert!(plan.uses("feat"));
        assert_eq!(plan.visuals, vec!["img", "seg_mask", "edge_map", "img_out"]);
        Ok(())
    }

    #[test]
    fn invalid_combinations_are_collected() {
        let mut cfg = config("attribute", "pose_transfer");
        cfg.loss.gan = 1.0;
        cfg.loss.patch_style = 1.0;
        match ExecutionPlan::resolve(&cfg) {
            Err(TrainingError::Validation(problems)) => assert_eq!(problems.len(), 3),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn frozen_stage_one_is_built_but_not_trained() -> Result<(), TrainingError> {
        let mut cfg = config("two_stage", "pose_transfer");
        cfg.two_stage.stage_1_id = "stage1".into();
        let plan = ExecutionPlan::resolve(&cfg)?;
        assert_eq!(plan.frozen, vec!["netT_s1"]);
        assert_eq!(plan.groups.len(), 1);

        cfg.two_stage.train_s1 = true;
        let plan = ExecutionPlan::resolve(&cfg)?;
        assert_eq!(plan.group("S1").map(|g| g.modules.clone()), Some(vec!["netT_s1"]));
        Ok(())
    }
}
