use std::{fs, path::Path};

use anyhow::Result;
use candle_core::Device;
use candle_nn::VarMap;
use image::{GrayImage, Luma, Rgb, RgbImage};
use serde_json::json;
use tempfile::tempdir;
use training::{
    build_pipeline,
    config::PreservedOptions,
    data::{create_loader, Split},
    scheduler::SchedulerState,
    CheckpointStore, Trainer, TrainingConfig, TrainingError,
};

const SIZE: u32 = 32;

fn write_image(path: &Path, seed: u8) -> Result<()> {
    let img = RgbImage::from_fn(SIZE, SIZE, |x, y| {
        Rgb([
            (x as u8).wrapping_mul(7).wrapping_add(seed),
            (y as u8).wrapping_mul(5),
            seed.wrapping_mul(31),
        ])
    });
    img.save(path)?;
    Ok(())
}

fn pose(offset: f32) -> Vec<[f32; 2]> {
    (0..18)
        .map(|j| {
            if j == 17 {
                [-1.0, -1.0]
            } else {
                [4.0 + offset + j as f32, 6.0 + j as f32]
            }
        })
        .collect()
}

/// Three people `a`, `b`, `c` with images, poses and attribute labels.
fn write_dataset(root: &Path) -> Result<()> {
    fs::create_dir_all(root.join("Img/img_df"))?;
    fs::create_dir_all(root.join("Label"))?;
    for (i, id) in ["a", "b", "c"].iter().enumerate() {
        write_image(&root.join(format!("Img/img_df/{id}.jpg")), 40 * i as u8)?;
    }
    let poses = json!({ "a": pose(0.0), "b": pose(2.0), "c": pose(4.0) });
    fs::write(root.join("Label/pose_label.json"), poses.to_string())?;
    let pairs = json!({ "train": [["a", "b"], ["b", "c"]], "test": [["c", "a"], ["a", "c"]] });
    fs::write(root.join("Label/pair_split.json"), pairs.to_string())?;
    let ids = json!({ "train": ["a", "b"], "test": ["c", "a"] });
    fs::write(root.join("Label/attr_split.json"), ids.to_string())?;
    let labels = json!({ "a": [1, 0, 1], "b": [0, 1, 1], "c": [1, 1, 0] });
    fs::write(root.join("Label/attr_label.json"), labels.to_string())?;
    Ok(())
}

fn pose_transfer_toml(niter: usize) -> String {
    format!(
        r#"
id = "tiny"

[data]
data_root = "data"
image_height = {SIZE}
image_width = {SIZE}
batch_size = 2
joint_radius = 2

[pose_transfer]
which_model_t = "resnet"
t_nf = 4
t_nblocks = 1
pose_type = "joint+stickman"

[gan]
d_nf = 4
d_n_layers = 2
pool_size = 2

[loss]
gan = 0.5

[scheduler]
lr_policy = "lambda"
niter = {niter}
niter_decay = 0

[runtime]
checkpoints_dir = "checkpoints"
max_n_vis = 2

[runtime.logging]
enable_stdout = false
"#
    )
}

/// Pose-transfer run `id` whose rate halves every epoch.
fn halving_toml(id: &str, niter: usize) -> String {
    pose_transfer_toml(niter)
        .replace("id = \"tiny\"", &format!("id = \"{id}\""))
        .replace(
            "lr_policy = \"lambda\"",
            "lr_policy = \"step\"\nlr_decay = 1\nlr_gamma = 0.5",
        )
}

fn latest_schedule(config: &TrainingConfig, group: &str) -> Result<SchedulerState> {
    Ok(CheckpointStore::for_run(config)
        .load_group_state("latest", group)?
        .scheduler)
}

fn load(dir: &Path, name: &str, text: &str) -> Result<TrainingConfig> {
    let path = dir.join(name);
    fs::write(&path, text)?;
    Ok(TrainingConfig::load(&path)?)
}

#[test]
fn pose_transfer_trains_saves_and_resumes() -> Result<()> {
    let dir = tempdir()?;
    write_dataset(&dir.path().join("data"))?;
    let config = load(dir.path(), "train.toml", &pose_transfer_toml(1))?;
    assert_eq!(config.id, "PoseTransfer_tiny");

    let mut trainer = Trainer::new(config.clone())?;
    trainer.train()?;
    assert_eq!(trainer.total_steps(), 1);

    let run = config.run_dir();
    for file in [
        "train_opt.json",
        "latest_net_netT.safetensors",
        "latest_net_netD.safetensors",
        "latest_optim_G.json",
        "latest_optim_D.json",
        "latest_manifest.json",
        "1_net_netT.safetensors",
        "vis/1_train.jpg",
        "vis/1_test.jpg",
    ] {
        assert!(run.join(file).is_file(), "missing {file}");
    }

    // A test run rebuilt from the saved options loads the same weights.
    let test_config = TrainingConfig::from_train_opt(
        run.join("train_opt.json"),
        PreservedOptions {
            devices: Vec::new(),
            batch_size: 2,
            is_train: false,
        },
    )?;
    let device = Device::Cpu;
    let (mut pipeline, _) = build_pipeline(&test_config, &device)?;
    assert!(pipeline.plan().groups.is_empty());
    let mut loader = create_loader(&test_config, None, &device)?;
    assert_eq!(loader.dataset().len(), 2);
    loader.start_epoch();
    let batch = loader.batch(0)?;
    let errors = pipeline.evaluate(&batch, true)?;
    assert!(errors.get("PSNR").is_some_and(f64::is_finite));
    assert!(errors.get("SSIM").is_some());
    let images = pipeline
        .output_images(&batch)?
        .ok_or_else(|| anyhow::anyhow!("no generated images"))?;
    assert_eq!(images.dims(), &[2, 3, SIZE as usize, SIZE as usize]);

    // Resuming continues after the saved epoch.
    let mut resumed = load(dir.path(), "resume.toml", &pose_transfer_toml(2))?;
    resumed.runtime.continue_train = true;
    let mut trainer = Trainer::new(resumed)?;
    assert_eq!(trainer.total_steps(), 1);
    trainer.train()?;
    assert_eq!(trainer.total_steps(), 2);
    assert!(run.join("2_net_netT.safetensors").is_file());
    Ok(())
}

#[test]
fn stop_request_saves_latest() -> Result<()> {
    let dir = tempdir()?;
    write_dataset(&dir.path().join("data"))?;
    let config = load(dir.path(), "train.toml", &pose_transfer_toml(3))?;
    let mut trainer = Trainer::new(config.clone())?;
    trainer.train_with_shutdown(|| true)?;
    assert_eq!(trainer.total_steps(), 0);

    let store = CheckpointStore::for_run(&config);
    let manifest = store
        .manifest("latest")?
        .ok_or_else(|| anyhow::anyhow!("latest manifest missing"))?;
    assert_eq!(manifest.epoch, 0);
    assert!(!config.run_dir().join("1_net_netT.safetensors").exists());
    // The interrupted epoch had not consumed its schedule step.
    assert_eq!(latest_schedule(&config, "G")?.last_epoch, 0);
    Ok(())
}

#[test]
fn resumed_schedule_matches_uninterrupted_run() -> Result<()> {
    let dir = tempdir()?;
    write_dataset(&dir.path().join("data"))?;

    let straight = load(dir.path(), "straight.toml", &halving_toml("straight", 3))?;
    Trainer::new(straight.clone())?.train()?;

    let first = load(dir.path(), "first.toml", &halving_toml("split", 2))?;
    Trainer::new(first)?.train()?;
    let mut rest = load(dir.path(), "rest.toml", &halving_toml("split", 3))?;
    rest.runtime.continue_train = true;
    let mut trainer = Trainer::new(rest.clone())?;
    trainer.train()?;
    assert_eq!(trainer.total_steps(), 3);

    for group in ["G", "D"] {
        let expected = latest_schedule(&straight, group)?;
        assert_eq!(expected.last_epoch, 3);
        assert_eq!(latest_schedule(&rest, group)?, expected);
    }
    let lr = latest_schedule(&straight, "G")?.learning_rate;
    assert!((lr - 2e-4 * 0.125).abs() < 1e-12, "lr {lr}");
    Ok(())
}

#[test]
fn two_stage_refines_a_trained_stage_1() -> Result<()> {
    let dir = tempdir()?;
    write_dataset(&dir.path().join("data"))?;
    let stage_1 = load(dir.path(), "train.toml", &pose_transfer_toml(1))?;
    Trainer::new(stage_1.clone())?.train()?;

    let text = format!(
        r#"
id = "refine"
pipeline = "two_stage"

[data]
data_root = "data"
image_height = {SIZE}
image_width = {SIZE}
batch_size = 2
joint_radius = 2

[two_stage]
stage_1_id = "tiny"
patch_size = 8
patch_indices = [0, 2, 17]
s2e_nof = 4
s2e_nf = 4
s2e_max_nf = 8
which_model_s2d = "resnet"
s2d_nf = 4
s2d_nblocks = 1

[gan]
d_nf = 4
d_n_layers = 2
pool_size = 2

[loss]
gan = 0.5

[scheduler]
niter = 1
niter_decay = 0

[runtime]
checkpoints_dir = "checkpoints"
max_n_vis = 2

[runtime.logging]
enable_stdout = false
"#
    );
    let config = load(dir.path(), "two_stage.toml", &text)?;
    let plan = training::ExecutionPlan::resolve(&config)?;
    assert!(plan.discriminator_step);
    assert!(plan.group("S1").is_none());

    let mut trainer = Trainer::new(config.clone())?;
    trainer.train()?;
    assert_eq!(trainer.total_steps(), 1);
    let run = config.run_dir();
    for file in [
        "latest_net_netT_s1.safetensors",
        "latest_net_netT_s2e.safetensors",
        "latest_net_netT_s2d.safetensors",
        "latest_net_netD.safetensors",
        "latest_optim_G.json",
        "latest_optim_D.json",
        "vis/1_test.jpg",
    ] {
        assert!(run.join(file).is_file(), "missing {file}");
    }
    assert!(!run.join("latest_optim_S1.json").exists());

    // Stage 1 is frozen: its saved weights are those of the stage 1 run.
    let device = Device::Cpu;
    let trained = candle_core::safetensors::load(stage_1.run_dir().join("latest_net_netT.safetensors"), &device)?;
    let saved = candle_core::safetensors::load(run.join("latest_net_netT_s1.safetensors"), &device)?;
    assert_eq!(trained.len(), saved.len());
    for (name, tensor) in &trained {
        let other = saved
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("netT_s1 lacks {name}"))?;
        let diff = (tensor - other)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0, "{name} changed");
    }

    // One more step reports both adversarial losses.
    let (mut pipeline, _) = build_pipeline(&config, &device)?;
    let mut loader = create_loader(&config, None, &device)?;
    loader.start_epoch();
    let errors = pipeline.train_step(&loader.batch(0)?)?;
    for name in ["loss_L1", "loss_G", "loss_D"] {
        assert!(errors.get(name).is_some_and(f64::is_finite), "missing {name}");
    }
    let images = pipeline
        .output_images(&loader.batch(0)?)?
        .ok_or_else(|| anyhow::anyhow!("no generated images"))?;
    assert_eq!(images.dims(), &[2, 3, SIZE as usize, SIZE as usize]);
    Ok(())
}

#[test]
fn attribute_pipeline_reports_ranking_metrics() -> Result<()> {
    let dir = tempdir()?;
    write_dataset(&dir.path().join("data"))?;
    let text = format!(
        r#"
id = "attr"
pipeline = "attribute"

[data]
dataset_mode = "attribute"
data_root = "data"
fn_split = "Label/attr_split.json"
image_height = {SIZE}
image_width = {SIZE}
batch_size = 2

[attribute]
n_attr = 3
top_k = [1, 2]

[scheduler]
niter = 1
niter_decay = 0

[runtime]
checkpoints_dir = "checkpoints"
"#
    );
    let config = load(dir.path(), "attr.toml", &text)?;
    assert_eq!(config.id, "attr");

    let mut trainer = Trainer::new(config.clone())?;
    trainer.train()?;
    let errors = trainer.evaluate()?;
    for name in ["loss_attr", "mAP", "BP", "rec@1", "rec@2_sample"] {
        assert!(errors.get(name).is_some(), "missing {name}");
    }
    let map = errors.get("mAP").unwrap_or(-1.0);
    assert!((0.0..=100.0).contains(&map));
    assert!(config.run_dir().join("latest_net_netAE.safetensors").is_file());
    Ok(())
}

#[test]
fn designer_transfers_augmented_features() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path().join("data");
    write_dataset(&root)?;
    fs::create_dir_all(root.join("Img/seg_df"))?;
    fs::create_dir_all(root.join("Img/edge_df"))?;
    for id in ["a", "b", "c"] {
        GrayImage::from_fn(SIZE, SIZE, |x, y| Luma([((x / 8 + y / 8) % 7) as u8]))
            .save(root.join(format!("Img/seg_df/{id}.png")))?;
        GrayImage::from_fn(SIZE, SIZE, |x, _| Luma([if x % 6 == 0 { 255 } else { 0 }]))
            .save(root.join(format!("Img/edge_df/{id}.png")))?;
    }
    let text = format!(
        r#"
id = "designer"
pipeline = "designer"

[data]
dataset_mode = "gan_v2"
data_root = "data"
fn_split = "Label/attr_split.json"
image_height = {SIZE}
image_width = {SIZE}
batch_size = 2
affine_aug = true

[designer]
shape_encode = "seg"
use_color = false
edge_shape_guided = true
encoder_nf = 4
encoder_max_nf = 8
shape_nof = 4
edge_nof = 4
shape_ndowns = 2
edge_ndowns = 2
fusion_model = "trans"
mid_nblocks = 1
mid_ndowns = 1
which_model_g = "resnet"
g_nf = 4
g_nblocks = 1

[loss]
feat = 1.0

[scheduler]
niter = 1
niter_decay = 0

[runtime]
checkpoints_dir = "checkpoints"
"#
    );
    let config = load(dir.path(), "designer.toml", &text)?;
    let plan = training::ExecutionPlan::resolve(&config)?;
    assert!(plan.uses("feat"));
    assert_eq!(plan.visuals, vec!["img", "seg_mask", "edge_map", "img_out"]);

    let mut trainer = Trainer::new(config.clone())?;
    trainer.train()?;
    let run = config.run_dir();
    for module in ["shape_encoder", "edge_encoder", "edge_trans_net", "netG"] {
        assert!(
            run.join(format!("latest_net_{module}.safetensors")).is_file(),
            "missing {module}"
        );
    }
    let errors = trainer.evaluate()?;
    assert!(errors.get("loss_feat").is_some_and(|v| v >= 0.0));
    assert!(errors.get("PSNR").is_some());
    Ok(())
}

#[test]
fn dataset_mode_must_match_pipeline() -> Result<()> {
    let dir = tempdir()?;
    write_dataset(&dir.path().join("data"))?;
    let mut config = load(dir.path(), "train.toml", &pose_transfer_toml(1))?;
    config.data.dataset_mode = "attribute".to_string();
    config.data.fn_split = "Label/attr_split.json".into();
    match build_pipeline(&config, &Device::Cpu) {
        Err(TrainingError::Validation(problems)) => {
            assert!(problems.iter().any(|p| p.contains("dataset")));
        }
        Err(other) => anyhow::bail!("unexpected error: {other}"),
        Ok(_) => anyhow::bail!("mismatched dataset mode was accepted"),
    }
    assert_eq!(Split::for_run(&config), Split::Train);
    Ok(())
}

#[test]
fn missing_checkpoint_is_an_io_error() -> Result<()> {
    let dir = tempdir()?;
    let store = CheckpointStore::new(dir.path(), "nothing");
    let varmap = VarMap::new();
    assert!(matches!(
        store.load_network("latest", "netT", &varmap),
        Err(TrainingError::Io(_))
    ));
    assert!(store.manifest("latest")?.is_none());
    Ok(())
}
