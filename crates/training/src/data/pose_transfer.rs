//! Paired samples for pose transfer.
//!
//! Each split entry `[id_1, id_2]` names two images of the same person. Side
//! `i` of a sample carries `img_i`, `joint_i` heatmaps, `joint_c_i`
//! coordinates, `stickman_i`, `limb_i` crops and, when the dataset ships
//! segmentations, `seg_mask_i`.

use std::{collections::HashMap, path::PathBuf};

use model::pose::{N_JOINTS, N_LIMBS, SEG_NC};
use rand::rngs::StdRng;

use super::{
    loading::{self, lookup},
    render, Dataset, Result, Sample, Split,
};
use crate::{config::DataConfig, TrainingError};

pub struct PoseTransferDataset {
    pairs: Vec<[String; 2]>,
    poses: HashMap<String, Vec<[f32; 2]>>,
    img_dir: PathBuf,
    seg_dir: Option<PathBuf>,
    height: usize,
    width: usize,
    joint_radius: usize,
}

impl PoseTransferDataset {
    pub fn new(config: &DataConfig, split: Split) -> Result<Self> {
        let pairs = loading::read_split(&config.resolve(&config.fn_split), split)?;
        let poses = loading::read_poses(&config.resolve(&config.fn_pose))?;
        let seg_dir = Some(config.resolve(&config.seg_dir)).filter(|dir| dir.is_dir());
        Ok(Self {
            pairs,
            poses,
            img_dir: config.resolve(&config.img_dir),
            seg_dir,
            height: config.image_height,
            width: config.image_width,
            joint_radius: config.joint_radius,
        })
    }

    fn load_side(&self, sample: &mut Sample, id: &str, side: usize) -> Result<()> {
        let (h, w) = (self.height, self.width);
        let (img, original) = loading::load_rgb(&self.img_dir.join(format!("{id}.jpg")), h, w)?;
        let joints = loading::rescale_joints(lookup(&self.poses, id, "pose")?, original, h, w);
        let img = loading::rgb_to_tensor(&img)?;

        let thickness = (self.joint_radius as f32 / 2.0).max(1.0);
        let limbs = render::limb_masks(&joints, h, w, self.joint_radius as f32 * 1.5);
        let limbs = loading::planes_to_tensor(limbs, N_LIMBS, h, w)?;
        let mut crops = Vec::with_capacity(N_LIMBS);
        for l in 0..N_LIMBS {
            crops.push(img.broadcast_mul(&limbs.narrow(0, l, 1)?)?);
        }
        sample.insert(format!("limb_{side}"), candle_core::Tensor::cat(&crops, 0)?);

        let heatmaps = render::joint_heatmaps(&joints, h, w, self.joint_radius);
        sample.insert(format!("joint_{side}"), loading::planes_to_tensor(heatmaps, N_JOINTS, h, w)?);
        sample.insert(format!("joint_c_{side}"), loading::joints_to_tensor(&joints)?);
        let stickman = render::stickman(&joints, h, w, thickness);
        sample.insert(format!("stickman_{side}"), loading::planes_to_tensor(stickman, 3, h, w)?);
        if let Some(seg_dir) = &self.seg_dir {
            let labels = loading::load_gray(&seg_dir.join(format!("{id}.png")), h, w, false)?;
            let one_hot = render::seg_one_hot(labels.as_raw(), h, w);
            sample.insert(format!("seg_mask_{side}"), loading::planes_to_tensor(one_hot, SEG_NC, h, w)?);
        }
        sample.insert(format!("img_{side}"), img);
        Ok(())
    }
}

impl Dataset for PoseTransferDataset {
    fn name(&self) -> &'static str {
        "pose_transfer_dataset"
    }

    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn get(&self, index: usize, _rng: &mut StdRng) -> Result<Sample> {
        let [id_1, id_2] = self
            .pairs
            .get(index)
            .ok_or_else(|| TrainingError::runtime(format!("pair {index} out of range")))?;
        let mut sample = Sample::new(vec![id_1.clone(), id_2.clone()]);
        self.load_side(&mut sample, id_1, 1)?;
        self.load_side(&mut sample, id_2, 2)?;
        Ok(sample)
    }
}
