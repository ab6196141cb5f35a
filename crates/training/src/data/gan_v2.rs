//! Single images with shape, edge and color maps for the designer GAN.
//!
//! Fields: `img`, `lm_map`, `seg_mask` (one-hot), `seg_map` (label values),
//! `edge_map`, `color_map` and `attr_label`. Modalities whose directory or
//! file is absent from the dataset are skipped. With affine augmentation
//! the shape, edge and color maps get `_aug` copies under one random
//! scale/translation per sample.

use std::{collections::HashMap, path::PathBuf};

use candle_core::{Device, Tensor};
use model::pose::{N_JOINTS, SEG_NC};
use rand::rngs::StdRng;

use super::{
    loading::{self, lookup},
    render::{self, AffineJitter},
    Dataset, Result, Sample, Split,
};
use crate::{config::DataConfig, TrainingError};

pub struct GanV2Dataset {
    ids: Vec<String>,
    poses: Option<HashMap<String, Vec<[f32; 2]>>>,
    labels: Option<HashMap<String, Vec<f32>>>,
    img_dir: PathBuf,
    seg_dir: Option<PathBuf>,
    edge_dir: Option<PathBuf>,
    color_dir: Option<PathBuf>,
    height: usize,
    width: usize,
    joint_radius: usize,
    affine_aug: bool,
}

impl GanV2Dataset {
    pub fn new(config: &DataConfig, split: Split) -> Result<Self> {
        let ids = loading::read_split(&config.resolve(&config.fn_split), split)?;
        let pose_path = config.resolve(&config.fn_pose);
        let poses = if pose_path.is_file() {
            Some(loading::read_poses(&pose_path)?)
        } else {
            None
        };
        let label_path = config.resolve(&config.fn_label);
        let labels = if label_path.is_file() {
            Some(loading::read_json(&label_path)?)
        } else {
            None
        };
        let dir = |path: &PathBuf| Some(config.resolve(path)).filter(|dir| dir.is_dir());
        Ok(Self {
            ids,
            poses,
            labels,
            img_dir: config.resolve(&config.img_dir),
            seg_dir: dir(&config.seg_dir),
            edge_dir: dir(&config.edge_dir),
            color_dir: dir(&config.color_dir),
            height: config.image_height,
            width: config.image_width,
            joint_radius: config.joint_radius,
            affine_aug: config.affine_aug,
        })
    }

    fn insert_planes(
        &self,
        sample: &mut Sample,
        name: &str,
        data: Vec<f32>,
        channels: usize,
        jitter: Option<(&AffineJitter, &[f32])>,
    ) -> Result<()> {
        let (h, w) = (self.height, self.width);
        if let Some((jitter, fill)) = jitter {
            let warped = jitter.warp(&data, channels, h, w, fill);
            sample.insert(format!("{name}_aug"), loading::planes_to_tensor(warped, channels, h, w)?);
        }
        sample.insert(name, loading::planes_to_tensor(data, channels, h, w)?);
        Ok(())
    }
}

impl Dataset for GanV2Dataset {
    fn name(&self) -> &'static str {
        "gan_v2_dataset"
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample> {
        let id = self
            .ids
            .get(index)
            .ok_or_else(|| TrainingError::runtime(format!("sample {index} out of range")))?;
        let (h, w) = (self.height, self.width);
        let mut sample = Sample::new(vec![id.clone()]);
        let jitter = self
            .affine_aug
            .then(|| AffineJitter::sample(rng, h, w));

        let (img, original) = loading::load_rgb(&self.img_dir.join(format!("{id}.jpg")), h, w)?;
        sample.insert("img", loading::rgb_to_tensor(&img)?);

        if let Some(labels) = &self.labels {
            let label = lookup(labels, id, "attribute label")?;
            sample.insert("attr_label", Tensor::new(label.as_slice(), &Device::Cpu)?);
        }

        if let Some(poses) = &self.poses {
            let joints = loading::rescale_joints(lookup(poses, id, "pose")?, original, h, w);
            let heatmaps = render::joint_heatmaps(&joints, h, w, self.joint_radius);
            sample.insert("lm_map", loading::planes_to_tensor(heatmaps, N_JOINTS, h, w)?);
            if let Some(jitter) = &jitter {
                let moved: Vec<[f32; 2]> = joints.iter().map(|&j| jitter.apply(j, h, w)).collect();
                let heatmaps = render::joint_heatmaps(&moved, h, w, self.joint_radius);
                sample.insert("lm_map_aug", loading::planes_to_tensor(heatmaps, N_JOINTS, h, w)?);
            }
        }

        if let Some(seg_dir) = &self.seg_dir {
            let labels = loading::load_gray(&seg_dir.join(format!("{id}.png")), h, w, false)?;
            let values: Vec<f32> = labels.as_raw().iter().map(|&v| v as f32).collect();
            sample.insert("seg_map", loading::planes_to_tensor(values, 1, h, w)?);
            let mut background = vec![0f32; SEG_NC];
            background[0] = 1.0;
            let one_hot = render::seg_one_hot(labels.as_raw(), h, w);
            let aug = jitter.as_ref().map(|j| (j, background.as_slice()));
            self.insert_planes(&mut sample, "seg_mask", one_hot, SEG_NC, aug)?;
        }

        let blank = [-1f32; 3];
        if let Some(edge_dir) = &self.edge_dir {
            let edge = loading::load_gray(&edge_dir.join(format!("{id}.png")), h, w, true)?;
            let data = loading::gray_to_tensor(&edge)?.flatten_all()?.to_vec1::<f32>()?;
            let aug = jitter.as_ref().map(|j| (j, &blank[..1]));
            self.insert_planes(&mut sample, "edge_map", data, 1, aug)?;
        }
        if let Some(color_dir) = &self.color_dir {
            let (color, _) = loading::load_rgb(&color_dir.join(format!("{id}.jpg")), h, w)?;
            let data = loading::rgb_to_tensor(&color)?.flatten_all()?.to_vec1::<f32>()?;
            let aug = jitter.as_ref().map(|j| (j, &blank[..]));
            self.insert_planes(&mut sample, "color_map", data, 3, aug)?;
        }
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::fs;

    #[test]
    fn augmented_copies_follow_available_modalities() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        fs::create_dir_all(root.join("Label"))?;
        fs::create_dir_all(root.join("Img/img_df"))?;
        fs::create_dir_all(root.join("Img/edge_df"))?;
        fs::write(root.join("Label/pair_split.json"), r#"{"train": ["a"]}"#)?;
        image::RgbImage::new(8, 8).save(root.join("Img/img_df/a.jpg"))?;
        image::GrayImage::new(8, 8).save(root.join("Img/edge_df/a.png"))?;

        let value = serde_json::json!({
            "data_root": root,
            "image_height": 8,
            "image_width": 8,
            "affine_aug": true,
        });
        let config: DataConfig = serde_json::from_value(value)?;
        let dataset = GanV2Dataset::new(&config, Split::Train)?;
        let sample = dataset.get(0, &mut StdRng::seed_from_u64(3))?;
        let names: Vec<&str> = sample.fields.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["edge_map", "edge_map_aug", "img"]);
        assert_eq!(sample.fields["edge_map_aug"].dims(), &[1, 8, 8]);
        Ok(())
    }
}
