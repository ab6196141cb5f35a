//! Single images with binary attribute labels.

use std::{collections::HashMap, path::PathBuf};

use candle_core::{Device, Tensor};
use model::pose::N_JOINTS;
use rand::rngs::StdRng;

use super::{
    loading::{self, lookup},
    render, Dataset, Result, Sample, Split,
};
use crate::{config::DataConfig, TrainingError};

pub struct AttributeDataset {
    ids: Vec<String>,
    labels: HashMap<String, Vec<f32>>,
    categories: Option<HashMap<String, u32>>,
    poses: Option<HashMap<String, Vec<[f32; 2]>>>,
    img_dir: PathBuf,
    height: usize,
    width: usize,
    joint_radius: usize,
}

fn read_labels(config: &DataConfig, n_attr: Option<usize>) -> Result<HashMap<String, Vec<f32>>> {
    let labels: HashMap<String, Vec<f32>> = loading::read_json(&config.resolve(&config.fn_label))?;
    if let Some(n_attr) = n_attr {
        if let Some((id, label)) = labels.iter().find(|(_, label)| label.len() != n_attr) {
            return Err(TrainingError::runtime(format!(
                "label of {id} has {} attributes, expected {n_attr}",
                label.len()
            )));
        }
    }
    Ok(labels)
}

impl AttributeDataset {
    pub fn new(config: &DataConfig, n_attr: usize, with_landmarks: bool, split: Split) -> Result<Self> {
        let ids = loading::read_split(&config.resolve(&config.fn_split), split)?;
        let labels = read_labels(config, Some(n_attr))?;
        let categories = config
            .fn_category
            .as_ref()
            .map(|path| loading::read_json(&config.resolve(path)))
            .transpose()?;
        let poses = if with_landmarks {
            Some(loading::read_poses(&config.resolve(&config.fn_pose))?)
        } else {
            None
        };
        Ok(Self {
            ids,
            labels,
            categories,
            poses,
            img_dir: config.resolve(&config.img_dir),
            height: config.image_height,
            width: config.image_width,
            joint_radius: config.joint_radius,
        })
    }
}

impl Dataset for AttributeDataset {
    fn name(&self) -> &'static str {
        "attribute_dataset"
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn get(&self, index: usize, _rng: &mut StdRng) -> Result<Sample> {
        let id = self
            .ids
            .get(index)
            .ok_or_else(|| TrainingError::runtime(format!("sample {index} out of range")))?;
        let (h, w) = (self.height, self.width);
        let mut sample = Sample::new(vec![id.clone()]);

        let (img, original) = loading::load_rgb(&self.img_dir.join(format!("{id}.jpg")), h, w)?;
        sample.insert("img", loading::rgb_to_tensor(&img)?);
        let label = lookup(&self.labels, id, "attribute label")?;
        sample.insert("attr_label", Tensor::new(label.as_slice(), &Device::Cpu)?);
        if let Some(poses) = &self.poses {
            let joints = loading::rescale_joints(lookup(poses, id, "pose")?, original, h, w);
            let heatmaps = render::joint_heatmaps(&joints, h, w, self.joint_radius);
            sample.insert("lm_map", loading::planes_to_tensor(heatmaps, N_JOINTS, h, w)?);
        }
        if let Some(categories) = &self.categories {
            let category = *lookup(categories, id, "category")?;
            sample.insert("cat_label", Tensor::new(category, &Device::Cpu)?);
        }
        Ok(sample)
    }
}

/// Fraction of positive samples per attribute over the train split.
pub fn positive_rate(config: &DataConfig) -> Result<Vec<f32>> {
    let ids: Vec<String> = loading::read_split(&config.resolve(&config.fn_split), Split::Train)?;
    let labels = read_labels(config, None)?;
    let mut sum: Vec<f64> = Vec::new();
    for id in &ids {
        let label = lookup(&labels, id, "attribute label")?;
        if sum.is_empty() {
            sum = vec![0.0; label.len()];
        } else if label.len() != sum.len() {
            return Err(TrainingError::runtime(format!(
                "label of {id} has {} attributes, expected {}",
                label.len(),
                sum.len()
            )));
        }
        for (acc, &v) in sum.iter_mut().zip(label) {
            *acc += v as f64;
        }
    }
    if ids.is_empty() {
        return Err(TrainingError::runtime("train split has no samples"));
    }
    Ok(sum.into_iter().map(|s| (s / ids.len() as f64) as f32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::fs;

    fn config(root: &std::path::Path) -> DataConfig {
        let value = serde_json::json!({ "data_root": root, "image_height": 8, "image_width": 8 });
        serde_json::from_value(value).expect("data config")
    }

    #[test]
    fn positive_rate_averages_train_labels() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("Label"))?;
        fs::write(
            dir.path().join("Label/pair_split.json"),
            r#"{"train": ["a", "b"], "test": ["c"]}"#,
        )?;
        fs::write(
            dir.path().join("Label/attr_label.json"),
            r#"{"a": [1, 0, 1], "b": [1, 0, 0], "c": [0, 1, 1]}"#,
        )?;
        let rate = positive_rate(&config(dir.path()))?;
        assert_eq!(rate, vec![1.0, 0.0, 0.5]);
        Ok(())
    }

    #[test]
    fn samples_carry_labels_and_category() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("Label"))?;
        fs::create_dir_all(dir.path().join("Img/img_df"))?;
        fs::write(dir.path().join("Label/pair_split.json"), r#"{"test": ["a"]}"#)?;
        fs::write(dir.path().join("Label/attr_label.json"), r#"{"a": [0, 1]}"#)?;
        fs::write(dir.path().join("Label/cat.json"), r#"{"a": 3}"#)?;
        image::RgbImage::new(16, 16).save(dir.path().join("Img/img_df/a.jpg"))?;

        let mut data = config(dir.path());
        data.fn_category = Some("Label/cat.json".into());
        let dataset = AttributeDataset::new(&data, 2, false, Split::Test)?;
        assert_eq!(dataset.len(), 1);
        let mut rng = StdRng::seed_from_u64(0);
        let sample = dataset.get(0, &mut rng)?;
        assert_eq!(sample.fields["img"].dims(), &[3, 8, 8]);
        assert_eq!(sample.fields["attr_label"].to_vec1::<f32>()?, vec![0.0, 1.0]);
        assert_eq!(sample.fields["cat_label"].to_vec0::<u32>()?, 3);
        assert!(AttributeDataset::new(&data, 3, false, Split::Test).is_err());
        Ok(())
    }
}
