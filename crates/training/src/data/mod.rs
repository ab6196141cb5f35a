//! Datasets, samples and the batch loader.
//!
//! Every dataset maps an index to a [`Sample`]: the sample id(s) plus named
//! `(c, h, w)` tensors on the CPU. The [`DataLoader`] shuffles indices,
//! stacks samples into a [`Batch`] and moves it to the training device.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{TrainingConfig, TrainingError};

pub mod attribute;
pub mod gan_v2;
pub mod loading;
pub mod pose_transfer;
pub mod render;

pub use attribute::AttributeDataset;
pub use gan_v2::GanV2Dataset;
pub use pose_transfer::PoseTransferDataset;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Recognized values of `data.dataset_mode`.
pub const DATASET_MODES: &[&str] = &["pose_transfer", "attribute", "gan_v2"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
    Debug,
}

impl Split {
    pub fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
            Split::Debug => "debug",
        }
    }

    /// Split used by a run: `debug` when requested, otherwise the train split
    /// for training and the test split for evaluation.
    pub fn for_run(config: &TrainingConfig) -> Self {
        if config.data.debug {
            Split::Debug
        } else if config.is_train {
            Split::Train
        } else {
            Split::Test
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sample {
    /// One id, or `[id_1, id_2]` for pose-transfer pairs.
    pub id: Vec<String>,
    pub fields: BTreeMap<String, Tensor>,
}

impl Sample {
    pub fn new(id: Vec<String>) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.fields.insert(name.into(), tensor);
    }
}

/// Samples stacked along a leading batch dimension.
#[derive(Debug, Clone)]
pub struct Batch {
    ids: Vec<Vec<String>>,
    fields: BTreeMap<String, Tensor>,
}

impl Batch {
    pub fn collate(samples: Vec<Sample>, device: &Device) -> Result<Self> {
        let Some(first) = samples.first() else {
            return Err(TrainingError::runtime("cannot collate an empty batch"));
        };
        let names: Vec<String> = first.fields.keys().cloned().collect();
        let mut fields = BTreeMap::new();
        for name in names {
            let parts = samples
                .iter()
                .map(|sample| {
                    sample.fields.get(&name).ok_or_else(|| {
                        TrainingError::runtime(format!(
                            "sample {} has no field {name}",
                            sample.id.join("_")
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let stacked = Tensor::stack(&parts, 0)?.to_device(device)?;
            fields.insert(name, stacked);
        }
        let ids = samples.into_iter().map(|sample| sample.id).collect();
        Ok(Self { ids, fields })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[Vec<String>] {
        &self.ids
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.fields
            .get(name)
            .ok_or_else(|| TrainingError::runtime(format!("batch has no field {name}")))
    }

    pub fn try_get(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// First `n` samples of the batch.
    pub fn head(&self, n: usize) -> Result<Self> {
        let n = n.min(self.len());
        let mut fields = BTreeMap::new();
        for (name, tensor) in &self.fields {
            fields.insert(name.clone(), tensor.narrow(0, 0, n)?);
        }
        Ok(Self {
            ids: self.ids[..n].to_vec(),
            fields,
        })
    }
}

pub trait Dataset {
    fn name(&self) -> &'static str;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads sample `index`; `rng` drives any random augmentation.
    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample>;
}

pub fn create_dataset(config: &TrainingConfig, split: Split) -> Result<Box<dyn Dataset>> {
    let dataset: Box<dyn Dataset> = match config.data.dataset_mode.as_str() {
        "pose_transfer" => Box::new(PoseTransferDataset::new(&config.data, split)?),
        "attribute" => Box::new(AttributeDataset::new(
            &config.data,
            config.attribute.n_attr,
            config.attribute.input_lm,
            split,
        )?),
        "gan_v2" => Box::new(GanV2Dataset::new(&config.data, split)?),
        other => {
            return Err(TrainingError::validation(vec![format!(
                "dataset mode [{other}] not recognized (expected one of: {})",
                DATASET_MODES.join(", ")
            )]))
        }
    };
    log::info!(
        "dataset [{}] was created (split: {}, size: {})",
        dataset.name(),
        split.as_str(),
        dataset.len()
    );
    Ok(dataset)
}

/// Loader for `split` (or the run's default split) that shuffles only the
/// train split of a training run and drops the last incomplete batch.
pub fn create_loader(
    config: &TrainingConfig,
    split: Option<Split>,
    device: &Device,
) -> Result<DataLoader> {
    let split = split.unwrap_or_else(|| Split::for_run(config));
    let dataset = create_dataset(config, split)?;
    let shuffle = split == Split::Train && config.is_train;
    DataLoader::new(
        dataset,
        config.data.batch_size,
        shuffle,
        device.clone(),
        config.runtime.seed,
    )
}

pub struct DataLoader {
    dataset: Box<dyn Dataset>,
    batch_size: usize,
    shuffle: bool,
    device: Device,
    rng: StdRng,
    order: Vec<usize>,
}

impl DataLoader {
    pub fn new(
        dataset: Box<dyn Dataset>,
        batch_size: usize,
        shuffle: bool,
        device: Device,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        let order = (0..dataset.len()).collect();
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            device,
            rng: StdRng::seed_from_u64(seed),
            order,
        })
    }

    pub fn dataset(&self) -> &dyn Dataset {
        self.dataset.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Complete batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    /// Resets the sample order, reshuffling when enabled.
    pub fn start_epoch(&mut self) {
        self.order = (0..self.dataset.len()).collect();
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    pub fn batch(&mut self, index: usize) -> Result<Batch> {
        if index >= self.num_batches() {
            return Err(TrainingError::runtime(format!(
                "batch {index} out of range ({} batches)",
                self.num_batches()
            )));
        }
        let start = index * self.batch_size;
        let indices = self.order[start..start + self.batch_size].to_vec();
        let samples = indices
            .into_iter()
            .map(|i| self.dataset.get(i, &mut self.rng))
            .collect::<Result<Vec<_>>>()?;
        Batch::collate(samples, &self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    struct Counting(usize);

    impl Dataset for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn len(&self) -> usize {
            self.0
        }

        fn get(&self, index: usize, _rng: &mut StdRng) -> Result<Sample> {
            let mut sample = Sample::new(vec![index.to_string()]);
            sample.insert("x", Tensor::full(index as f32, (1, 2, 2), &Device::Cpu)?);
            Ok(sample)
        }
    }

    #[test]
    fn loader_drops_incomplete_batch() -> Result<()> {
        let mut loader = DataLoader::new(Box::new(Counting(7)), 3, false, Device::Cpu, 0)?;
        loader.start_epoch();
        assert_eq!(loader.num_batches(), 2);
        let batch = loader.batch(1)?;
        assert_eq!(batch.ids(), &[vec!["3".to_string()], vec!["4".into()], vec!["5".into()]]);
        assert_eq!(batch.get("x")?.dims(), &[3, 1, 2, 2]);
        assert!(loader.batch(2).is_err());
        Ok(())
    }

    #[test]
    fn shuffled_epochs_cover_every_sample_once() -> Result<()> {
        let mut loader = DataLoader::new(Box::new(Counting(6)), 2, true, Device::Cpu, 7)?;
        loader.start_epoch();
        let mut seen = Vec::new();
        for i in 0..loader.num_batches() {
            let batch = loader.batch(i)?;
            let values = batch.get("x")?.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            seen.extend(values.chunks(4).map(|c| c[0] as usize));
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);

        let head = loader.batch(0)?.head(1)?;
        assert_eq!(head.len(), 1);
        assert_eq!(head.get("x")?.dims(), &[1, 1, 2, 2]);
        Ok(())
    }
}
