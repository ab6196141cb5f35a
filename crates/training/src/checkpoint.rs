//! Per-run checkpoint directory.
//!
//! Layout under `<checkpoints_dir>/<id>/`:
//!
//! * `train_opt.json`: resolved run configuration;
//! * `<label>_net_<module>.safetensors`: weights of one network;
//! * `<label>_optim_<group>.json`: optimizer and scheduler state;
//! * `<label>_manifest.json`: checksums of the files above.
//!
//! `label` is an epoch number or `latest`.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, Device, Tensor};
use candle_nn::VarMap;
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::{POSE_TRANSFER_PREFIX, TRAIN_OPT_FILENAME}, optimizer::OptimizerState, scheduler::SchedulerState,
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Optimizer and scheduler state of one trainable group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupState {
    pub optimizer: OptimizerState,
    pub scheduler: SchedulerState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub label: String,
    pub epoch: usize,
    pub total_steps: usize,
    pub config_sha256: String,
    pub files: Vec<FileRecord>,
}

pub struct SaveRequest<'a> {
    pub label: &'a str,
    pub config: &'a TrainingConfig,
    pub networks: &'a [(&'a str, &'a VarMap)],
    pub groups: &'a [(&'a str, GroupState)],
    pub epoch: usize,
    pub total_steps: usize,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(checkpoints_dir: &Path, id: &str) -> Self {
        Self {
            dir: checkpoints_dir.join(id),
        }
    }

    /// Store of run `id`; pose-transfer runs are also found by their id
    /// without the `PoseTransfer_` prefix.
    pub fn resolve(checkpoints_dir: &Path, id: &str) -> Self {
        let direct = Self::new(checkpoints_dir, id);
        if direct.dir.is_dir() || id.starts_with(POSE_TRANSFER_PREFIX) {
            direct
        } else {
            Self::new(checkpoints_dir, &format!("{POSE_TRANSFER_PREFIX}{id}"))
        }
    }

    pub fn for_run(config: &TrainingConfig) -> Self {
        Self { dir: config.run_dir() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn network_path(&self, label: &str, name: &str) -> PathBuf {
        self.dir.join(format!("{label}_net_{name}.safetensors"))
    }

    pub fn optimizer_path(&self, label: &str, name: &str) -> PathBuf {
        self.dir.join(format!("{label}_optim_{name}.json"))
    }

    fn manifest_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}_manifest.json"))
    }

    fn ensure_dir(&self) -> Result<(), TrainingError> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                self.dir.display()
            ))
        })
    }

    /// Writes the resolved configuration as `train_opt.json`.
    pub fn save_options(&self, config: &TrainingConfig) -> Result<PathBuf, TrainingError> {
        self.ensure_dir()?;
        let path = self.dir.join(TRAIN_OPT_FILENAME);
        write_json(&path, config)?;
        Ok(path)
    }

    pub fn options_path(&self) -> PathBuf {
        self.dir.join(TRAIN_OPT_FILENAME)
    }

    pub fn save(&self, request: SaveRequest<'_>) -> Result<CheckpointManifest, TrainingError> {
        self.ensure_dir()?;
        let label = request.label;
        let mut files = Vec::with_capacity(request.networks.len() + request.groups.len());

        for (name, varmap) in request.networks {
            let path = self.network_path(label, name);
            save_varmap(varmap, &path)?;
            files.push(file_record(&path)?);
        }
        for (name, state) in request.groups {
            let path = self.optimizer_path(label, name);
            write_json(&path, state)?;
            files.push(file_record(&path)?);
        }

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            label: label.to_string(),
            epoch: request.epoch,
            total_steps: request.total_steps,
            config_sha256: fingerprint_config(request.config)?,
            files,
        };
        write_json(&self.manifest_path(label), &manifest)?;
        Ok(manifest)
    }

    /// Manifest written with `label`, if any.
    pub fn manifest(&self, label: &str) -> Result<Option<CheckpointManifest>, TrainingError> {
        let path = self.manifest_path(label);
        if !path.is_file() {
            return Ok(None);
        }
        let manifest: CheckpointManifest = read_json(&path)?;
        if manifest.version != CHECKPOINT_VERSION {
            return Err(TrainingError::runtime(format!(
                "unsupported checkpoint version {} (expected {})",
                manifest.version, CHECKPOINT_VERSION
            )));
        }
        Ok(Some(manifest))
    }

    pub fn has_network(&self, label: &str, name: &str) -> bool {
        self.network_path(label, name).is_file()
    }

    /// Loads `<label>_net_<name>` into `varmap`. Every variable must be
    /// present in the file and the file must not hold extra tensors.
    pub fn load_network(&self, label: &str, name: &str, varmap: &VarMap) -> Result<(), TrainingError> {
        let path = self.network_path(label, name);
        if !path.is_file() {
            return Err(not_found(format!(
                "checkpoint for network {name} not found at {}",
                path.display()
            )));
        }
        self.verify(label, &path)?;
        apply_weights(varmap, &path)
    }

    pub fn load_group_state(&self, label: &str, name: &str) -> Result<GroupState, TrainingError> {
        let path = self.optimizer_path(label, name);
        if !path.is_file() {
            return Err(not_found(format!(
                "optimizer state for group {name} not found at {}",
                path.display()
            )));
        }
        self.verify(label, &path)?;
        read_json(&path)
    }

    fn verify(&self, label: &str, path: &Path) -> Result<(), TrainingError> {
        let Some(manifest) = self.manifest(label)? else {
            return Ok(());
        };
        let filename = path.file_name().and_then(|name| name.to_str()).unwrap_or_default();
        match manifest.files.iter().find(|record| record.filename == filename) {
            Some(record) => validate_file(path, &record.sha256),
            None => Ok(()),
        }
    }
}

fn not_found(message: String) -> TrainingError {
    TrainingError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, message))
}

/// Copies tensors from a safetensors file into the variables of `varmap`.
pub fn apply_weights(varmap: &VarMap, weights_path: &Path) -> Result<(), TrainingError> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| TrainingError::runtime("variable map lock poisoned"))?;
    let device = match data.values().next() {
        Some(var) => var.as_tensor().device().clone(),
        None => Device::Cpu,
    };
    let tensors = load_safetensors(weights_path, &device)?;
    let mut params_by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in data.iter() {
        let tensor = params_by_name.remove(name).ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint {} missing parameter {name}",
                weights_path.display()
            ))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::runtime(format!(
                "checkpoint parameter {name} has shape {:?}, expected {:?}",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor.to_dtype(desired_dtype)?
        };
        var.set(&tensor)?;
    }

    if !params_by_name.is_empty() {
        let mut extra = params_by_name.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

fn save_varmap(varmap: &VarMap, path: &Path) -> Result<(), TrainingError> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| TrainingError::runtime("variable map lock poisoned"))?;
    if data.is_empty() {
        return Err(TrainingError::runtime(format!(
            "network has no parameters to checkpoint ({})",
            path.display()
        )));
    }
    let tensors: HashMap<String, Tensor> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize weights to {}: {err}",
            path.display()
        ))
    })
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(std::io::BufReader::new(file)).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}
