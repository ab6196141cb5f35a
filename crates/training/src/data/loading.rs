//! File readers shared by the datasets.

use std::{
    collections::HashMap,
    fs::File,
    io::BufReader,
    path::Path,
};

use candle_core::{Device, Tensor};
use image::{imageops::FilterType, GrayImage, RgbImage};
use serde::{de::DeserializeOwned, Deserialize};

use super::{Result, Split};
use crate::TrainingError;

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|err| {
        TrainingError::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {err}", path.display()),
        ))
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|err| {
        TrainingError::ConfigFormat(format!("failed to parse {}: {err}", path.display()))
    })
}

#[derive(Debug, Deserialize)]
struct SplitFile<T> {
    #[serde(default = "Vec::new")]
    train: Vec<T>,
    #[serde(default = "Vec::new")]
    test: Vec<T>,
    #[serde(default = "Vec::new")]
    debug: Vec<T>,
}

/// Entries of one split: ids, or `[id_1, id_2]` pairs.
pub fn read_split<T: DeserializeOwned>(path: &Path, split: Split) -> Result<Vec<T>> {
    let file: SplitFile<T> = read_json(path)?;
    Ok(match split {
        Split::Train => file.train,
        Split::Test => file.test,
        Split::Debug => file.debug,
    })
}

/// `{id: [[x, y] x 18]}`.
pub fn read_poses(path: &Path) -> Result<HashMap<String, Vec<[f32; 2]>>> {
    let poses: HashMap<String, Vec<[f32; 2]>> = read_json(path)?;
    if let Some((id, joints)) = poses
        .iter()
        .find(|(_, joints)| joints.len() != model::pose::N_JOINTS)
    {
        return Err(TrainingError::runtime(format!(
            "pose of {id} has {} joints, expected {}",
            joints.len(),
            model::pose::N_JOINTS
        )));
    }
    Ok(poses)
}

pub fn lookup<'a, V>(map: &'a HashMap<String, V>, id: &str, what: &str) -> Result<&'a V> {
    map.get(id)
        .ok_or_else(|| TrainingError::runtime(format!("no {what} entry for sample {id}")))
}

/// Decoded RGB image resized to `(height, width)`, with its original size.
pub fn load_rgb(path: &Path, height: usize, width: usize) -> Result<(RgbImage, (u32, u32))> {
    let img = image::open(path)
        .map_err(|err| with_path(err, path))?
        .to_rgb8();
    let size = img.dimensions();
    let resized = if size == (width as u32, height as u32) {
        img
    } else {
        image::imageops::resize(&img, width as u32, height as u32, FilterType::Triangle)
    };
    Ok((resized, size))
}

/// Grayscale image resized with bilinear (`smooth`) or nearest filtering.
pub fn load_gray(path: &Path, height: usize, width: usize, smooth: bool) -> Result<GrayImage> {
    let img = image::open(path)
        .map_err(|err| with_path(err, path))?
        .to_luma8();
    if img.dimensions() == (width as u32, height as u32) {
        return Ok(img);
    }
    let filter = if smooth {
        FilterType::Triangle
    } else {
        FilterType::Nearest
    };
    Ok(image::imageops::resize(
        &img,
        width as u32,
        height as u32,
        filter,
    ))
}

fn with_path(err: image::ImageError, path: &Path) -> TrainingError {
    match err {
        image::ImageError::IoError(io) => TrainingError::Io(std::io::Error::new(
            io.kind(),
            format!("{}: {io}", path.display()),
        )),
        other => TrainingError::runtime(format!("failed to decode {}: {other}", path.display())),
    }
}

/// `(3, h, w)` tensor in `[-1, 1]`.
pub fn rgb_to_tensor(img: &RgbImage) -> Result<Tensor> {
    let (w, h) = img.dimensions();
    let (w, h) = (w as usize, h as usize);
    let raw = img.as_raw();
    let mut data = vec![0f32; 3 * h * w];
    for (i, px) in raw.chunks_exact(3).enumerate() {
        for c in 0..3 {
            data[c * h * w + i] = px[c] as f32 / 127.5 - 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (3, h, w), &Device::Cpu)?)
}

/// `(1, h, w)` tensor in `[-1, 1]`.
pub fn gray_to_tensor(img: &GrayImage) -> Result<Tensor> {
    let (w, h) = img.dimensions();
    let data: Vec<f32> = img.as_raw().iter().map(|&v| v as f32 / 127.5 - 1.0).collect();
    Ok(Tensor::from_vec(data, (1, h as usize, w as usize), &Device::Cpu)?)
}

/// Host buffer of `c` planes of `h * w` values as a `(c, h, w)` tensor.
pub fn planes_to_tensor(data: Vec<f32>, channels: usize, height: usize, width: usize) -> Result<Tensor> {
    Ok(Tensor::from_vec(data, (channels, height, width), &Device::Cpu)?)
}

/// Joint coordinates rescaled from the original image size to the resized
/// one. Missing joints (any negative coordinate) become `[-1, -1]`.
pub fn rescale_joints(
    joints: &[[f32; 2]],
    original: (u32, u32),
    height: usize,
    width: usize,
) -> Vec<[f32; 2]> {
    let sx = width as f32 / original.0.max(1) as f32;
    let sy = height as f32 / original.1.max(1) as f32;
    joints
        .iter()
        .map(|&[x, y]| {
            if x < 0.0 || y < 0.0 {
                [-1.0, -1.0]
            } else {
                [x * sx, y * sy]
            }
        })
        .collect()
}

pub fn joints_to_tensor(joints: &[[f32; 2]]) -> Result<Tensor> {
    let flat: Vec<f32> = joints.iter().flat_map(|xy| xy.iter().copied()).collect();
    Ok(Tensor::from_vec(flat, (joints.len(), 2), &Device::Cpu)?)
}
