//! Image grids of batch visuals and per-sample output images.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::RgbImage;

use crate::TrainingError;

type Result<T> = std::result::Result<T, TrainingError>;

/// Colors of the segmentation labels (background, hair, face, top, bottom,
/// arms, legs).
const SEG_PALETTE: [[u8; 3]; 7] = [
    [0, 0, 0],
    [128, 0, 0],
    [255, 170, 127],
    [0, 128, 255],
    [0, 0, 128],
    [255, 255, 0],
    [0, 170, 0],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualKind {
    /// Images in `[-1, 1]`; single-channel maps are shown as gray.
    Rgb,
    /// Heatmaps in `[0, 1]`, merged by a channel-wise max.
    Pose,
    /// One-hot segmentation, colored by label.
    Seg,
}

#[derive(Debug, Clone)]
pub struct Visual {
    pub name: String,
    /// `(b, c, h, w)`.
    pub tensor: Tensor,
    pub kind: VisualKind,
}

impl Visual {
    pub fn new(name: impl Into<String>, tensor: Tensor, kind: VisualKind) -> Self {
        Self {
            name: name.into(),
            tensor,
            kind,
        }
    }
}

/// `(3, h, w)` image in `[-1, 1]` for one `(c, h, w)` item.
fn to_display(item: &Tensor, kind: VisualKind) -> Result<Tensor> {
    let item = item.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let (c, h, w) = item.dims3()?;
    Ok(match kind {
        VisualKind::Rgb if c == 3 => item,
        VisualKind::Rgb => item.max_keepdim(0)?.repeat((3, 1, 1))?,
        VisualKind::Pose => item.max_keepdim(0)?.clamp(0f32, 1f32)?.affine(2.0, -1.0)?.repeat((3, 1, 1))?,
        VisualKind::Seg => {
            let labels = item.argmax(0)?.flatten_all()?.to_vec1::<u32>()?;
            let mut data = vec![0f32; 3 * h * w];
            for (i, label) in labels.into_iter().enumerate() {
                let color = SEG_PALETTE[label as usize % SEG_PALETTE.len()];
                for ch in 0..3 {
                    data[ch * h * w + i] = color[ch] as f32 / 127.5 - 1.0;
                }
            }
            Tensor::from_vec(data, (3, h, w), &Device::Cpu)?
        }
    })
}

/// `(3, h, w)` tensor in `[-1, 1]` to an 8-bit image.
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let (c, h, w) = tensor.dims3()?;
    if c != 3 {
        return Err(TrainingError::runtime(format!(
            "expected a 3-channel image, got {c} channels"
        )));
    }
    let data = tensor
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(127.5, 127.5)?
        .clamp(0f32, 255f32)?
        .round()?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_dtype(DType::U8)?
        .to_vec1::<u8>()?;
    RgbImage::from_raw(w as u32, h as u32, data)
        .ok_or_else(|| TrainingError::runtime("image buffer does not match its size"))
}

pub fn save_image(tensor: &Tensor, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tensor_to_image(tensor)?.save(path)?;
    Ok(())
}

/// Saves one row per sample and one column per visual.
pub fn save_grid(visuals: &[Visual], path: &Path) -> Result<()> {
    let Some(first) = visuals.first() else {
        return Err(TrainingError::runtime("no visuals to save"));
    };
    let (n, _, h, w) = first.tensor.dims4()?;
    let mut rows = Vec::with_capacity(n);
    for i in 0..n {
        let mut columns = Vec::with_capacity(visuals.len());
        for visual in visuals {
            let (b, _, vh, vw) = visual.tensor.dims4()?;
            if b != n || (vh, vw) != (h, w) {
                return Err(TrainingError::runtime(format!(
                    "visual {} has shape {:?}, expected {n} items of {h}x{w}",
                    visual.name,
                    visual.tensor.dims()
                )));
            }
            columns.push(to_display(&visual.tensor.get(i)?, visual.kind)?);
        }
        rows.push(Tensor::cat(&columns, 2)?);
    }
    save_image(&Tensor::cat(&rows, 1)?, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_tiles_samples_and_visuals() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vis").join("grid.png");
        let visuals = vec![
            Visual::new("img", Tensor::zeros((2, 3, 4, 5), DType::F32, &device)?, VisualKind::Rgb),
            Visual::new("joint", Tensor::ones((2, 18, 4, 5), DType::F32, &device)?, VisualKind::Pose),
            Visual::new("seg", Tensor::ones((2, 7, 4, 5), DType::F32, &device)?, VisualKind::Seg),
        ];
        save_grid(&visuals, &path)?;
        let grid = image::open(&path)?.to_rgb8();
        assert_eq!(grid.dimensions(), (15, 8));
        assert_eq!(grid.get_pixel(6, 1).0, [255, 255, 255]);
        assert_eq!(grid.get_pixel(0, 0).0, [128, 128, 128]);
        Ok(())
    }

    #[test]
    fn mismatched_visual_is_rejected() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let visuals = vec![
            Visual::new("a", Tensor::zeros((2, 3, 4, 4), DType::F32, &device)?, VisualKind::Rgb),
            Visual::new("b", Tensor::zeros((1, 3, 4, 4), DType::F32, &device)?, VisualKind::Rgb),
        ];
        let dir = tempfile::tempdir()?;
        assert!(save_grid(&visuals, &dir.path().join("bad.png")).is_err());
        Ok(())
    }
}
