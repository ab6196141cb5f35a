//! Frozen VGG19 feature extractor for perceptual losses.
//!
//! Weights come from a safetensors file using the usual `features.<i>.weight`
//! names. Features are taken after relu1_1, relu2_1, relu3_1, relu4_1 and
//! relu5_1.

use std::path::Path;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module, VarBuilder};
use layers::checks;

/// Per-layer weights of the content loss, shallow to deep.
pub const LAYER_WEIGHTS: [f64; 5] = [1.0 / 32.0, 1.0 / 16.0, 1.0 / 8.0, 1.0 / 4.0, 1.0];

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// `Some(width)` is a 3x3 conv + ReLU, `None` a 2x2 max pool.
const LAYOUT: [Option<usize>; 20] = [
    Some(64),
    Some(64),
    None,
    Some(128),
    Some(128),
    None,
    Some(256),
    Some(256),
    Some(256),
    Some(256),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
];

/// Layout positions whose ReLU output is tapped (relu1_1 .. relu5_1).
const TAPS: [usize; 5] = [0, 3, 6, 11, 16];

#[derive(Debug, Clone)]
enum Op {
    Conv(Conv2d),
    Pool,
}

#[derive(Debug, Clone)]
pub struct Vgg19 {
    ops: Vec<Op>,
    mean: Tensor,
    std: Tensor,
}

impl Vgg19 {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let features = vb.pp("features");
        let mut ops = Vec::new();
        let mut c_in = 3;
        // Positions in the sequential module: conv and ReLU are separate
        // entries, so each conv advances the index by two.
        let mut index = 0;
        for layer in LAYOUT.iter().take(TAPS[4] + 1) {
            match layer {
                Some(width) => {
                    let config = Conv2dConfig {
                        padding: 1,
                        ..Default::default()
                    };
                    ops.push(Op::Conv(conv2d(c_in, *width, 3, config, features.pp(index))?));
                    c_in = *width;
                    index += 2;
                }
                None => {
                    ops.push(Op::Pool);
                    index += 1;
                }
            }
        }
        let device = vb.device();
        let mean = Tensor::new(&MEAN, device)?.reshape((1, 3, 1, 1))?.to_dtype(vb.dtype())?;
        let std = Tensor::new(&STD, device)?.reshape((1, 3, 1, 1))?.to_dtype(vb.dtype())?;
        Ok(Self { ops, mean, std })
    }

    /// Loads the extractor from a safetensors file.
    pub fn load(path: &Path, dtype: DType, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)?;
        Self::new(VarBuilder::from_tensors(tensors, dtype, device))
    }

    /// Five feature maps of an image in `[-1, 1]`.
    pub fn features(&self, img: &Tensor) -> Result<Vec<Tensor>> {
        checks::expect_channels("vgg19", img, 3)?;
        let xs = img.affine(0.5, 0.5)?;
        let mut xs = xs.broadcast_sub(&self.mean)?.broadcast_div(&self.std)?;
        let mut out = Vec::with_capacity(TAPS.len());
        for (i, op) in self.ops.iter().enumerate() {
            xs = match op {
                Op::Conv(conv) => conv.forward(&xs)?.relu()?,
                Op::Pool => xs.max_pool2d(2)?,
            };
            if TAPS.contains(&i) {
                out.push(xs.clone());
            }
        }
        Ok(out)
    }

    /// Weighted L1 between features of `pred` and (detached) `target`.
    pub fn content_loss(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        let pred = self.features(pred)?;
        let target = self.features(&target.detach())?;
        weighted_sum(&pred, &target, |a, b| (a - b.detach())?.abs()?.mean_all())
    }

    /// Weighted L1 between Gram matrices of the features.
    pub fn style_loss(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        let pred = self.features(pred)?;
        let target = self.features(&target.detach())?;
        weighted_sum(&pred, &target, |a, b| {
            (gram_matrix(a)? - gram_matrix(&b.detach())?)?.abs()?.mean_all()
        })
    }
}

fn weighted_sum<F>(pred: &[Tensor], target: &[Tensor], term: F) -> Result<Tensor>
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor>,
{
    let mut total: Option<Tensor> = None;
    for ((a, b), weight) in pred.iter().zip(target).zip(LAYER_WEIGHTS) {
        let value = term(a, b)?.affine(weight, 0.0)?;
        total = Some(match total {
            Some(sum) => (sum + value)?,
            None => value,
        });
    }
    match total {
        Some(total) => Ok(total),
        None => Err(candle_core::Error::Msg("vgg19 produced no features".into())),
    }
}

/// `(b, c, h, w)` to `(b, c, c)` channel correlations normalized by `c*h*w`.
pub fn gram_matrix(xs: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = checks::expect_nchw("gram_matrix", xs)?;
    let flat = xs.reshape((b, c, h * w))?;
    let gram = flat.matmul(&flat.t()?.contiguous()?)?;
    gram.affine(1.0 / (c * h * w) as f64, 0.0)
}
