//! Running averages of named errors and the evaluation metrics reported by
//! the pipelines: PSNR/SSIM for generated images, mAP, balanced precision and
//! top-k recall for attribute prediction, top-k accuracy for categories.

use std::cmp::Ordering;

use candle_core::{DType, Device, Tensor};

use crate::TrainingError;

/// Ordered list of named scalar errors from one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Errors {
    entries: Vec<(String, f64)>,
}

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name`, keeping the position of an existing entry.
    pub fn insert(&mut self, name: &str, value: f64) {
        match self.entries.iter_mut().find(|(key, _)| key == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), *value))
    }

    pub fn extend(&mut self, other: &Errors) {
        for (name, value) in other.iter() {
            self.insert(name, value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl std::fmt::Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|(name, value)| format!("{name}: {value:.6}"))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Unweighted running mean of a scalar.
#[derive(Debug, Clone, Default)]
pub struct LossBuffer {
    values: Vec<f64>,
}

impl LossBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.values.push(value);
    }

    /// Mean of the recorded values, `0` when empty.
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.values.iter().sum::<f64>() / self.values.len() as f64
        }
    }

    pub fn take_mean(&mut self) -> f64 {
        let mean = self.mean();
        self.values.clear();
        mean
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Running mean weighted by batch size.
#[derive(Debug, Clone, Default)]
pub struct SmoothLoss {
    sum: f64,
    weight: f64,
}

impl SmoothLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64, batch_size: usize) {
        self.sum += value * batch_size as f64;
        self.weight += batch_size as f64;
    }

    pub fn mean(&self) -> f64 {
        if self.weight == 0.0 {
            0.0
        } else {
            self.sum / self.weight
        }
    }

    pub fn clear(&mut self) {
        self.sum = 0.0;
        self.weight = 0.0;
    }
}

/// One [`LossBuffer`] per error name, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct ErrorBuffer {
    buffers: Vec<(String, LossBuffer)>,
}

impl ErrorBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, errors: &Errors) {
        for (name, value) in errors.iter() {
            match self.buffers.iter_mut().find(|(key, _)| key == name) {
                Some((_, buffer)) => buffer.add(value),
                None => {
                    let mut buffer = LossBuffer::new();
                    buffer.add(value);
                    self.buffers.push((name.to_string(), buffer));
                }
            }
        }
    }

    pub fn summary(&self) -> Errors {
        let mut errors = Errors::new();
        for (name, buffer) in &self.buffers {
            errors.insert(name, buffer.mean());
        }
        errors
    }

    pub fn take_summary(&mut self) -> Errors {
        let summary = self.summary();
        self.clear();
        summary
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

/// Accumulated attribute scores and binary labels, `(samples, attributes)`.
#[derive(Debug, Clone, Default)]
pub struct MeanAp {
    score: Vec<Vec<f32>>,
    label: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct RecallSummary {
    pub class_avg: f64,
    pub per_class: Vec<f64>,
    pub overall: f64,
}

impl MeanAp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.score.clear();
        self.label.clear();
    }

    pub fn len(&self) -> usize {
        self.score.len()
    }

    pub fn is_empty(&self) -> bool {
        self.score.is_empty()
    }

    /// Appends a batch of `(b, n_attr)` scores and labels.
    pub fn add(&mut self, score: &Tensor, label: &Tensor) -> Result<(), TrainingError> {
        if score.dims() != label.dims() || score.rank() != 2 {
            return Err(TrainingError::runtime(format!(
                "shape mismatch: {:?} vs. {:?}",
                score.dims(),
                label.dims()
            )));
        }
        let score = score.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let label = label.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        self.add_rows(score, label)
    }

    pub fn add_rows(&mut self, score: Vec<Vec<f32>>, label: Vec<Vec<f32>>) -> Result<(), TrainingError> {
        let width = self.score.first().map(Vec::len);
        for (s, l) in score.iter().zip(&label) {
            if s.len() != l.len() || width.map_or(false, |w| w != s.len()) {
                return Err(TrainingError::runtime("attribute count changed between batches"));
            }
        }
        self.score.extend(score);
        self.label.extend(label);
        Ok(())
    }

    fn n_attr(&self) -> usize {
        self.score.first().map_or(0, Vec::len)
    }

    /// Interpolated average precision per attribute (x100) and its mean over
    /// attributes that have at least one positive sample. Attributes without
    /// positives report `-1`.
    pub fn compute_mean_ap(&self) -> (f64, Vec<f64>) {
        let m = self.score.len();
        let n = self.n_attr();
        let mut ap = Vec::with_capacity(n);
        for class in 0..n {
            let mut order: Vec<usize> = (0..m).collect();
            order.sort_by(|&a, &b| {
                self.score[b][class]
                    .partial_cmp(&self.score[a][class])
                    .unwrap_or(Ordering::Equal)
                    .then(b.cmp(&a))
            });

            let num_truths: f64 = self.label.iter().map(|row| row[class] as f64).sum();
            let mut tp = 0.0;
            let mut rec = Vec::with_capacity(m);
            // prec[0] is a zero sentinel; prec[i + 1] is precision at rank i.
            let mut prec = vec![0.0; m + 1];
            for (rank, &sample) in order.iter().enumerate() {
                tp += self.label[sample][class] as f64;
                rec.push(tp / num_truths);
                prec[rank + 1] = tp / (rank + 1) as f64;
            }
            for i in (0..m).rev() {
                prec[i] = prec[i].max(prec[i + 1]);
            }

            let mut value = 0.0;
            for i in 0..=m {
                let lower = if i == 0 { 0.0 } else { rec[i - 1] };
                let upper = if i == m { 1.0 } else { rec[i] };
                value += prec[i] * (upper - lower);
            }
            ap.push(if value.is_nan() { -1.0 } else { value * 100.0 });
        }

        let valid: Vec<f64> = ap.iter().copied().filter(|v| *v >= 0.0).collect();
        (mean(&valid), ap)
    }

    /// Per-sample top-k tags: the `k` highest-scoring attributes of each row.
    fn top_k_tags(&self, k: usize) -> Vec<Vec<bool>> {
        self.score
            .iter()
            .map(|row| {
                let mut order: Vec<usize> = (0..row.len()).collect();
                order.sort_by(|&a, &b| row[b].partial_cmp(&row[a]).unwrap_or(Ordering::Equal));
                let mut tag = vec![false; row.len()];
                for &idx in order.iter().take(k) {
                    tag[idx] = true;
                }
                tag
            })
            .collect()
    }

    /// Recall of the top-k tags, per attribute (x100), averaged over
    /// attributes with positives, and overall.
    pub fn compute_recall(&self, k: usize) -> RecallSummary {
        let n = self.n_attr();
        let tags = self.top_k_tags(k);
        let mut hit = vec![0.0; n];
        let mut total = vec![0.0; n];
        for (tag, label) in tags.iter().zip(&self.label) {
            for class in 0..n {
                let positive = label[class] as f64;
                total[class] += positive;
                if tag[class] {
                    hit[class] += positive;
                }
            }
        }
        let per_class: Vec<f64> = hit
            .iter()
            .zip(&total)
            .map(|(h, t)| if *t > 0.0 { h / t * 100.0 } else { f64::NAN })
            .collect();
        let valid: Vec<f64> = per_class.iter().copied().filter(|v| !v.is_nan()).collect();
        let hit_sum: f64 = hit.iter().sum();
        let total_sum: f64 = total.iter().sum();
        RecallSummary {
            class_avg: mean(&valid),
            per_class,
            overall: if total_sum > 0.0 { hit_sum / total_sum * 100.0 } else { 0.0 },
        }
    }

    /// Mean of true-positive and true-negative rates at threshold 0.5 (x100).
    pub fn compute_balanced_precision(&self) -> (f64, Vec<f64>) {
        let n = self.n_attr();
        let mut per_class = Vec::with_capacity(n);
        for class in 0..n {
            let (mut tp, mut tn, mut pos, mut neg) = (0.0, 0.0, 0.0, 0.0);
            for (score, label) in self.score.iter().zip(&self.label) {
                if label[class] == 1.0 {
                    pos += 1.0;
                    if score[class] > 0.5 {
                        tp += 1.0;
                    }
                } else if label[class] == 0.0 {
                    neg += 1.0;
                    if score[class] < 0.5 {
                        tn += 1.0;
                    }
                }
            }
            let p_pos = if pos > 0.0 { tp / pos } else { f64::NAN };
            let p_neg = if neg > 0.0 { tn / neg } else { f64::NAN };
            per_class.push((p_pos + p_neg) / 2.0 * 100.0);
        }
        let valid: Vec<f64> = per_class.iter().copied().filter(|v| !v.is_nan()).collect();
        (mean(&valid), per_class)
    }

    /// Sample-averaged top-k recall; samples without positive attributes
    /// count as fully recalled.
    pub fn compute_recall_sample_avg(&self, k: usize) -> f64 {
        let tags = self.top_k_tags(k);
        let recalls: Vec<f64> = tags
            .iter()
            .zip(&self.label)
            .map(|(tag, label)| {
                let gt: f64 = label.iter().map(|&v| v as f64).sum();
                let hit: f64 = tag
                    .iter()
                    .zip(label)
                    .filter(|(t, _)| **t)
                    .map(|(_, &v)| v as f64)
                    .sum();
                if gt == 0.0 {
                    1.0
                } else {
                    hit / gt
                }
            })
            .collect();
        mean(&recalls) * 100.0
    }
}

/// Accumulated class scores `(samples, classes)` and class indices.
#[derive(Debug, Clone, Default)]
pub struct ClassificationAccuracy {
    score: Vec<Vec<f32>>,
    label: Vec<u32>,
}

impl ClassificationAccuracy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.score.clear();
        self.label.clear();
    }

    pub fn add(&mut self, score: &Tensor, label: &Tensor) -> Result<(), TrainingError> {
        let (b, _) = score.dims2()?;
        if label.dims() != [b] {
            return Err(TrainingError::runtime(format!(
                "shape mismatch: {:?} vs. {:?}",
                score.dims(),
                label.dims()
            )));
        }
        self.score.extend(score.to_dtype(DType::F32)?.to_vec2::<f32>()?);
        self.label.extend(label.to_dtype(DType::U32)?.to_vec1::<u32>()?);
        Ok(())
    }

    /// Share of samples whose label is among the `k` best scores (x100).
    pub fn compute_accuracy(&self, k: usize) -> f64 {
        if self.score.is_empty() {
            return 0.0;
        }
        let hits = self
            .score
            .iter()
            .zip(&self.label)
            .filter(|(row, &label)| {
                let Some(&target) = row.get(label as usize) else {
                    return false;
                };
                row.iter().filter(|&&s| s > target).count() < k
            })
            .count();
        hits as f64 / self.score.len() as f64 * 100.0
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Peak signal-to-noise ratio of images in `[-1, 1]`, averaged over the batch.
pub fn psnr(pred: &Tensor, target: &Tensor) -> Result<f64, TrainingError> {
    let (b, _, _, _) = pred.dims4()?;
    let diff = ((pred.to_dtype(DType::F32)? - target.to_dtype(DType::F32)?)? * 0.5)?;
    let mse = diff.sqr()?.reshape((b, ()))?.mean(1)?.to_vec1::<f32>()?;
    let values: Vec<f64> = mse
        .iter()
        .map(|&m| 10.0 * (1.0 / (m as f64).max(1e-10)).log10())
        .collect();
    Ok(mean(&values))
}

const SSIM_WINDOW: usize = 11;
const SSIM_SIGMA: f64 = 1.5;

fn gaussian_window(channels: usize, device: &Device) -> Result<Tensor, TrainingError> {
    let center = (SSIM_WINDOW / 2) as f64;
    let g: Vec<f64> = (0..SSIM_WINDOW)
        .map(|i| (-((i as f64 - center).powi(2)) / (2.0 * SSIM_SIGMA * SSIM_SIGMA)).exp())
        .collect();
    let total: f64 = g.iter().sum();
    let mut window = Vec::with_capacity(SSIM_WINDOW * SSIM_WINDOW);
    for y in &g {
        for x in &g {
            window.push((y * x / (total * total)) as f32);
        }
    }
    let window = Tensor::from_vec(window, (1, 1, SSIM_WINDOW, SSIM_WINDOW), device)?;
    Ok(window.repeat((channels, 1, 1, 1))?)
}

/// Structural similarity of images in `[-1, 1]` with an 11x11 Gaussian
/// window (sigma 1.5), averaged over pixels and batch.
pub fn ssim(pred: &Tensor, target: &Tensor) -> Result<f64, TrainingError> {
    let (_, c, _, _) = pred.dims4()?;
    let x = pred.to_dtype(DType::F32)?.affine(0.5, 0.5)?;
    let y = target.to_dtype(DType::F32)?.affine(0.5, 0.5)?;
    let window = gaussian_window(c, x.device())?;
    let pad = SSIM_WINDOW / 2;
    let blur = |t: &Tensor| t.conv2d(&window, pad, 1, 1, c);

    let mu_x = blur(&x)?;
    let mu_y = blur(&y)?;
    let mu_x2 = mu_x.sqr()?;
    let mu_y2 = mu_y.sqr()?;
    let mu_xy = (&mu_x * &mu_y)?;
    let sigma_x = (blur(&x.sqr()?)? - &mu_x2)?;
    let sigma_y = (blur(&y.sqr()?)? - &mu_y2)?;
    let sigma_xy = (blur(&(&x * &y)?)? - &mu_xy)?;

    let c1 = 0.01f64.powi(2);
    let c2 = 0.03f64.powi(2);
    let numerator = (mu_xy.affine(2.0, c1)? * sigma_xy.affine(2.0, c2)?)?;
    let denominator = ((mu_x2 + mu_y2)?.affine(1.0, c1)? * (sigma_x + sigma_y)?.affine(1.0, c2)?)?;
    let map = (numerator / denominator)?;
    Ok(map.mean_all()?.to_vec0::<f32>()? as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(score: Vec<Vec<f32>>, label: Vec<Vec<f32>>) -> MeanAp {
        let mut map = MeanAp::new();
        map.add_rows(score, label).unwrap();
        map
    }

    #[test]
    fn perfect_ranking_scores_full_ap() {
        let map = tracker(
            vec![
                vec![0.9, 0.1],
                vec![0.8, 0.2],
                vec![0.2, 0.7],
                vec![0.1, 0.6],
            ],
            vec![
                vec![1.0, 0.0],
                vec![1.0, 0.0],
                vec![0.0, 1.0],
                vec![0.0, 1.0],
            ],
        );
        let (mean_ap, ap) = map.compute_mean_ap();
        assert!((mean_ap - 100.0).abs() < 1e-9);
        assert_eq!(ap.len(), 2);
        let (bp, _) = map.compute_balanced_precision();
        assert!((bp - 100.0).abs() < 1e-9);
        assert!((map.compute_recall(1).overall - 100.0).abs() < 1e-9);
        assert!((map.compute_recall_sample_avg(1) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn inverted_ranking_halves_ap() {
        let map = tracker(
            vec![
                vec![0.1, 0.9],
                vec![0.2, 0.8],
                vec![0.7, 0.2],
                vec![0.6, 0.1],
            ],
            vec![
                vec![1.0, 0.0],
                vec![1.0, 0.0],
                vec![0.0, 1.0],
                vec![0.0, 1.0],
            ],
        );
        let (mean_ap, _) = map.compute_mean_ap();
        assert!((mean_ap - 50.0).abs() < 1e-9, "{mean_ap}");
        let (bp, _) = map.compute_balanced_precision();
        assert!(bp.abs() < 1e-9);
        assert!(map.compute_recall(1).overall.abs() < 1e-9);
    }

    #[test]
    fn attribute_without_positives_is_excluded() {
        let map = tracker(
            vec![vec![0.9, 0.3], vec![0.1, 0.4]],
            vec![vec![1.0, 0.0], vec![0.0, 0.0]],
        );
        let (mean_ap, ap) = map.compute_mean_ap();
        assert_eq!(ap[1], -1.0);
        assert!((mean_ap - 100.0).abs() < 1e-9);
        // Second sample has no positives and counts as recalled.
        assert!((map.compute_recall_sample_avg(1) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn top_k_accuracy() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let mut acc = ClassificationAccuracy::new();
        let score = Tensor::new(&[[0.1f32, 0.7, 0.2], [0.5, 0.3, 0.2]], &device)?;
        let label = Tensor::new(&[2u32, 0], &device)?;
        acc.add(&score, &label)?;
        assert!((acc.compute_accuracy(1) - 50.0).abs() < 1e-9);
        assert!((acc.compute_accuracy(2) - 100.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn buffers_average_named_errors() {
        let mut buffer = ErrorBuffer::new();
        let mut errors = Errors::new();
        errors.insert("loss_L1", 1.0);
        errors.insert("PSNR", 20.0);
        buffer.add(&errors);
        errors.insert("loss_L1", 3.0);
        buffer.add(&errors);
        let summary = buffer.take_summary();
        assert_eq!(summary.get("loss_L1"), Some(2.0));
        assert_eq!(summary.iter().next().map(|(k, _)| k), Some("loss_L1"));
        assert!(buffer.summary().is_empty());

        let mut smooth = SmoothLoss::new();
        smooth.add(1.0, 1);
        smooth.add(4.0, 3);
        assert!((smooth.mean() - 3.25).abs() < 1e-12);
        assert_eq!(LossBuffer::new().mean(), 0.0);
    }

    #[test]
    fn identical_images_have_unit_ssim() -> Result<(), TrainingError> {
        let img = Tensor::randn(0f32, 0.5, (2, 3, 16, 16), &Device::Cpu)?.clamp(-1.0, 1.0)?;
        assert!((ssim(&img, &img)? - 1.0).abs() < 1e-4);
        let noisy = (&img + 0.5)?.clamp(-1.0, 1.0)?;
        assert!(ssim(&img, &noisy)? < 1.0);
        assert!(psnr(&img, &noisy)? < psnr(&img, &((&img + 0.01)?))?);
        Ok(())
    }
}
