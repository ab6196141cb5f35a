//! Host-side rendering of pose representations from joint coordinates.
//!
//! Joints follow the 18-point layout: 0 nose, 1 neck, 2-4 right
//! shoulder/elbow/wrist, 5-7 left shoulder/elbow/wrist, 8-10 right
//! hip/knee/ankle, 11-13 left hip/knee/ankle, 14-17 eyes and ears.
//! Every buffer is `channels * h * w` values in plane order.

use model::pose::{N_JOINTS, N_LIMBS, SEG_NC};
use rand::Rng;

/// Joint pairs drawn as stickman bones.
pub const BONES: [(usize, usize); 17] = [
    (1, 2),
    (1, 5),
    (2, 3),
    (3, 4),
    (5, 6),
    (6, 7),
    (1, 8),
    (8, 9),
    (9, 10),
    (1, 11),
    (11, 12),
    (12, 13),
    (1, 0),
    (0, 14),
    (14, 16),
    (0, 15),
    (15, 17),
];

const BONE_COLORS: [[u8; 3]; 17] = [
    [255, 0, 0],
    [255, 85, 0],
    [255, 170, 0],
    [255, 255, 0],
    [170, 255, 0],
    [85, 255, 0],
    [0, 255, 0],
    [0, 255, 85],
    [0, 255, 170],
    [0, 255, 255],
    [0, 170, 255],
    [0, 85, 255],
    [0, 0, 255],
    [85, 0, 255],
    [170, 0, 255],
    [255, 0, 255],
    [255, 0, 170],
];

/// Body parts cut out for the limb appearance encoding: head, torso, right
/// arm, left arm, right thigh, right shin, left thigh, left shin.
pub const LIMBS: [&[(usize, usize)]; N_LIMBS] = [
    &[(0, 1)],
    &[(2, 11), (5, 8)],
    &[(2, 3), (3, 4)],
    &[(5, 6), (6, 7)],
    &[(8, 9)],
    &[(9, 10)],
    &[(11, 12)],
    &[(12, 13)],
];

fn valid(joint: [f32; 2]) -> bool {
    joint[0] >= 0.0 && joint[1] >= 0.0
}

fn segment_distance_sq(px: f32, py: f32, a: [f32; 2], b: [f32; 2]) -> f32 {
    let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq == 0.0 {
        0.0
    } else {
        (((px - a[0]) * dx + (py - a[1]) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (a[0] + t * dx, a[1] + t * dy);
    (px - cx).powi(2) + (py - cy).powi(2)
}

/// Marks pixels within `radius` of the segment `a`-`b` in one plane.
fn fill_segment(plane: &mut [f32], height: usize, width: usize, a: [f32; 2], b: [f32; 2], radius: f32, value: f32) {
    let r = radius.max(0.5);
    let x0 = (a[0].min(b[0]) - r).floor().max(0.0) as usize;
    let x1 = ((a[0].max(b[0]) + r).ceil() as usize).min(width.saturating_sub(1));
    let y0 = (a[1].min(b[1]) - r).floor().max(0.0) as usize;
    let y1 = ((a[1].max(b[1]) + r).ceil() as usize).min(height.saturating_sub(1));
    if x0 > x1 || y0 > y1 {
        return;
    }
    for y in y0..=y1 {
        for x in x0..=x1 {
            if segment_distance_sq(x as f32, y as f32, a, b) <= r * r {
                plane[y * width + x] = value;
            }
        }
    }
}

/// One binary disc of `radius` per joint; missing joints give empty planes.
pub fn joint_heatmaps(joints: &[[f32; 2]], height: usize, width: usize, radius: usize) -> Vec<f32> {
    let hw = height * width;
    let mut data = vec![0f32; N_JOINTS * hw];
    for (j, &joint) in joints.iter().take(N_JOINTS).enumerate() {
        if valid(joint) {
            fill_segment(&mut data[j * hw..(j + 1) * hw], height, width, joint, joint, radius as f32, 1.0);
        }
    }
    data
}

/// Colored bones on a black background, 3 planes in `[-1, 1]`.
pub fn stickman(joints: &[[f32; 2]], height: usize, width: usize, thickness: f32) -> Vec<f32> {
    let hw = height * width;
    let mut data = vec![-1f32; 3 * hw];
    for (bone, &(a, b)) in BONES.iter().enumerate() {
        let (Some(&ja), Some(&jb)) = (joints.get(a), joints.get(b)) else {
            continue;
        };
        if !(valid(ja) && valid(jb)) {
            continue;
        }
        let mut mask = vec![0f32; hw];
        fill_segment(&mut mask, height, width, ja, jb, thickness, 1.0);
        for (i, _) in mask.iter().enumerate().filter(|(_, m)| **m > 0.0) {
            for c in 0..3 {
                data[c * hw + i] = BONE_COLORS[bone][c] as f32 / 127.5 - 1.0;
            }
        }
    }
    data
}

/// One binary mask per entry of [`LIMBS`].
pub fn limb_masks(joints: &[[f32; 2]], height: usize, width: usize, thickness: f32) -> Vec<f32> {
    let hw = height * width;
    let mut data = vec![0f32; N_LIMBS * hw];
    for (l, segments) in LIMBS.iter().enumerate() {
        let plane = &mut data[l * hw..(l + 1) * hw];
        for &(a, b) in segments.iter() {
            let (Some(&ja), Some(&jb)) = (joints.get(a), joints.get(b)) else {
                continue;
            };
            if valid(ja) && valid(jb) {
                fill_segment(plane, height, width, ja, jb, thickness, 1.0);
            }
        }
    }
    data
}

/// One-hot planes of a label map; labels outside `0..SEG_NC` stay unset.
pub fn seg_one_hot(labels: &[u8], height: usize, width: usize) -> Vec<f32> {
    let hw = height * width;
    let mut data = vec![0f32; SEG_NC * hw];
    for (i, &label) in labels.iter().take(hw).enumerate() {
        let label = label as usize;
        if label < SEG_NC {
            data[label * hw + i] = 1.0;
        }
    }
    data
}

/// Isotropic scale about the image centre followed by a translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineJitter {
    pub scale: f32,
    pub dx: f32,
    pub dy: f32,
}

impl AffineJitter {
    /// Scale in `[0.9, 1.1]`, shifts within 5% of each side.
    pub fn sample<R: Rng + ?Sized>(rng: &mut R, height: usize, width: usize) -> Self {
        Self {
            scale: rng.gen_range(0.9..=1.1),
            dx: rng.gen_range(-0.05..=0.05) * width as f32,
            dy: rng.gen_range(-0.05..=0.05) * height as f32,
        }
    }

    pub fn apply(&self, joint: [f32; 2], height: usize, width: usize) -> [f32; 2] {
        if !valid(joint) {
            return joint;
        }
        let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
        let x = (joint[0] - cx) * self.scale + cx + self.dx;
        let y = (joint[1] - cy) * self.scale + cy + self.dy;
        if x < 0.0 || y < 0.0 || x >= width as f32 || y >= height as f32 {
            [-1.0, -1.0]
        } else {
            [x, y]
        }
    }

    /// Nearest-neighbour warp of `channels` planes; pixels mapped from
    /// outside the frame take `fill[c]`.
    pub fn warp(&self, data: &[f32], channels: usize, height: usize, width: usize, fill: &[f32]) -> Vec<f32> {
        let hw = height * width;
        let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
        let mut out = vec![0f32; channels * hw];
        for y in 0..height {
            for x in 0..width {
                let sx = ((x as f32 - cx - self.dx) / self.scale + cx).round();
                let sy = ((y as f32 - cy - self.dy) / self.scale + cy).round();
                let inside = sx >= 0.0 && sy >= 0.0 && (sx as usize) < width && (sy as usize) < height;
                for c in 0..channels {
                    out[c * hw + y * width + x] = if inside {
                        data[c * hw + sy as usize * width + sx as usize]
                    } else {
                        fill.get(c).copied().unwrap_or(0.0)
                    };
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing() -> Vec<[f32; 2]> {
        vec![[-1.0, -1.0]; N_JOINTS]
    }

    #[test]
    fn heatmap_disc_has_expected_area() {
        let mut joints = missing();
        joints[3] = [8.0, 8.0];
        let data = joint_heatmaps(&joints, 16, 16, 2);
        let hw = 256;
        let area: f32 = data[3 * hw..4 * hw].iter().sum();
        // Lattice points within distance 2 of the centre.
        assert_eq!(area, 13.0);
        assert_eq!(data.iter().sum::<f32>(), 13.0);
    }

    #[test]
    fn missing_joint_draws_no_bone() {
        let mut joints = missing();
        joints[1] = [4.0, 4.0];
        let blank = stickman(&joints, 8, 8, 1.0);
        assert!(blank.iter().all(|&v| v == -1.0));
        joints[2] = [4.0, 7.0];
        let drawn = stickman(&joints, 8, 8, 1.0);
        assert!(drawn.iter().any(|&v| v > -1.0));
    }

    #[test]
    fn one_hot_ignores_unknown_labels() {
        let data = seg_one_hot(&[0, 6, 9, 2], 2, 2);
        assert_eq!(data.len(), SEG_NC * 4);
        assert_eq!(data.iter().sum::<f32>(), 3.0);
        assert_eq!(data[6 * 4 + 1], 1.0);
    }

    #[test]
    fn identity_jitter_keeps_maps() {
        let jitter = AffineJitter {
            scale: 1.0,
            dx: 0.0,
            dy: 0.0,
        };
        let data: Vec<f32> = (0..16).map(|v| v as f32).collect();
        assert_eq!(jitter.warp(&data, 1, 4, 4, &[0.0]), data);
        assert_eq!(jitter.apply([1.0, 2.0], 4, 4), [1.0, 2.0]);

        let shift = AffineJitter {
            scale: 1.0,
            dx: 1.0,
            dy: 0.0,
        };
        let out = shift.warp(&data, 1, 4, 4, &[-5.0]);
        assert_eq!(&out[..4], &[-5.0, 0.0, 1.0, 2.0]);
        assert_eq!(shift.apply([3.5, 1.0], 4, 4), [-1.0, -1.0]);
    }
}
