//! Pose and appearance encodings fed to pose-transfer generators.
//!
//! A pose type such as `joint+seg` names the representations stacked on the
//! channel axis, in sorted order; an appearance type is either the image
//! itself or per-limb crops.

use std::{fmt, str::FromStr};

use candle_core::{Error, Result, Tensor};

use crate::config::unknown;

pub const N_JOINTS: usize = 18;
pub const SEG_NC: usize = 7;
pub const N_LIMBS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PoseItem {
    Joint,
    Seg,
    Stickman,
}

impl PoseItem {
    pub fn channels(self) -> usize {
        match self {
            PoseItem::Joint => N_JOINTS,
            PoseItem::Seg => SEG_NC,
            PoseItem::Stickman => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PoseItem::Joint => "joint",
            PoseItem::Seg => "seg",
            PoseItem::Stickman => "stickman",
        }
    }
}

impl FromStr for PoseItem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "joint" => Ok(PoseItem::Joint),
            "seg" => Ok(PoseItem::Seg),
            "stickman" => Ok(PoseItem::Stickman),
            other => Err(unknown("pose type", other, &["joint", "seg", "stickman"])),
        }
    }
}

/// Sorted, de-duplicated list of pose representations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoseType(Vec<PoseItem>);

impl PoseType {
    pub fn items(&self) -> &[PoseItem] {
        &self.0
    }

    pub fn contains(&self, item: PoseItem) -> bool {
        self.0.contains(&item)
    }

    pub fn dim(&self) -> usize {
        self.0.iter().map(|item| item.channels()).sum()
    }

    /// Concatenates the requested representations; `field` returns the
    /// tensor stored for a representation name (`joint`, `seg`, `stickman`).
    pub fn compose<'a, F>(&self, field: F) -> Result<Tensor>
    where
        F: Fn(&str) -> Option<&'a Tensor>,
    {
        let parts = self
            .0
            .iter()
            .map(|item| {
                field(item.as_str()).ok_or_else(|| {
                    Error::Msg(format!("pose representation [{}] missing from batch", item.as_str()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&parts, 1)
    }
}

impl FromStr for PoseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut items = s
            .split('+')
            .map(|part| part.trim().parse::<PoseItem>())
            .collect::<Result<Vec<_>>>()?;
        items.sort();
        items.dedup();
        Ok(Self(items))
    }
}

impl fmt::Display for PoseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|item| item.as_str()).collect();
        f.write_str(&names.join("+"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppearanceType {
    #[default]
    Image,
    Limb,
}

impl AppearanceType {
    pub fn dim(self) -> usize {
        match self {
            AppearanceType::Image => 3,
            AppearanceType::Limb => N_LIMBS * 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppearanceType::Image => "image",
            AppearanceType::Limb => "limb",
        }
    }
}

impl FromStr for AppearanceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image" => Ok(AppearanceType::Image),
            "limb" => Ok(AppearanceType::Limb),
            other => Err(unknown("appearance type", other, &["image", "limb"])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn pose_type_is_sorted() -> Result<()> {
        let pose: PoseType = "stickman+joint".parse()?;
        assert_eq!(pose.to_string(), "joint+stickman");
        assert_eq!(pose.dim(), 21);
        assert!("joint+depth".parse::<PoseType>().is_err());
        Ok(())
    }

    #[test]
    fn compose_stacks_in_order() -> Result<()> {
        let device = Device::Cpu;
        let joint = Tensor::zeros((1, 18, 4, 4), DType::F32, &device)?;
        let seg = Tensor::ones((1, 7, 4, 4), DType::F32, &device)?;
        let pose: PoseType = "seg+joint".parse()?;
        let out = pose.compose(|name| match name {
            "joint" => Some(&joint),
            "seg" => Some(&seg),
            _ => None,
        })?;
        assert_eq!(out.dims(), &[1, 25, 4, 4]);
        assert_eq!(out.narrow(1, 0, 18)?.sum_all()?.to_vec0::<f32>()?, 0.0);

        let stick: PoseType = "stickman".parse()?;
        assert!(stick.compose(|_| None).is_err());
        Ok(())
    }
}
