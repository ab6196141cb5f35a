//! Convolutional building blocks for image-to-image generators.
//!
//! Every block here consumes and produces `(batch, channels, height, width)`
//! tensors. Blocks are assembled from Candle primitives and constructed from a
//! [`candle_nn::VarBuilder`] so parameters land in a shared `VarMap` that the
//! training crate can checkpoint by name.

use thiserror::Error;

pub mod activations;
pub mod checks;
pub mod conv;
pub mod init;
pub mod norm;
pub mod padding;
pub mod pooling;
pub mod resample;
pub mod residual;

pub use activations::ActivationKind;
pub use conv::{ConvBlock, ConvBlockConfig, UpConvBlock};
pub use init::InitKind;
pub use norm::{Norm2d, NormKind};
pub use padding::PaddingKind;
pub use residual::{ConditionedResnetBlock, ResnetBlock, ResnetBlockConfig};

/// Errors raised while resolving named layer variants from configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayerError {
    #[error("normalization layer [{0}] is not found")]
    UnknownNorm(String),
    #[error("padding [{0}] is not implemented")]
    UnknownPadding(String),
    #[error("activation [{0}] is not implemented")]
    UnknownActivation(String),
    #[error("initialization method [{0}] is not implemented")]
    UnknownInit(String),
}

impl From<LayerError> for candle_core::Error {
    fn from(err: LayerError) -> Self {
        candle_core::Error::Msg(err.to_string())
    }
}
