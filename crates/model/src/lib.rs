pub mod backbone;
pub mod config;
pub mod discriminator;
pub mod encoder;
pub mod fusion;
pub mod generator;
pub mod image_encoder;
pub mod local_encoder;
pub mod network;
pub mod patch;
pub mod pose;
pub mod registry;
pub mod two_stage;
pub mod vgg;

pub use config::{
    AttributeEncoderConfig, ConditionedGeneratorConfig, DiscriminatorConfig, GeneratorConfig,
};
pub use encoder::{AttributeEncoder, AttributeOutput};
pub use fusion::{FeatureFusionNetwork, FeatureTransNetwork};
pub use image_encoder::ImageEncoder;
pub use local_encoder::LocalEncoder;
pub use network::{ConditionedModule, Network};
pub use pose::{AppearanceType, PoseType};
pub use two_stage::{TwoStageConfig, TwoStageGenerator};
pub use vgg::Vgg19;
