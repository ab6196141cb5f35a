//! Coarse-to-fine pose transfer.
//!
//! Stage 1 is a trained pose-transfer generator producing a coarse image.
//! Stage 2 cuts patches around the reference joints, encodes them with a
//! [`LocalEncoder`], places the codes on the target joints and decodes
//! `cat(coarse, local features)` into a residual added to the coarse image.

use candle_core::{DType, Device, Error, Result, Tensor};
use candle_nn::ModuleT;

use crate::{
    config::{GeneratorConfig, LocalEncoderConfig},
    local_encoder::LocalEncoder,
    network::Network,
    patch,
    pose::N_JOINTS,
    registry,
};

#[derive(Debug, Clone, PartialEq)]
pub struct TwoStageConfig {
    /// Joints (indices into the 18-joint layout) that receive a patch.
    pub patch_indices: Vec<usize>,
    pub patch_size: usize,
    pub local_nof: usize,
    pub local_nf: usize,
    pub local_max_nf: usize,
    /// Stage 2 decoder tag, looked up in [`registry::generators`].
    pub decoder: String,
    pub decoder_config: GeneratorConfig,
    pub train_stage_1: bool,
}

impl TwoStageConfig {
    /// Local encoder wiring derived from the patch settings.
    pub fn local_encoder(&self) -> LocalEncoderConfig {
        LocalEncoderConfig {
            n_patch: self.patch_indices.len(),
            input_nc: 3,
            nof: self.local_nof,
            nf: self.local_nf,
            max_nf: self.local_max_nf,
            patch_size: self.patch_size,
            norm: self.decoder_config.norm,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.patch_indices.is_empty() {
            return Err(Error::Msg("two-stage generator needs at least one patch index".into()));
        }
        if let Some(bad) = self.patch_indices.iter().find(|&&i| i >= N_JOINTS) {
            return Err(Error::Msg(format!("patch index {bad} is not a joint index")));
        }
        if self.decoder_config.input_nc != 3 + self.local_nof || self.decoder_config.output_nc != 3
        {
            return Err(Error::Msg(format!(
                "stage 2 decoder must map {} channels to 3, got {} -> {}",
                3 + self.local_nof,
                self.decoder_config.input_nc,
                self.decoder_config.output_nc
            )));
        }
        self.local_encoder().validate()
    }
}

#[derive(Debug, Clone)]
pub struct TwoStageOutput {
    pub img_s1: Tensor,
    pub local_feat: Tensor,
    pub img_out: Tensor,
}

pub struct TwoStageGenerator {
    config: TwoStageConfig,
    stage_1: Network<Box<dyn ModuleT>>,
    encoder: Network<LocalEncoder>,
    decoder: Network<Box<dyn ModuleT>>,
}

impl TwoStageGenerator {
    /// Wraps a built stage 1 generator and creates the stage 2 networks
    /// `netT_s2e` (local encoder) and `netT_s2d` (decoder).
    pub fn new(
        config: TwoStageConfig,
        stage_1: Network<Box<dyn ModuleT>>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let encoder_config = config.local_encoder();
        let encoder = Network::build("netT_s2e", dtype, device, |vb| {
            LocalEncoder::new(encoder_config, vb)
        })?;
        let decoder = Network::build("netT_s2d", dtype, device, |vb| {
            registry::generators().build(&config.decoder, &config.decoder_config, vb)
        })?;
        Ok(Self {
            config,
            stage_1,
            encoder,
            decoder,
        })
    }

    pub fn config(&self) -> &TwoStageConfig {
        &self.config
    }

    pub fn stage_1(&self) -> &Network<Box<dyn ModuleT>> {
        &self.stage_1
    }

    pub fn encoder(&self) -> &Network<LocalEncoder> {
        &self.encoder
    }

    pub fn decoder(&self) -> &Network<Box<dyn ModuleT>> {
        &self.decoder
    }

    /// Coarse image from `cat(appearance_ref, pose_tar)`. A frozen stage 1 runs
    /// in eval mode and its output is detached from the graph.
    pub fn forward_stage_1(&self, stage_1_input: &Tensor, train: bool) -> Result<Tensor> {
        if self.config.train_stage_1 {
            self.stage_1.forward_t(stage_1_input, train)
        } else {
            Ok(self.stage_1.forward_t(stage_1_input, false)?.detach())
        }
    }

    /// Runs both stages.
    ///
    /// * `img_ref`: `(b, 3, h, w)` reference image patches are cut from.
    /// * `joint_c_ref`: `(b, 18, 2)` reference joint coordinates.
    /// * `joint_tar`: `(b, 18, h, w)` target joint heatmaps.
    pub fn forward(
        &self,
        stage_1_input: &Tensor,
        img_ref: &Tensor,
        joint_c_ref: &Tensor,
        joint_tar: &Tensor,
        train: bool,
    ) -> Result<TwoStageOutput> {
        let img_s1 = self.forward_stage_1(stage_1_input, train)?;
        let patches = patch::extract_patches(
            img_ref,
            joint_c_ref,
            self.config.patch_size,
            &self.config.patch_indices,
        )?;
        let indices: Vec<u32> = self.config.patch_indices.iter().map(|&i| i as u32).collect();
        let indices = Tensor::new(indices.as_slice(), joint_tar.device())?;
        let joint_maps = joint_tar.index_select(&indices, 1)?;
        let local_feat = self.encoder.module().forward(&patches, &joint_maps, train)?;

        let residual = self
            .decoder
            .forward_t(&Tensor::cat(&[&img_s1, &local_feat], 1)?, train)?;
        let img_out = (&img_s1 + residual)?;
        Ok(TwoStageOutput {
            img_s1,
            local_feat,
            img_out,
        })
    }
}
