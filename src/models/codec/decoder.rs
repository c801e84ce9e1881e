//! SEANet decoder
//!
//! Mirror of the encoder: latent `[1, hidden_dim, T]` to waveform
//! `[1, in_channels, T * hop - DECODER_TRIM]`. Upsampling stages run in
//! declared ratio order, halving the channel width each time.

use candle_core::Tensor;

use super::lstm::RecurrentModel;
use super::resnet_block::{ResidualBlock, ELU_ALPHA};
use super::{CausalConv1d, CausalTransConv1d};
use crate::error::{EncodecError, Result};
use crate::graph::{nodes, StageObserver};
use crate::models::config::Hyperparameters;
use crate::models::layout::{DecoderLayout, DecoderStageSpec};
use crate::models::weights::WeightStore;

/// Samples cut from the end of every decoded waveform.
///
/// Causal padding plus the `kernel - stride` trim after each transposed conv
/// already yields exactly `frames * hop` samples, so nothing is removed.
pub const DECODER_TRIM: usize = 0;

/// Transposed convolution followed by a residual block.
pub struct DecoderStage {
    ratio: usize,
    upsample: CausalTransConv1d,
    res_block: ResidualBlock,
}

impl DecoderStage {
    fn load(store: &mut WeightStore, spec: &DecoderStageSpec, hp: &Hyperparameters) -> Result<Self> {
        Ok(Self {
            ratio: spec.ratio,
            upsample: CausalTransConv1d::load(store, &spec.upsample, spec.ratio)?,
            res_block: ResidualBlock::load(store, &spec.res_block, hp.pad_mode)?,
        })
    }

    pub fn ratio(&self) -> usize {
        self.ratio
    }
}

pub struct Decoder {
    init_conv: CausalConv1d,
    lstm: RecurrentModel,
    stages: Vec<DecoderStage>,
    final_conv: CausalConv1d,
}

impl Decoder {
    pub fn load(store: &mut WeightStore, layout: &DecoderLayout, hp: &Hyperparameters) -> Result<Self> {
        let init_conv = CausalConv1d::load(store, &layout.init_conv, 1, hp.pad_mode)?;
        let lstm = RecurrentModel::load(store, &layout.lstm, hp.recurrent_skip)?;
        let stages = layout
            .stages
            .iter()
            .map(|spec| DecoderStage::load(store, spec, hp))
            .collect::<Result<Vec<_>>>()?;
        let final_conv = CausalConv1d::load(store, &layout.final_conv, 1, hp.pad_mode)?;

        Ok(Self {
            init_conv,
            lstm,
            stages,
            final_conv,
        })
    }

    pub fn stages(&self) -> &[DecoderStage] {
        &self.stages
    }

    /// Input shape: [1, hidden_dim, frames]
    /// Output shape: [1, in_channels, frames * hop - DECODER_TRIM]
    pub fn forward(&self, latent: &Tensor) -> Result<Tensor> {
        self.forward_observed(latent, &mut ())
    }

    /// Same as [`Decoder::forward`], reporting every stage output.
    pub fn forward_observed<O: StageObserver>(&self, latent: &Tensor, obs: &mut O) -> Result<Tensor> {
        let mut hidden = self.init_conv.forward(latent)?;
        obs.observe(nodes::DECODER_INIT, hidden.dims())?;

        hidden = self.lstm.forward(&hidden)?;
        obs.observe(nodes::DECODER_LSTM, hidden.dims())?;

        for (i, stage) in self.stages.iter().enumerate() {
            hidden = stage.upsample.forward(&hidden.elu(ELU_ALPHA)?)?;
            obs.observe(&nodes::decoder_upsample(i), hidden.dims())?;

            hidden = stage.res_block.forward(&hidden)?;
            obs.observe(&nodes::decoder_residual(i), hidden.dims())?;
        }

        let audio = self.final_conv.forward(&hidden.elu(ELU_ALPHA)?)?;
        let len = audio.dim(2)?;
        let audio = audio.narrow(2, 0, len.saturating_sub(DECODER_TRIM))?;
        obs.observe(nodes::DECODER_FINAL, audio.dims())?;
        Ok(audio)
    }

    /// Check every weight against the layout.
    pub fn verify(&self, layout: &DecoderLayout) -> Result<()> {
        self.init_conv.verify(&layout.init_conv)?;
        self.lstm.verify(&layout.lstm)?;
        if self.stages.len() != layout.stages.len() {
            return Err(EncodecError::graph(
                "decoder.stages",
                &[layout.stages.len()],
                &[self.stages.len()],
            ));
        }
        for (stage, spec) in self.stages.iter().zip(&layout.stages) {
            stage.upsample.verify(&spec.upsample)?;
            stage.res_block.verify(&spec.res_block)?;
        }
        self.final_conv.verify(&layout.final_conv)
    }
}
