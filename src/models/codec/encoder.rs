//! SEANet encoder
//!
//! Maps a waveform `[1, in_channels, L]` to a latent `[1, hidden_dim, L / hop]`.
//! Downsampling stages run smallest ratio first, doubling the channel width
//! each time; an LSTM stack then models the frame sequence before the final
//! projection to the latent width.

use candle_core::Tensor;

use super::lstm::RecurrentModel;
use super::resnet_block::{ResidualBlock, ELU_ALPHA};
use super::CausalConv1d;
use crate::error::{EncodecError, Result};
use crate::graph::{nodes, StageObserver};
use crate::models::config::Hyperparameters;
use crate::models::layout::{EncoderLayout, EncoderStageSpec};
use crate::models::weights::WeightStore;

/// Residual block followed by a strided convolution.
pub struct EncoderStage {
    ratio: usize,
    res_block: ResidualBlock,
    downsample: CausalConv1d,
}

impl EncoderStage {
    fn load(store: &mut WeightStore, spec: &EncoderStageSpec, hp: &Hyperparameters) -> Result<Self> {
        Ok(Self {
            ratio: spec.ratio,
            res_block: ResidualBlock::load(store, &spec.res_block, hp.pad_mode)?,
            downsample: CausalConv1d::load(store, &spec.downsample, spec.ratio, hp.pad_mode)?,
        })
    }

    pub fn ratio(&self) -> usize {
        self.ratio
    }
}

pub struct Encoder {
    init_conv: CausalConv1d,
    stages: Vec<EncoderStage>,
    lstm: RecurrentModel,
    final_conv: CausalConv1d,
}

impl Encoder {
    pub fn load(store: &mut WeightStore, layout: &EncoderLayout, hp: &Hyperparameters) -> Result<Self> {
        let init_conv = CausalConv1d::load(store, &layout.init_conv, hp.stride, hp.pad_mode)?;
        let stages = layout
            .stages
            .iter()
            .map(|spec| EncoderStage::load(store, spec, hp))
            .collect::<Result<Vec<_>>>()?;
        let lstm = RecurrentModel::load(store, &layout.lstm, hp.recurrent_skip)?;
        let final_conv = CausalConv1d::load(store, &layout.final_conv, 1, hp.pad_mode)?;

        Ok(Self {
            init_conv,
            stages,
            lstm,
            final_conv,
        })
    }

    pub fn stages(&self) -> &[EncoderStage] {
        &self.stages
    }

    /// Input shape: [1, in_channels, samples]
    /// Output shape: [1, hidden_dim, frames]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_observed(x, &mut ())
    }

    /// Same as [`Encoder::forward`], reporting every stage output.
    pub fn forward_observed<O: StageObserver>(&self, x: &Tensor, obs: &mut O) -> Result<Tensor> {
        let mut hidden = self.init_conv.forward(x)?;
        obs.observe(nodes::ENCODER_INIT, hidden.dims())?;

        for (i, stage) in self.stages.iter().enumerate() {
            hidden = stage.res_block.forward(&hidden)?;
            obs.observe(&nodes::encoder_residual(i), hidden.dims())?;

            hidden = stage.downsample.forward(&hidden.elu(ELU_ALPHA)?)?;
            obs.observe(&nodes::encoder_downsample(i), hidden.dims())?;
        }

        hidden = self.lstm.forward(&hidden)?;
        obs.observe(nodes::ENCODER_LSTM, hidden.dims())?;

        let latent = self.final_conv.forward(&hidden.elu(ELU_ALPHA)?)?;
        obs.observe(nodes::ENCODER_FINAL, latent.dims())?;
        Ok(latent)
    }

    /// Check every weight against the layout.
    pub fn verify(&self, layout: &EncoderLayout) -> Result<()> {
        self.init_conv.verify(&layout.init_conv)?;
        if self.stages.len() != layout.stages.len() {
            return Err(EncodecError::graph(
                "encoder.stages",
                &[layout.stages.len()],
                &[self.stages.len()],
            ));
        }
        for (stage, spec) in self.stages.iter().zip(&layout.stages) {
            stage.res_block.verify(&spec.res_block)?;
            stage.downsample.verify(&spec.downsample)?;
        }
        self.lstm.verify(&layout.lstm)?;
        self.final_conv.verify(&layout.final_conv)
    }
}
