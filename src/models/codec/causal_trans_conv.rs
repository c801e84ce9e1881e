//! Causal Transposed 1D Convolution
//!
//! A ConvTranspose1d that maintains causality by trimming output.
//! Used for upsampling in the decoder. All `kernel_size - stride` extra
//! samples are removed from the right, so the output is exactly
//! `input * stride` long.

use candle_core::{Module, Tensor};
use candle_nn::{ConvTranspose1d, ConvTranspose1dConfig};

use crate::error::Result;
use crate::models::layout::ConvSpec;
use crate::models::weights::WeightStore;

/// Causal Transposed 1D Convolution
pub struct CausalTransConv1d {
    conv: ConvTranspose1d,
    /// Number of samples to trim from the right of output
    right_trim: usize,
}

impl CausalTransConv1d {
    /// Take the weight and bias named by `spec` out of the store.
    pub fn load(store: &mut WeightStore, spec: &ConvSpec, stride: usize) -> Result<Self> {
        let weight = store.take(&spec.weight.name, &spec.weight.shape)?;
        let bias = store.take(&spec.bias.name, &spec.bias.shape)?;
        Self::from_weights(weight, Some(bias), stride)
    }

    /// Create from raw weight and bias tensors.
    ///
    /// Weight should have shape [in_channels, out_channels, kernel_size].
    pub fn from_weights(weight: Tensor, bias: Option<Tensor>, stride: usize) -> Result<Self> {
        let kernel_size = weight.dim(2)?;

        let config = ConvTranspose1dConfig {
            padding: 0,
            output_padding: 0,
            stride,
            dilation: 1,
            groups: 1,
        };

        let conv = ConvTranspose1d::new(weight, bias, config);
        let right_trim = kernel_size.saturating_sub(stride);

        Ok(Self { conv, right_trim })
    }

    /// Forward pass with causal output trimming.
    ///
    /// Input shape: [batch, in_channels, seq_len]
    /// Output shape: [batch, out_channels, seq_len * stride]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = self.conv.forward(x)?;

        let out_len = out.dim(2)?;
        if self.right_trim > 0 {
            let end = out_len.saturating_sub(self.right_trim);
            Ok(out.narrow(2, 0, end)?)
        } else {
            Ok(out)
        }
    }

    /// Get the stride (upsampling factor)
    pub fn stride(&self) -> usize {
        self.conv.config().stride
    }

    /// Check the weights against the layout derived from hyperparameters.
    pub fn verify(&self, spec: &ConvSpec) -> Result<()> {
        spec.weight.verify(self.conv.weight())?;
        if let Some(bias) = self.conv.bias() {
            spec.bias.verify(bias)?;
        }
        Ok(())
    }
}
