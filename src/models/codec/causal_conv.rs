//! Causal 1D Convolution
//!
//! A Conv1d padded on the left so each output frame ends at its input frame.
//! With constant padding no output reads a later sample. Reflect padding
//! mirrors `x[1..=left]` into the pad, so the first `left` outputs also see
//! up to `left` samples ahead; past that boundary the conv is causal.
//! The left padding is `(kernel_size - 1) * dilation - (stride - 1)`; on the
//! right, only enough padding is added to complete the last stride window,
//! which is zero whenever the input length is a multiple of the stride.

use candle_core::{Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig};

use crate::error::Result;
use crate::models::config::PadMode;
use crate::models::layout::ConvSpec;
use crate::models::weights::WeightStore;

/// Causal (optionally strided) 1D convolution.
pub struct CausalConv1d {
    conv: Conv1d,
    kernel_size: usize,
    stride: usize,
    dilation: usize,
    pad_mode: PadMode,
}

impl CausalConv1d {
    /// Take the weight and bias named by `spec` out of the store.
    pub fn load(
        store: &mut WeightStore,
        spec: &ConvSpec,
        stride: usize,
        pad_mode: PadMode,
    ) -> Result<Self> {
        let weight = store.take(&spec.weight.name, &spec.weight.shape)?;
        let bias = store.take(&spec.bias.name, &spec.bias.shape)?;
        Self::from_weights(weight, Some(bias), stride, 1, pad_mode)
    }

    /// Create from raw weight and bias tensors.
    ///
    /// Weight should have shape [out_channels, in_channels, kernel_size].
    pub fn from_weights(
        weight: Tensor,
        bias: Option<Tensor>,
        stride: usize,
        dilation: usize,
        pad_mode: PadMode,
    ) -> Result<Self> {
        let kernel_size = weight.dim(2)?;

        // No built-in padding; causal padding is applied in forward
        let config = Conv1dConfig {
            padding: 0,
            stride,
            dilation,
            groups: 1,
            ..Default::default()
        };

        Ok(Self {
            conv: Conv1d::new(weight, bias, config),
            kernel_size,
            stride,
            dilation,
            pad_mode,
        })
    }

    /// Left and right padding for an input of `length` samples.
    pub fn padding(&self, length: usize) -> (usize, usize) {
        let effective_kernel = (self.kernel_size - 1) * self.dilation + 1;
        let left = effective_kernel.saturating_sub(self.stride);
        let right = length.div_ceil(self.stride) * self.stride - length;
        (left, right)
    }

    /// Output length for an input of `length` samples.
    pub fn output_len(&self, length: usize) -> usize {
        length.div_ceil(self.stride)
    }

    /// Forward pass with causal padding.
    ///
    /// Input shape: [batch, in_channels, seq_len]
    /// Output shape: [batch, out_channels, ceil(seq_len / stride)]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (left, right) = self.padding(x.dim(2)?);
        let x = pad1d(x, left, right, self.pad_mode)?;
        Ok(self.conv.forward(&x)?)
    }

    pub fn stride(&self) -> usize {
        self.stride
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

/// Pad the time axis (dim 2) of a `[batch, channels, time]` tensor.
///
/// Reflect padding mirrors around the edge samples without repeating them.
/// Inputs shorter than the padding are zero-extended first so the mirror
/// has enough samples, and the extension is cut off afterwards.
pub(crate) fn pad1d(x: &Tensor, left: usize, right: usize, mode: PadMode) -> Result<Tensor> {
    if left == 0 && right == 0 {
        return Ok(x.clone());
    }
    match mode {
        PadMode::Constant => Ok(x.pad_with_zeros(2, left, right)?),
        PadMode::Reflect => {
            let length = x.dim(2)?;
            let max_pad = left.max(right);
            let extra = if length <= max_pad {
                max_pad - length + 1
            } else {
                0
            };
            let x = if extra > 0 {
                x.pad_with_zeros(2, 0, extra)?
            } else {
                x.clone()
            };
            let length = length + extra;
            let device = x.device();

            let mut parts = Vec::with_capacity(3);
            if left > 0 {
                let idx: Vec<u32> = (1..=left).rev().map(|i| i as u32).collect();
                parts.push(x.index_select(&Tensor::new(idx.as_slice(), device)?, 2)?);
            }
            parts.push(x.clone());
            if right > 0 {
                let idx: Vec<u32> = (0..right).map(|i| (length - 2 - i) as u32).collect();
                parts.push(x.index_select(&Tensor::new(idx.as_slice(), device)?, 2)?);
            }
            let padded = Tensor::cat(&parts, 2)?;
            let total = padded.dim(2)?;
            Ok(padded.narrow(2, 0, total - extra)?)
        }
    }
}
