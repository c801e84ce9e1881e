//! SEANet residual block shared by encoder and decoder stages.

use candle_core::Tensor;

use super::CausalConv1d;
use crate::error::Result;
use crate::models::config::PadMode;
use crate::models::layout::ResBlockSpec;
use crate::models::weights::WeightStore;

/// ELU slope for negative inputs.
pub const ELU_ALPHA: f64 = 1.0;

/// Residual block
///
/// Architecture:
/// 1. ELU
/// 2. Causal conv (`residual_kernel_size`, dim → dim / compress)
/// 3. ELU
/// 4. 1x1 causal conv (dim / compress → dim)
/// 5. Sum with a 1x1 shortcut conv over the block input
pub struct ResidualBlock {
    conv1: CausalConv1d,
    conv2: CausalConv1d,
    shortcut: CausalConv1d,
}

impl ResidualBlock {
    pub fn load(store: &mut WeightStore, spec: &ResBlockSpec, pad_mode: PadMode) -> Result<Self> {
        Ok(Self {
            conv1: CausalConv1d::load(store, &spec.conv1, 1, pad_mode)?,
            conv2: CausalConv1d::load(store, &spec.conv2, 1, pad_mode)?,
            shortcut: CausalConv1d::load(store, &spec.shortcut, 1, pad_mode)?,
        })
    }

    pub fn from_convs(conv1: CausalConv1d, conv2: CausalConv1d, shortcut: CausalConv1d) -> Self {
        Self {
            conv1,
            conv2,
            shortcut,
        }
    }

    /// Input/Output shape: [batch, dim, seq_len]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = x.elu(ELU_ALPHA)?;
        let hidden = self.conv1.forward(&hidden)?;
        let hidden = hidden.elu(ELU_ALPHA)?;
        let hidden = self.conv2.forward(&hidden)?;

        let skip = self.shortcut.forward(x)?;
        Ok((skip + hidden)?)
    }

    pub fn verify(&self, spec: &ResBlockSpec) -> Result<()> {
        self.conv1.verify(&spec.conv1)?;
        self.conv2.verify(&spec.conv2)?;
        self.shortcut.verify(&spec.shortcut)
    }
}
