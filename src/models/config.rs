//! Model hyperparameters for the EnCodec codec
//!
//! Everything the encoder, quantizer and decoder need to derive their tensor
//! shapes lives in [`Hyperparameters`]. The values are read from the weight
//! file header; [`Hyperparameters::default`] describes the 24 kHz checkpoint.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EncodecError, Result};

/// Quantizer stage counts that correspond to a published bit-rate.
pub const SUPPORTED_N_Q: [usize; 5] = [2, 4, 8, 16, 32];

/// Largest accepted number of samples per latent frame.
pub const MAX_COMPRESSION_FACTOR: usize = 1 << 16;

/// Padding applied on the left of every causal convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PadMode {
    /// Zero padding
    Constant,
    /// Mirror the signal around its first sample
    #[default]
    Reflect,
}

impl PadMode {
    /// Decode the header field (0 = constant, 1 = reflect).
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(PadMode::Constant),
            1 => Some(PadMode::Reflect),
            _ => None,
        }
    }

    /// Header field value.
    pub fn code(self) -> i32 {
        match self {
            PadMode::Constant => 0,
            PadMode::Reflect => 1,
        }
    }
}

/// Where the skip connection of the recurrent model is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecurrentSkip {
    /// `y = lstm_stack(x) + x`, as in the published EnCodec checkpoints
    #[default]
    Stack,
    /// `x = layer(x) + x` after every layer
    PerLayer,
}

impl RecurrentSkip {
    /// Decode the header field (0 = stack, 1 = per layer).
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(RecurrentSkip::Stack),
            1 => Some(RecurrentSkip::PerLayer),
            _ => None,
        }
    }

    /// Header field value.
    pub fn code(self) -> i32 {
        match self {
            RecurrentSkip::Stack => 0,
            RecurrentSkip::PerLayer => 1,
        }
    }
}

/// Target bit-rates of the 24 kHz model.
///
/// Each bandwidth selects a prefix of the quantizer stages: 75 frames per
/// second at 10 bits per stage gives 750 bps per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bandwidth {
    /// 1.5 kbps, 2 stages
    Kbps1_5,
    /// 3 kbps, 4 stages
    Kbps3,
    /// 6 kbps, 8 stages
    Kbps6,
    /// 12 kbps, 16 stages
    Kbps12,
    /// 24 kbps, 32 stages
    Kbps24,
}

impl Bandwidth {
    pub const ALL: [Bandwidth; 5] = [
        Bandwidth::Kbps1_5,
        Bandwidth::Kbps3,
        Bandwidth::Kbps6,
        Bandwidth::Kbps12,
        Bandwidth::Kbps24,
    ];

    /// Number of quantizer stages used at this bandwidth.
    pub fn n_q(self) -> usize {
        match self {
            Bandwidth::Kbps1_5 => 2,
            Bandwidth::Kbps3 => 4,
            Bandwidth::Kbps6 => 8,
            Bandwidth::Kbps12 => 16,
            Bandwidth::Kbps24 => 32,
        }
    }

    /// Nominal bit-rate in kbps.
    pub fn kbps(self) -> f32 {
        match self {
            Bandwidth::Kbps1_5 => 1.5,
            Bandwidth::Kbps3 => 3.0,
            Bandwidth::Kbps6 => 6.0,
            Bandwidth::Kbps12 => 12.0,
            Bandwidth::Kbps24 => 24.0,
        }
    }

    /// Look up a bandwidth by its kbps value.
    pub fn from_kbps(kbps: f32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|bw| (bw.kbps() - kbps).abs() < 1e-3)
    }

    /// Look up a bandwidth by its stage count.
    pub fn from_n_q(n_q: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|bw| bw.n_q() == n_q)
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} kbps", self.kbps())
    }
}

/// Hyperparameters of an encoder / quantizer / decoder checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hyperparameters {
    /// Audio channels (1 for the mono model)
    pub in_channels: usize,
    /// Latent dimension, also the codebook vector length
    pub hidden_dim: usize,
    /// Width of the first convolution
    pub n_filters: usize,
    /// Resampling ratios in declared (decoder) order
    pub ratios: Vec<usize>,
    /// Kernel of the first and last convolutions
    pub kernel_size: usize,
    /// Kernel of the first convolution inside residual blocks
    pub residual_kernel_size: usize,
    /// Channel reduction inside residual blocks
    pub compress: usize,
    /// Number of stacked LSTM layers
    pub n_lstm_layers: usize,
    /// Stride of the stem convolution
    pub stride: usize,
    /// Number of quantizer stages stored in the checkpoint
    pub n_q: usize,
    /// Codebook size per stage
    pub n_bins: usize,
    /// Sample rate the model was trained at
    pub sample_rate: u32,
    #[serde(default)]
    pub pad_mode: PadMode,
    #[serde(default)]
    pub recurrent_skip: RecurrentSkip,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            in_channels: 1,
            hidden_dim: 128,
            n_filters: 32,
            ratios: vec![8, 5, 4, 2],
            kernel_size: 7,
            residual_kernel_size: 3,
            compress: 2,
            n_lstm_layers: 2,
            stride: 1,
            n_q: 32,
            n_bins: 1024,
            sample_rate: 24_000,
            pad_mode: PadMode::Reflect,
            recurrent_skip: RecurrentSkip::Stack,
        }
    }
}

impl Hyperparameters {
    /// Product of the resampling ratios. Saturates; [`Hyperparameters::validate`]
    /// rejects anything above [`MAX_COMPRESSION_FACTOR`].
    pub fn hop_length(&self) -> usize {
        self.ratios.iter().fold(1, |acc, &r| acc.saturating_mul(r))
    }

    /// Number of audio samples per latent frame.
    pub fn compression_factor(&self) -> usize {
        self.hop_length().saturating_mul(self.stride)
    }

    /// Latent frames per second, rounded up.
    pub fn frame_rate(&self) -> usize {
        let hop = self.compression_factor();
        (self.sample_rate as usize).div_ceil(hop)
    }

    /// Bits carried by one code index.
    pub fn bits_per_code(&self) -> u32 {
        self.n_bins.trailing_zeros()
    }

    /// Bit-rate in bits per second for `n_q` stages.
    pub fn bitrate(&self, n_q: usize) -> usize {
        self.frame_rate() * self.bits_per_code() as usize * n_q
    }

    /// Ratios in the order the encoder applies them.
    pub fn encoder_ratios(&self) -> impl Iterator<Item = usize> + '_ {
        self.ratios.iter().rev().copied()
    }

    /// Ratios in the order the decoder applies them.
    pub fn decoder_ratios(&self) -> impl Iterator<Item = usize> + '_ {
        self.ratios.iter().copied()
    }

    /// Channel width of the recurrent model, after all downsampling stages.
    pub fn lstm_dim(&self) -> usize {
        self.n_filters << self.ratios.len()
    }

    /// Input width of encoder stage `i` (encoder order).
    pub fn encoder_stage_width(&self, i: usize) -> usize {
        self.n_filters << i
    }

    /// Input width of decoder stage `i` (decoder order).
    pub fn decoder_stage_width(&self, i: usize) -> usize {
        self.lstm_dim() >> i
    }

    /// Stage counts usable with this checkpoint.
    pub fn supported_n_q(&self) -> Vec<usize> {
        SUPPORTED_N_Q
            .into_iter()
            .filter(|&n| n <= self.n_q)
            .collect()
    }

    /// Reject stage counts the checkpoint cannot serve.
    pub fn check_stage_count(&self, n_q: usize) -> Result<()> {
        if SUPPORTED_N_Q.contains(&n_q) && n_q <= self.n_q {
            Ok(())
        } else {
            Err(EncodecError::UnsupportedStageCount {
                requested: n_q,
                supported: self.supported_n_q(),
            })
        }
    }

    /// Number of latent frames for `n_samples` of audio.
    ///
    /// Fails when the length is zero or not a multiple of the compression
    /// factor.
    pub fn frames_for(&self, n_samples: usize) -> Result<usize> {
        let hop = self.compression_factor();
        if n_samples == 0 {
            return Err(EncodecError::InputShape("audio is empty".to_string()));
        }
        if n_samples % hop != 0 {
            return Err(EncodecError::InputShape(format!(
                "audio length {n_samples} is not a multiple of the compression factor {hop} \
                 (nearest valid lengths: {} or {})",
                n_samples / hop * hop,
                n_samples.div_ceil(hop) * hop
            )));
        }
        Ok(n_samples / hop)
    }

    /// Check internal consistency. Returns a human-readable reason on failure.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let positive = [
            ("in_channels", self.in_channels),
            ("hidden_dim", self.hidden_dim),
            ("n_filters", self.n_filters),
            ("kernel_size", self.kernel_size),
            ("residual_kernel_size", self.residual_kernel_size),
            ("compress", self.compress),
            ("n_lstm_layers", self.n_lstm_layers),
            ("stride", self.stride),
            ("n_bins", self.n_bins),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(format!("{name} must be positive"));
        }
        if self.sample_rate == 0 {
            return Err("sample_rate must be positive".to_string());
        }
        if self.ratios.is_empty() || self.ratios.contains(&0) {
            return Err(format!("invalid ratios {:?}", self.ratios));
        }
        let factor = self
            .ratios
            .iter()
            .try_fold(self.stride, |acc, &r| acc.checked_mul(r));
        if !factor.is_some_and(|f| f <= MAX_COMPRESSION_FACTOR) {
            return Err(format!(
                "ratios {:?} give a compression factor above {MAX_COMPRESSION_FACTOR}",
                self.ratios
            ));
        }
        if self.in_channels != 1 {
            return Err(format!(
                "{} input channels requested, only mono models are supported",
                self.in_channels
            ));
        }
        // Only stride-1 stems have a decoder counterpart.
        if self.stride != 1 {
            return Err(format!("stride {} is not supported", self.stride));
        }
        if self.n_filters % self.compress != 0 {
            return Err(format!(
                "n_filters {} is not divisible by compress {}",
                self.n_filters, self.compress
            ));
        }
        if !self.n_bins.is_power_of_two() {
            return Err(format!("n_bins {} is not a power of two", self.n_bins));
        }
        if !SUPPORTED_N_Q.contains(&self.n_q) {
            return Err(format!(
                "n_q {} is not one of {:?}",
                self.n_q, SUPPORTED_N_Q
            ));
        }
        Ok(())
    }
}
