//! Tensor names and shapes derived from hyperparameters
//!
//! The checkpoint keeps PyTorch's `nn.Sequential` numbering. For `n` ratios:
//!
//! | Index            | Encoder                 | Decoder                    |
//! |------------------|-------------------------|----------------------------|
//! | `0`              | init conv               | init conv                  |
//! | `1`              | stage 0 residual block  | LSTM                       |
//! | `3i + 2`         | ELU                     | ELU                        |
//! | `3i + 3`         | stage i strided conv    | stage i transposed conv    |
//! | `3i + 4`         | stage i+1 residual block| stage i residual block     |
//! | `3n + 1`         | LSTM                    | none                       |
//! | `3n + 2`         | ELU                     | ELU                        |
//! | `3n + 3`         | final conv              | final conv                 |
//!
//! Every loader and the graph-time shape check read from the same
//! [`ModelLayout`], so names and shapes are defined once.

use candle_core::Tensor;

use super::config::Hyperparameters;
use crate::error::{EncodecError, Result};

/// Name and expected shape of one weight tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl TensorSpec {
    fn new(name: String, shape: Vec<usize>) -> Self {
        Self { name, shape }
    }

    /// Compare a loaded tensor against this spec.
    pub fn verify(&self, tensor: &Tensor) -> Result<()> {
        if tensor.dims() == self.shape.as_slice() {
            Ok(())
        } else {
            Err(EncodecError::graph(&self.name, &self.shape, tensor.dims()))
        }
    }

    /// Number of scalar values.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Weight and bias of a convolution.
#[derive(Debug, Clone)]
pub struct ConvSpec {
    pub weight: TensorSpec,
    pub bias: TensorSpec,
}

impl ConvSpec {
    /// Regular conv, weight `[out, in, kernel]`.
    fn conv(prefix: &str, in_c: usize, out_c: usize, kernel: usize) -> Self {
        Self {
            weight: TensorSpec::new(
                format!("{prefix}.conv.conv.weight"),
                vec![out_c, in_c, kernel],
            ),
            bias: TensorSpec::new(format!("{prefix}.conv.conv.bias"), vec![out_c]),
        }
    }

    /// Transposed conv, weight `[in, out, kernel]`.
    fn transposed(prefix: &str, in_c: usize, out_c: usize, kernel: usize) -> Self {
        Self {
            weight: TensorSpec::new(
                format!("{prefix}.convtr.convtr.weight"),
                vec![in_c, out_c, kernel],
            ),
            bias: TensorSpec::new(format!("{prefix}.convtr.convtr.bias"), vec![out_c]),
        }
    }

    /// Kernel length.
    pub fn kernel_size(&self) -> usize {
        self.weight.shape[2]
    }

    fn tensors(&self) -> [&TensorSpec; 2] {
        [&self.weight, &self.bias]
    }
}

/// Residual block: two convs on the main path and a shortcut conv.
#[derive(Debug, Clone)]
pub struct ResBlockSpec {
    pub conv1: ConvSpec,
    pub conv2: ConvSpec,
    pub shortcut: ConvSpec,
}

impl ResBlockSpec {
    fn new(prefix: &str, dim: usize, hp: &Hyperparameters) -> Self {
        let hidden = dim / hp.compress;
        Self {
            conv1: ConvSpec::conv(
                &format!("{prefix}.block.1"),
                dim,
                hidden,
                hp.residual_kernel_size,
            ),
            conv2: ConvSpec::conv(&format!("{prefix}.block.3"), hidden, dim, 1),
            shortcut: ConvSpec::conv(&format!("{prefix}.shortcut"), dim, dim, 1),
        }
    }

    fn tensors(&self) -> impl Iterator<Item = &TensorSpec> {
        self.conv1
            .tensors()
            .into_iter()
            .chain(self.conv2.tensors())
            .chain(self.shortcut.tensors())
    }
}

/// Weights of one LSTM layer (PyTorch gate order i, f, g, o).
#[derive(Debug, Clone)]
pub struct LstmLayerSpec {
    pub weight_ih: TensorSpec,
    pub weight_hh: TensorSpec,
    pub bias_ih: TensorSpec,
    pub bias_hh: TensorSpec,
}

impl LstmLayerSpec {
    fn new(prefix: &str, layer: usize, dim: usize) -> Self {
        let t = |kind: &str, shape: Vec<usize>| {
            TensorSpec::new(format!("{prefix}.lstm.{kind}_l{layer}"), shape)
        };
        Self {
            weight_ih: t("weight_ih", vec![4 * dim, dim]),
            weight_hh: t("weight_hh", vec![4 * dim, dim]),
            bias_ih: t("bias_ih", vec![4 * dim]),
            bias_hh: t("bias_hh", vec![4 * dim]),
        }
    }

    fn tensors(&self) -> [&TensorSpec; 4] {
        [&self.weight_ih, &self.weight_hh, &self.bias_ih, &self.bias_hh]
    }
}

fn lstm_layers(prefix: &str, dim: usize, hp: &Hyperparameters) -> Vec<LstmLayerSpec> {
    (0..hp.n_lstm_layers)
        .map(|layer| LstmLayerSpec::new(prefix, layer, dim))
        .collect()
}

/// One encoder stage: residual block then strided conv.
#[derive(Debug, Clone)]
pub struct EncoderStageSpec {
    pub ratio: usize,
    pub res_block: ResBlockSpec,
    pub downsample: ConvSpec,
}

#[derive(Debug, Clone)]
pub struct EncoderLayout {
    pub init_conv: ConvSpec,
    pub stages: Vec<EncoderStageSpec>,
    pub lstm: Vec<LstmLayerSpec>,
    pub final_conv: ConvSpec,
}

impl EncoderLayout {
    pub fn new(hp: &Hyperparameters) -> Self {
        let layer = |i: usize| format!("encoder.model.{i}");
        let n = hp.ratios.len();

        let init_conv = ConvSpec::conv(&layer(0), hp.in_channels, hp.n_filters, hp.kernel_size);
        let stages = hp
            .encoder_ratios()
            .enumerate()
            .map(|(i, ratio)| {
                let dim = hp.encoder_stage_width(i);
                EncoderStageSpec {
                    ratio,
                    res_block: ResBlockSpec::new(&layer(3 * i + 1), dim, hp),
                    downsample: ConvSpec::conv(&layer(3 * i + 3), dim, 2 * dim, 2 * ratio),
                }
            })
            .collect();
        let lstm = lstm_layers(&layer(3 * n + 1), hp.lstm_dim(), hp);
        let final_conv = ConvSpec::conv(
            &layer(3 * n + 3),
            hp.lstm_dim(),
            hp.hidden_dim,
            hp.kernel_size,
        );

        Self {
            init_conv,
            stages,
            lstm,
            final_conv,
        }
    }

    fn tensors(&self) -> Vec<&TensorSpec> {
        let mut out: Vec<&TensorSpec> = self.init_conv.tensors().to_vec();
        for stage in &self.stages {
            out.extend(stage.res_block.tensors());
            out.extend(stage.downsample.tensors());
        }
        out.extend(self.lstm.iter().flat_map(|l| l.tensors()));
        out.extend(self.final_conv.tensors());
        out
    }
}

/// One decoder stage: transposed conv then residual block.
#[derive(Debug, Clone)]
pub struct DecoderStageSpec {
    pub ratio: usize,
    pub upsample: ConvSpec,
    pub res_block: ResBlockSpec,
}

#[derive(Debug, Clone)]
pub struct DecoderLayout {
    pub init_conv: ConvSpec,
    pub lstm: Vec<LstmLayerSpec>,
    pub stages: Vec<DecoderStageSpec>,
    pub final_conv: ConvSpec,
}

impl DecoderLayout {
    pub fn new(hp: &Hyperparameters) -> Self {
        let layer = |i: usize| format!("decoder.model.{i}");
        let n = hp.ratios.len();

        let init_conv = ConvSpec::conv(&layer(0), hp.hidden_dim, hp.lstm_dim(), hp.kernel_size);
        let lstm = lstm_layers(&layer(1), hp.lstm_dim(), hp);
        let stages = hp
            .decoder_ratios()
            .enumerate()
            .map(|(i, ratio)| {
                let dim = hp.decoder_stage_width(i);
                DecoderStageSpec {
                    ratio,
                    upsample: ConvSpec::transposed(&layer(3 * i + 3), dim, dim / 2, 2 * ratio),
                    res_block: ResBlockSpec::new(&layer(3 * i + 4), dim / 2, hp),
                }
            })
            .collect();
        let final_conv = ConvSpec::conv(
            &layer(3 * n + 3),
            hp.n_filters,
            hp.in_channels,
            hp.kernel_size,
        );

        Self {
            init_conv,
            lstm,
            stages,
            final_conv,
        }
    }

    fn tensors(&self) -> Vec<&TensorSpec> {
        let mut out: Vec<&TensorSpec> = self.init_conv.tensors().to_vec();
        out.extend(self.lstm.iter().flat_map(|l| l.tensors()));
        for stage in &self.stages {
            out.extend(stage.upsample.tensors());
            out.extend(stage.res_block.tensors());
        }
        out.extend(self.final_conv.tensors());
        out
    }
}

/// Codebook tables, one per stage, each `[n_bins, hidden_dim]`.
pub fn codebook_specs(hp: &Hyperparameters) -> Vec<TensorSpec> {
    (0..hp.n_q)
        .map(|q| {
            TensorSpec::new(
                format!("quantizer.vq.layers.{q}._codebook.embed"),
                vec![hp.n_bins, hp.hidden_dim],
            )
        })
        .collect()
}

/// Full tensor layout of a checkpoint.
#[derive(Debug, Clone)]
pub struct ModelLayout {
    pub encoder: EncoderLayout,
    pub codebooks: Vec<TensorSpec>,
    pub decoder: DecoderLayout,
}

impl ModelLayout {
    pub fn new(hp: &Hyperparameters) -> Self {
        Self {
            encoder: EncoderLayout::new(hp),
            codebooks: codebook_specs(hp),
            decoder: DecoderLayout::new(hp),
        }
    }

    /// Every tensor the model reads, in load order.
    pub fn tensors(&self) -> Vec<&TensorSpec> {
        let mut out = self.encoder.tensors();
        out.extend(self.codebooks.iter());
        out.extend(self.decoder.tensors());
        out
    }

    /// Total parameter count.
    pub fn n_params(&self) -> usize {
        self.tensors().iter().map(|t| t.numel()).sum()
    }
}
