//! EnCodec model definition
//!
//! - `config`: hyperparameters, bandwidths and padding options
//! - `weights`: weight file reader and writer
//! - `layout`: tensor names and shapes derived from the hyperparameters
//! - `codec`: encoder, quantizer and decoder building blocks
//! - `model`: the typed, immutable model aggregate

pub mod codec;
pub mod config;
pub mod layout;
pub mod model;
pub mod weights;

pub use codec::{Codes, DECODER_TRIM};
pub use config::{Bandwidth, Hyperparameters, PadMode, RecurrentSkip, SUPPORTED_N_Q};
pub use layout::ModelLayout;
pub use model::EncodecModel;
pub use weights::{FileType, WeightStore, WeightWriter};

#[cfg(test)]
pub(crate) mod testing {
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::io::Cursor;

    use super::*;

    /// Small model: hop 8, 8-dim latent, 4 stages of 16 bins.
    pub fn tiny_hparams() -> Hyperparameters {
        Hyperparameters {
            in_channels: 1,
            hidden_dim: 8,
            n_filters: 4,
            ratios: vec![4, 2],
            kernel_size: 7,
            residual_kernel_size: 3,
            compress: 2,
            n_lstm_layers: 2,
            stride: 1,
            n_q: 4,
            n_bins: 16,
            sample_rate: 8_000,
            pad_mode: PadMode::Reflect,
            recurrent_skip: RecurrentSkip::Stack,
        }
    }

    /// Serialize random weights for `hp` and parse them back.
    pub fn random_store(hp: &Hyperparameters, seed: u64) -> WeightStore {
        let mut rng = StdRng::seed_from_u64(seed);
        let layout = ModelLayout::new(hp);
        let mut writer = WeightWriter::new(Vec::new(), hp).unwrap();
        for spec in layout.tensors() {
            let fan_in: usize = spec.shape.iter().skip(1).product::<usize>().max(1);
            let scale = if spec.shape.len() == 1 {
                0.01
            } else {
                1.0 / (fan_in as f32).sqrt()
            };
            let data: Vec<f32> = (0..spec.numel())
                .map(|_| rng.gen_range(-scale..scale))
                .collect();
            writer
                .write_tensor(&spec.name, &spec.shape, &data, FileType::F32)
                .unwrap();
        }
        let bytes = writer.finish().unwrap();
        WeightStore::read_from(Cursor::new(bytes), "memory", &Device::Cpu).unwrap()
    }
}
