//! The loaded EnCodec model
//!
//! [`EncodecModel`] owns every weight as a typed field. It is built once
//! from a [`WeightStore`] and never mutated afterwards, so one instance can
//! be shared behind an `Arc` by any number of execution contexts.

use candle_core::Device;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

use super::codec::{Decoder, Encoder, ResidualVectorQuantizer};
use super::config::Hyperparameters;
use super::layout::ModelLayout;
use super::weights::WeightStore;
use crate::error::Result;

pub struct EncodecModel {
    hparams: Hyperparameters,
    layout: ModelLayout,
    encoder: Encoder,
    quantizer: ResidualVectorQuantizer,
    decoder: Decoder,
    device: Device,
}

impl EncodecModel {
    /// Read a weight file and build the model on `device`.
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let start = Instant::now();
        let store = WeightStore::open(path, device)?;
        let model = Self::from_store(store, device)?;
        info!(
            "Loaded EnCodec model: {} tensors, {:.1}M params, {} Hz in {:.2?}",
            model.layout.tensors().len(),
            model.layout.n_params() as f64 / 1e6,
            model.hparams.sample_rate,
            start.elapsed()
        );
        Ok(model)
    }

    /// Build from an already parsed store.
    ///
    /// Every tensor the layout names must be present with the right shape;
    /// anything else in the store is ignored with a warning.
    pub fn from_store(mut store: WeightStore, device: &Device) -> Result<Self> {
        let hparams = store.hparams().clone();
        let layout = ModelLayout::new(&hparams);

        let encoder = Encoder::load(&mut store, &layout.encoder, &hparams)?;
        let quantizer = ResidualVectorQuantizer::load(&mut store, &layout.codebooks, &hparams)?;
        let decoder = Decoder::load(&mut store, &layout.decoder, &hparams)?;

        let leftover = store.leftover_names();
        if !leftover.is_empty() {
            warn!(
                "{}: ignoring {} unused tensors (first: {})",
                store.source(),
                leftover.len(),
                leftover[0]
            );
        }

        let model = Self {
            hparams,
            layout,
            encoder,
            quantizer,
            decoder,
            device: device.clone(),
        };
        model.verify()?;
        Ok(model)
    }

    /// Compare every weight with the shapes derived from the hyperparameters.
    pub fn verify(&self) -> Result<()> {
        self.encoder.verify(&self.layout.encoder)?;
        self.quantizer.verify(&self.layout.codebooks)?;
        self.decoder.verify(&self.layout.decoder)
    }

    pub fn hparams(&self) -> &Hyperparameters {
        &self.hparams
    }

    pub fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn quantizer(&self) -> &ResidualVectorQuantizer {
        &self.quantizer
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
