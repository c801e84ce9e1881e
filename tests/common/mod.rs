//! Shared fixtures: small random models written to temporary weight files.

#![allow(dead_code)]

use encodec::models::layout::{ModelLayout, TensorSpec};
use encodec::models::{FileType, Hyperparameters, WeightWriter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;
use std::path::{Path, PathBuf};

/// Hop 8, 16-dim latent, 8 stages of 32 bins.
pub fn small_hparams() -> Hyperparameters {
    Hyperparameters {
        hidden_dim: 16,
        n_filters: 4,
        ratios: vec![4, 2],
        n_q: 8,
        n_bins: 32,
        sample_rate: 8_000,
        ..Default::default()
    }
}

/// Full 24 kHz topology (hidden 128, ratios 8/5/4/2) with narrow convolutions.
pub fn scenario_hparams() -> Hyperparameters {
    Hyperparameters {
        hidden_dim: 128,
        n_filters: 4,
        ratios: vec![8, 5, 4, 2],
        n_q: 8,
        n_bins: 64,
        sample_rate: 24_000,
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub seed: u64,
    pub ftype: FileType,
    /// Make row 0 of every codebook all zeros
    pub zero_rows: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            seed: 42,
            ftype: FileType::F32,
            zero_rows: false,
        }
    }
}

/// Random values for one tensor, scaled by fan-in.
pub fn random_values(spec: &TensorSpec, rng: &mut StdRng, zero_rows: bool) -> Vec<f32> {
    let fan_in: usize = spec.shape.iter().skip(1).product::<usize>().max(1);
    let scale = if spec.shape.len() == 1 {
        0.01
    } else {
        1.0 / (fan_in as f32).sqrt()
    };
    let mut data: Vec<f32> = (0..spec.numel())
        .map(|_| rng.gen_range(-scale..scale))
        .collect();
    if zero_rows && spec.name.ends_with("_codebook.embed") {
        let dim = spec.shape[1];
        data[..dim].fill(0.0);
    }
    data
}

/// Write every tensor of `hp`'s layout, plus `extra` records, to `path`.
pub fn write_model_with(
    path: &Path,
    hp: &Hyperparameters,
    opts: &ModelOptions,
    skip: &[&str],
    extra: &[(&str, Vec<usize>)],
) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let layout = ModelLayout::new(hp);
    let mut writer = WeightWriter::create(path, hp)?;
    for spec in layout.tensors() {
        let data = random_values(spec, &mut rng, opts.zero_rows);
        if skip.contains(&spec.name.as_str()) {
            continue;
        }
        writer.write_tensor(&spec.name, &spec.shape, &data, opts.ftype)?;
    }
    for (name, shape) in extra {
        let n: usize = shape.iter().product();
        writer.write_tensor(name, shape, &vec![0.5; n], opts.ftype)?;
    }
    writer.finish()?;
    Ok(())
}

/// Write a complete random model named `name` inside `dir`.
pub fn write_model(dir: &Path, name: &str, hp: &Hyperparameters, opts: &ModelOptions) -> PathBuf {
    let path = dir.join(name);
    write_model_with(&path, hp, opts, &[], &[]).expect("write model");
    path
}

/// Sum of two sines at `sample_rate`, peak below 0.6.
pub fn test_signal(n_samples: usize, sample_rate: u32) -> Vec<f32> {
    let sr = sample_rate as f32;
    (0..n_samples)
        .map(|i| {
            let t = i as f32 / sr;
            0.4 * (2.0 * PI * 220.0 * t).sin() + 0.15 * (2.0 * PI * 1375.0 * t).sin()
        })
        .collect()
}
