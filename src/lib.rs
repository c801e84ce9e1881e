//! # encodec
//!
//! Pure Rust inference for the [EnCodec](https://github.com/facebookresearch/encodec)
//! neural audio codec.
//!
//! A waveform goes through a convolutional encoder, a residual vector
//! quantizer that turns every latent frame into `n_q` codebook indices, and a
//! mirror-image decoder that turns the indices back into audio. With the
//! 24 kHz model the codes cost 1.5 to 24 kbps depending on how many
//! quantizer stages are used.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use encodec::{Bandwidth, EncodecContext, ReconstructOptions};
//!
//! let mut ctx = EncodecContext::load("encodec_24khz.bin")?;
//!
//! // Full round trip with every stage the checkpoint has
//! let out = ctx.reconstruct(&samples, 4)?;
//!
//! // Or at a chosen bit-rate, keeping the codes
//! let opts = ReconstructOptions::default()
//!     .with_threads(4)
//!     .with_bandwidth(Bandwidth::Kbps6)
//!     .keep_codes(true);
//! let result = ctx.reconstruct_with(&samples, &opts)?;
//! println!("{} frames", result.codes.unwrap().n_frames());
//! ```
//!
//! ## Input length
//!
//! Every call takes a mono waveform whose length is a positive multiple of
//! the compression factor (320 samples for the 24 kHz model). Other lengths
//! are rejected with [`EncodecError::InputShape`] before any work is done;
//! [`AudioBuffer::pad_to_multiple`] fixes them up.
//!
//! ## Threads
//!
//! Each context owns a rayon pool sized by the `n_threads` argument of the
//! last call. Output does not depend on the thread count.

pub mod audio;
pub mod error;
pub mod graph;
pub mod models;
pub mod profiling;

use candle_core::{Device, Tensor};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span};

use graph::{copy_to_host, nodes, GraphPlan, ScratchPool, ShapeCursor, StageObserver};
use models::codec::quantizer::latent_to_frames;

pub use audio::AudioBuffer;
pub use error::{EncodecError, Result};
pub use models::{
    Bandwidth, Codes, EncodecModel, Hyperparameters, PadMode, RecurrentSkip, DECODER_TRIM,
    SUPPORTED_N_Q,
};

/// Cumulative timing counters of one context.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Timings {
    /// Time spent loading the model (µs). Zero for contexts built from a shared model.
    pub t_load_us: u64,
    /// Total compute time of all calls so far (ms).
    pub t_compute_ms: f64,
    /// Number of successful calls.
    pub n_calls: usize,
}

/// Per-stage timing breakdown from one call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTiming {
    /// Encoder forward pass (ms).
    pub encode_ms: f64,
    /// Codebook search (ms).
    pub quantize_ms: f64,
    /// Dequantization and decoder forward pass (ms).
    pub decode_ms: f64,
    /// Whole call including staging (ms).
    pub total_ms: f64,
}

/// Options for [`EncodecContext::reconstruct_with`] and [`EncodecContext::encode`].
#[derive(Debug, Clone)]
pub struct ReconstructOptions {
    /// Worker threads; 0 lets rayon pick one per core.
    pub n_threads: usize,
    /// Quantizer stages to use; `None` uses every stage in the checkpoint.
    pub n_q: Option<usize>,
    /// Return the code indices alongside the audio.
    pub keep_codes: bool,
}

impl Default for ReconstructOptions {
    fn default() -> Self {
        Self {
            n_threads: 1,
            n_q: None,
            keep_codes: false,
        }
    }
}

impl ReconstructOptions {
    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }

    pub fn with_n_q(mut self, n_q: usize) -> Self {
        self.n_q = Some(n_q);
        self
    }

    pub fn with_bandwidth(mut self, bandwidth: Bandwidth) -> Self {
        self.n_q = Some(bandwidth.n_q());
        self
    }

    pub fn keep_codes(mut self, keep: bool) -> Self {
        self.keep_codes = keep;
        self
    }
}

/// Result of [`EncodecContext::reconstruct_with`].
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub audio: Vec<f32>,
    pub codes: Option<Codes>,
    pub timing: StageTiming,
}

/// Rayon pool rebuilt only when the requested size changes.
#[derive(Default)]
struct Workers {
    current: Option<(usize, rayon::ThreadPool)>,
}

impl Workers {
    fn get(&mut self, n_threads: usize) -> Result<&rayon::ThreadPool> {
        let entry = match self.current.take() {
            Some(entry) if entry.0 == n_threads => entry,
            _ => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n_threads)
                    .thread_name(|i| format!("encodec-worker-{i}"))
                    .build()
                    .map_err(|e| EncodecError::ThreadPool {
                        threads: n_threads,
                        message: e.to_string(),
                    })?;
                debug!("Built worker pool with {} threads", pool.current_num_threads());
                (n_threads, pool)
            }
        };
        Ok(&self.current.insert(entry).1)
    }

    fn threads(&self) -> Option<usize> {
        self.current.as_ref().map(|(_, pool)| pool.current_num_threads())
    }
}

/// Execution context: a model handle plus everything one caller needs to
/// run it repeatedly.
///
/// Calls take `&mut self` and run one at a time. For concurrent work, build
/// one context per thread from a shared `Arc<EncodecModel>` with
/// [`EncodecContext::from_model`].
pub struct EncodecContext {
    model: Option<Arc<EncodecModel>>,
    scratch: ScratchPool,
    workers: Workers,
    timings: Timings,
    last_timing: Option<StageTiming>,
}

impl EncodecContext {
    /// Load a weight file on the CPU.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_on(path, &Device::Cpu)
    }

    /// Load a weight file on `device`.
    pub fn load_on<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let start = Instant::now();
        let model = EncodecModel::load(path, device)?;
        let mut ctx = Self::from_model(Arc::new(model));
        ctx.timings.t_load_us = start.elapsed().as_micros() as u64;
        Ok(ctx)
    }

    /// New context over an already loaded model.
    pub fn from_model(model: Arc<EncodecModel>) -> Self {
        Self {
            model: Some(model),
            scratch: ScratchPool::new(),
            workers: Workers::default(),
            timings: Timings::default(),
            last_timing: None,
        }
    }

    /// Shared handle to the model.
    pub fn model(&self) -> Result<&Arc<EncodecModel>> {
        self.model.as_ref().ok_or(EncodecError::ContextReleased)
    }

    pub fn hparams(&self) -> Result<&Hyperparameters> {
        Ok(self.model()?.hparams())
    }

    /// Cumulative load and compute counters.
    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Stage breakdown of the most recent successful call.
    pub fn last_timing(&self) -> Option<&StageTiming> {
        self.last_timing.as_ref()
    }

    /// Host bytes held by the scratch pool.
    pub fn scratch_bytes(&self) -> usize {
        self.scratch.capacity_bytes()
    }

    /// Threads in the current worker pool, if one has been built.
    pub fn worker_threads(&self) -> Option<usize> {
        self.workers.threads()
    }

    /// Whether [`EncodecContext::free`] has been called.
    pub fn is_released(&self) -> bool {
        self.model.is_none()
    }

    /// Encode and decode `samples` with every quantizer stage.
    ///
    /// The output has `samples.len() - DECODER_TRIM` samples.
    pub fn reconstruct(&mut self, samples: &[f32], n_threads: usize) -> Result<Vec<f32>> {
        let opts = ReconstructOptions::default().with_threads(n_threads);
        Ok(self.reconstruct_with(samples, &opts)?.audio)
    }

    /// Replace the contents of `audio` with its reconstruction.
    ///
    /// The old buffer goes into the scratch pool and receives the output of
    /// the next call, so repeated calls stop allocating output. On error
    /// `audio` is left untouched.
    pub fn reconstruct_into(&mut self, audio: &mut Vec<f32>, n_threads: usize) -> Result<()> {
        let out = self.reconstruct(audio, n_threads)?;
        let input = std::mem::replace(audio, out);
        self.scratch.restore_audio(input);
        Ok(())
    }

    /// Encode and decode `samples` with the given options.
    pub fn reconstruct_with(
        &mut self,
        samples: &[f32],
        opts: &ReconstructOptions,
    ) -> Result<Reconstruction> {
        let hp = self.hparams()?;
        let n_q = opts.n_q.unwrap_or(hp.n_q);
        let plan = GraphPlan::new(hp, samples.len(), n_q)?;
        let keep_codes = opts.keep_codes;

        let ((audio, codes), timing) =
            self.execute(opts.n_threads, &plan, |model, scratch, cursor, timing| {
                let latent = run_encoder(model, samples, cursor, timing)?;
                let codes = run_quantizer(model, &latent, plan.n_q(), scratch, cursor, timing)?;
                let mut audio = scratch.take_audio();
                run_decoder(model, &codes, &mut audio, cursor, timing)?;
                if keep_codes {
                    Ok((audio, Some(codes)))
                } else {
                    scratch.restore_codes(codes.into_vec());
                    Ok((audio, None))
                }
            })?;

        info!(
            "Reconstructed {} samples ({} frames, {} stages) in {:.1} ms",
            audio.len(),
            plan.n_frames(),
            n_q,
            timing.total_ms
        );
        Ok(Reconstruction {
            audio,
            codes,
            timing,
        })
    }

    /// Compress `samples` to code indices.
    pub fn encode(&mut self, samples: &[f32], opts: &ReconstructOptions) -> Result<Codes> {
        let hp = self.hparams()?;
        let n_q = opts.n_q.unwrap_or(hp.n_q);
        let plan = GraphPlan::encode(hp, samples.len(), n_q)?;

        let (codes, timing) =
            self.execute(opts.n_threads, &plan, |model, scratch, cursor, timing| {
                let latent = run_encoder(model, samples, cursor, timing)?;
                run_quantizer(model, &latent, plan.n_q(), scratch, cursor, timing)
            })?;

        info!(
            "Encoded {} samples to {} x {} codes in {:.1} ms",
            samples.len(),
            codes.n_q(),
            codes.n_frames(),
            timing.total_ms
        );
        Ok(codes)
    }

    /// Decompress code indices to audio.
    pub fn decode(&mut self, codes: &Codes, n_threads: usize) -> Result<Vec<f32>> {
        let hp = self.hparams()?;
        let plan = GraphPlan::decode(hp, codes.n_frames(), codes.n_q())?;

        let (audio, timing) = self.execute(n_threads, &plan, |model, scratch, cursor, timing| {
            let mut audio = scratch.take_audio();
            run_decoder(model, codes, &mut audio, cursor, timing)?;
            Ok(audio)
        })?;

        info!(
            "Decoded {} x {} codes to {} samples in {:.1} ms",
            codes.n_q(),
            codes.n_frames(),
            audio.len(),
            timing.total_ms
        );
        Ok(audio)
    }

    /// Release the model handle, scratch buffers and worker pool.
    ///
    /// Calling it again is a no-op. Every later call fails with
    /// [`EncodecError::ContextReleased`].
    pub fn free(&mut self) {
        if self.model.take().is_some() {
            self.scratch.release();
            self.workers = Workers::default();
            debug!("Released execution context");
        }
    }

    /// Reserve scratch for `plan`, then run `f` inside the worker pool with
    /// a cursor over the plan.
    fn execute<T, F>(&mut self, n_threads: usize, plan: &GraphPlan, f: F) -> Result<(T, StageTiming)>
    where
        T: Send,
        F: FnOnce(&EncodecModel, &mut ScratchPool, &mut ShapeCursor<'_>, &mut StageTiming) -> Result<T>
            + Send,
    {
        let model = Arc::clone(self.model()?);
        let start = Instant::now();
        self.scratch.reserve(plan, model.hparams().hidden_dim);
        debug!(
            "Planned {} nodes, peak activations {:.1} MiB, host scratch {} bytes",
            plan.nodes().len(),
            plan.peak_bytes() as f64 / (1024.0 * 1024.0),
            self.scratch.capacity_bytes()
        );

        let pool = self.workers.get(n_threads)?;
        let scratch = &mut self.scratch;
        let mut timing = StageTiming::default();
        let value = pool.install(|| -> Result<T> {
            let mut cursor = plan.cursor();
            let value = f(&model, scratch, &mut cursor, &mut timing)?;
            cursor.finish()?;
            Ok(value)
        })?;

        timing.total_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.timings.t_compute_ms += timing.total_ms;
        self.timings.n_calls += 1;
        self.last_timing = Some(timing.clone());
        Ok((value, timing))
    }
}

fn run_encoder(
    model: &EncodecModel,
    samples: &[f32],
    cursor: &mut ShapeCursor<'_>,
    timing: &mut StageTiming,
) -> Result<Tensor> {
    let _span = info_span!("encode", samples = samples.len()).entered();
    let start = Instant::now();

    let x = Tensor::from_slice(samples, (1, 1, samples.len()), model.device())?;
    let latent = model.encoder().forward_observed(&x, cursor)?;

    timing.encode_ms = start.elapsed().as_secs_f64() * 1000.0;
    debug!("encoder: {:?} in {:.1} ms", latent.dims(), timing.encode_ms);
    Ok(latent)
}

fn run_quantizer(
    model: &EncodecModel,
    latent: &Tensor,
    n_q: usize,
    scratch: &mut ScratchPool,
    cursor: &mut ShapeCursor<'_>,
    timing: &mut StageTiming,
) -> Result<Codes> {
    let _span = info_span!("quantize", n_q).entered();
    let start = Instant::now();

    let n_frames = latent.dim(2)?;
    let (frames, indices) = scratch.quantizer_buffers();
    latent_to_frames(latent, frames)?;
    model.quantizer().encode_frames(frames, n_q, indices)?;
    cursor.observe(nodes::CODES, &[n_q, n_frames])?;
    let codes = Codes::new(n_q, n_frames, scratch.take_codes())?;

    timing.quantize_ms = start.elapsed().as_secs_f64() * 1000.0;
    debug!("quantizer: {n_q} x {n_frames} codes in {:.1} ms", timing.quantize_ms);
    Ok(codes)
}

fn run_decoder(
    model: &EncodecModel,
    codes: &Codes,
    out: &mut Vec<f32>,
    cursor: &mut ShapeCursor<'_>,
    timing: &mut StageTiming,
) -> Result<()> {
    let _span = info_span!("decode", frames = codes.n_frames()).entered();
    let start = Instant::now();

    let latent = model.quantizer().decode(codes, model.device())?;
    cursor.observe(nodes::DEQUANTIZED, latent.dims())?;
    let audio = model.decoder().forward_observed(&latent, cursor)?;

    copy_to_host(&audio, out)?;

    timing.decode_ms = start.elapsed().as_secs_f64() * 1000.0;
    debug!("decoder: {} samples in {:.1} ms", out.len(), timing.decode_ms);
    Ok(())
}

/// Select the best available device.
///
/// Tries CUDA, then Metal (when compiled in), then falls back to the CPU.
pub fn auto_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::cuda_if_available(0) {
            if device.is_cuda() {
                info!("Using CUDA device");
                return Ok(device);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            info!("Using Metal device");
            return Ok(device);
        }
    }

    info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Parse `auto`, `cpu`, `cuda`, `cuda:N` or `metal` into a [`Device`].
pub fn parse_device(device_str: &str) -> Result<Device> {
    match device_str.to_lowercase().as_str() {
        "auto" => auto_device(),
        "cpu" => Ok(Device::Cpu),
        s if s.starts_with("cuda") => {
            #[cfg(feature = "cuda")]
            {
                let ordinal: usize = match s.strip_prefix("cuda:") {
                    Some(idx) => idx
                        .parse()
                        .map_err(|e| EncodecError::Device(format!("invalid CUDA index: {e}")))?,
                    None => 0,
                };
                Device::cuda_if_available(ordinal).map_err(|e| {
                    EncodecError::Device(format!("failed to init CUDA device {ordinal}: {e}"))
                })
            }
            #[cfg(not(feature = "cuda"))]
            Err(EncodecError::Device(format!(
                "{s}: CUDA support not compiled in (enable the `cuda` feature)"
            )))
        }
        "metal" => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0)
                    .map_err(|e| EncodecError::Device(format!("failed to init Metal device: {e}")))
            }
            #[cfg(not(feature = "metal"))]
            Err(EncodecError::Device(
                "Metal support not compiled in (enable the `metal` feature)".to_string(),
            ))
        }
        other => Err(EncodecError::Device(format!(
            "unknown device '{other}', expected auto, cpu, cuda, cuda:N or metal"
        ))),
    }
}

/// Human-readable label for a [`Device`].
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}
