//! WAV input and output.

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

use crate::error::{EncodecError, Result};

/// Mono waveform with its sample rate.
///
/// Samples are 32-bit floats in \[-1.0, 1.0\].
///
/// # Example
///
/// ```rust,ignore
/// let mut audio = AudioBuffer::load("input.wav")?;
/// let padded = audio.pad_to_multiple(ctx.hparams()?.compression_factor());
/// let out = ctx.reconstruct(&audio.samples, 4)?;
/// AudioBuffer::new(out, audio.sample_rate).save("output.wav")?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> f32 {
        self.samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
    }

    /// Zero-pad the end up to the next multiple of `hop`.
    ///
    /// Returns the number of samples added.
    pub fn pad_to_multiple(&mut self, hop: usize) -> usize {
        if hop == 0 {
            return 0;
        }
        let target = self.samples.len().div_ceil(hop) * hop;
        let added = target - self.samples.len();
        self.samples.resize(target, 0.0);
        added
    }

    /// Drop samples beyond `len`.
    pub fn truncate(&mut self, len: usize) {
        self.samples.truncate(len);
    }

    /// Signal-to-noise ratio of `reconstruction` against `self`, in dB.
    ///
    /// Compares the overlapping prefix. Returns infinity for an exact match.
    pub fn snr_db(&self, reconstruction: &[f32]) -> f32 {
        let (signal, noise) = self
            .samples
            .iter()
            .zip(reconstruction)
            .fold((0.0f64, 0.0f64), |(s, n), (&a, &b)| {
                let d = (a - b) as f64;
                (s + (a as f64) * (a as f64), n + d * d)
            });
        if noise == 0.0 {
            return f32::INFINITY;
        }
        (10.0 * (signal / noise).log10()) as f32
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_wav(path, &self.samples, self.sample_rate)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_wav(path)
    }
}

fn wav_error(path: &Path, source: hound::Error) -> EncodecError {
    EncodecError::Audio {
        path: path.display().to_string(),
        source,
    }
}

/// Load a WAV file, averaging channels down to mono.
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let reader = WavReader::open(path).map_err(|e| wav_error(path, e))?;

    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| wav_error(path, e))?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| wav_error(path, e))?
        }
    };

    let mono = if channels > 1 {
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        samples
    };

    tracing::debug!(
        "Loaded {} ({} Hz, {} ch, {} samples)",
        path.display(),
        spec.sample_rate,
        channels,
        mono.len()
    );
    Ok(AudioBuffer::new(mono, spec.sample_rate))
}

/// Write mono 16-bit PCM. Samples outside \[-1.0, 1.0\] are clipped.
pub fn save_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let path = path.as_ref();
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec).map_err(|e| wav_error(path, e))?;
    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        writer.write_sample(scaled).map_err(|e| wav_error(path, e))?;
    }
    writer.finalize().map_err(|e| wav_error(path, e))?;
    Ok(())
}
