//! Command-line front end for the EnCodec codec
//!
//! Usage:
//!     cargo run --features cli --bin encodec -- reconstruct -m encodec_24khz.bin -i in.wav -o out.wav
//!     cargo run --features cli --bin encodec -- encode -m encodec_24khz.bin -i in.wav -o codes.json -b 6
//!     cargo run --features cli --bin encodec -- decode -m encodec_24khz.bin -i codes.json -o out.wav
//!     cargo run --features cli --bin encodec -- info -m encodec_24khz.bin

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use encodec::{
    device_info, parse_device, AudioBuffer, Bandwidth, Codes, EncodecContext, ReconstructOptions,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "EnCodec neural audio codec", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Write a Chrome trace to this file (needs the `profiling` feature)
    #[arg(long, global = true)]
    trace: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encode and decode a WAV file
    Reconstruct {
        #[command(flatten)]
        common: Common,

        /// Input WAV file
        #[arg(short, long)]
        input: PathBuf,

        /// Output WAV file
        #[arg(short, long)]
        output: PathBuf,

        /// Target bandwidth in kbps (1.5, 3, 6, 12 or 24); default uses every stage
        #[arg(short, long)]
        bandwidth: Option<f32>,

        /// Also write the codes as JSON
        #[arg(long)]
        codes: Option<PathBuf>,

        /// Zero-pad the input to a whole number of frames instead of failing
        #[arg(long)]
        pad: bool,
    },
    /// Compress a WAV file to codes (JSON)
    Encode {
        #[command(flatten)]
        common: Common,

        /// Input WAV file
        #[arg(short, long)]
        input: PathBuf,

        /// Output JSON file
        #[arg(short, long)]
        output: PathBuf,

        /// Target bandwidth in kbps (1.5, 3, 6, 12 or 24)
        #[arg(short, long)]
        bandwidth: Option<f32>,

        /// Zero-pad the input to a whole number of frames instead of failing
        #[arg(long)]
        pad: bool,
    },
    /// Decompress codes (JSON) to a WAV file
    Decode {
        #[command(flatten)]
        common: Common,

        /// Input JSON file written by `encode`
        #[arg(short, long)]
        input: PathBuf,

        /// Output WAV file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print the hyperparameters of a weight file
    Info {
        #[command(flatten)]
        common: Common,
    },
}

#[derive(ClapArgs, Debug)]
struct Common {
    /// Weight file
    #[arg(short, long)]
    model: PathBuf,

    /// Worker threads (0 = one per core)
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Device for inference (auto, cpu, cuda, cuda:N, metal)
    #[arg(long, default_value = "cpu")]
    device: String,
}

/// On-disk form of encoded audio.
#[derive(Debug, Serialize, Deserialize)]
struct CodesFile {
    sample_rate: u32,
    /// Samples in the original clip, before padding
    n_samples: usize,
    codes: Codes,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _profiling_guard = cli.trace.as_deref().and_then(encodec::profiling::init);
    if _profiling_guard.is_none() {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    match cli.command {
        Command::Reconstruct {
            common,
            input,
            output,
            bandwidth,
            codes,
            pad,
        } => run_reconstruct(&common, &input, &output, bandwidth, codes.as_deref(), pad),
        Command::Encode {
            common,
            input,
            output,
            bandwidth,
            pad,
        } => run_encode(&common, &input, &output, bandwidth, pad),
        Command::Decode {
            common,
            input,
            output,
        } => run_decode(&common, &input, &output),
        Command::Info { common } => run_info(&common),
    }
}

fn open_context(common: &Common) -> Result<EncodecContext> {
    let device = parse_device(&common.device)?;
    println!("Device: {}", device_info(&device));
    let ctx = EncodecContext::load_on(&common.model, &device)
        .with_context(|| format!("loading {}", common.model.display()))?;
    println!(
        "Loaded {} in {:.1} ms",
        common.model.display(),
        ctx.timings().t_load_us as f64 / 1000.0
    );
    Ok(ctx)
}

fn stage_count(ctx: &EncodecContext, bandwidth: Option<f32>) -> Result<Option<usize>> {
    let Some(kbps) = bandwidth else {
        return Ok(None);
    };
    let Some(bw) = Bandwidth::from_kbps(kbps) else {
        let valid: Vec<String> = Bandwidth::ALL.iter().map(|b| b.kbps().to_string()).collect();
        bail!("unsupported bandwidth {kbps} kbps, expected one of {}", valid.join(", "));
    };
    let available = ctx.hparams()?.n_q;
    if bw.n_q() > available {
        bail!("{bw} needs {} stages, the model has {available}", bw.n_q());
    }
    Ok(Some(bw.n_q()))
}

/// Load a WAV file that matches the model's sample rate.
fn load_input(ctx: &EncodecContext, path: &Path, pad: bool) -> Result<(AudioBuffer, usize)> {
    let mut audio = AudioBuffer::load(path)?;
    let expected = ctx.hparams()?.sample_rate;
    if audio.sample_rate != expected {
        bail!(
            "{} is sampled at {} Hz, the model expects {expected} Hz",
            path.display(),
            audio.sample_rate
        );
    }
    let original_len = audio.len();
    if pad {
        let added = audio.pad_to_multiple(ctx.hparams()?.compression_factor());
        if added > 0 {
            println!("Padded input with {added} zero samples");
        }
    }
    println!(
        "Input: {} samples ({:.2}s @ {} Hz)",
        original_len,
        original_len as f32 / audio.sample_rate as f32,
        audio.sample_rate
    );
    Ok((audio, original_len))
}

fn write_codes(path: &Path, file: &CodesFile) -> Result<()> {
    let writer = BufWriter::new(
        File::create(path).with_context(|| format!("creating {}", path.display()))?,
    );
    serde_json::to_writer(writer, file)?;
    println!(
        "Codes: {} stages x {} frames -> {}",
        file.codes.n_q(),
        file.codes.n_frames(),
        path.display()
    );
    Ok(())
}

fn run_reconstruct(
    common: &Common,
    input: &Path,
    output: &Path,
    bandwidth: Option<f32>,
    codes_path: Option<&Path>,
    pad: bool,
) -> Result<()> {
    let mut ctx = open_context(common)?;
    let (audio, original_len) = load_input(&ctx, input, pad)?;

    let mut opts = ReconstructOptions::default()
        .with_threads(common.threads)
        .keep_codes(codes_path.is_some());
    opts.n_q = stage_count(&ctx, bandwidth)?;

    let result = ctx.reconstruct_with(&audio.samples, &opts)?;
    let mut out = AudioBuffer::new(result.audio, audio.sample_rate);
    out.truncate(original_len);
    out.save(output)?;

    println!(
        "Output: {} samples -> {} (SNR {:.2} dB)",
        out.len(),
        output.display(),
        audio.snr_db(&out.samples)
    );
    println!(
        "Timing: encode {:.1} ms, quantize {:.1} ms, decode {:.1} ms, total {:.1} ms",
        result.timing.encode_ms,
        result.timing.quantize_ms,
        result.timing.decode_ms,
        result.timing.total_ms
    );

    if let (Some(path), Some(codes)) = (codes_path, result.codes) {
        write_codes(
            path,
            &CodesFile {
                sample_rate: audio.sample_rate,
                n_samples: original_len,
                codes,
            },
        )?;
    }
    Ok(())
}

fn run_encode(
    common: &Common,
    input: &Path,
    output: &Path,
    bandwidth: Option<f32>,
    pad: bool,
) -> Result<()> {
    let mut ctx = open_context(common)?;
    let (audio, original_len) = load_input(&ctx, input, pad)?;

    let mut opts = ReconstructOptions::default().with_threads(common.threads);
    opts.n_q = stage_count(&ctx, bandwidth)?;

    let codes = ctx.encode(&audio.samples, &opts)?;
    let bitrate = ctx.hparams()?.bitrate(codes.n_q());
    println!("Bit-rate: {:.1} kbps", bitrate as f64 / 1000.0);
    write_codes(
        output,
        &CodesFile {
            sample_rate: audio.sample_rate,
            n_samples: original_len,
            codes,
        },
    )
}

fn run_decode(common: &Common, input: &Path, output: &Path) -> Result<()> {
    let mut ctx = open_context(common)?;
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("opening {}", input.display()))?,
    );
    let file: CodesFile = serde_json::from_reader(reader)
        .with_context(|| format!("parsing {}", input.display()))?;

    let expected = ctx.hparams()?.sample_rate;
    if file.sample_rate != expected {
        bail!(
            "codes were produced at {} Hz, the model runs at {expected} Hz",
            file.sample_rate
        );
    }

    let samples = ctx.decode(&file.codes, common.threads)?;
    let mut out = AudioBuffer::new(samples, file.sample_rate);
    out.truncate(file.n_samples);
    out.save(output)?;
    println!("Output: {} samples -> {}", out.len(), output.display());
    Ok(())
}

fn run_info(common: &Common) -> Result<()> {
    let ctx = open_context(common)?;
    let model = ctx.model()?;
    let hp = model.hparams();

    println!("{}", serde_json::to_string_pretty(hp)?);
    println!(
        "Parameters: {:.2}M in {} tensors",
        model.layout().n_params() as f64 / 1e6,
        model.layout().tensors().len()
    );
    println!(
        "Compression factor: {} samples/frame, {} frames/s",
        hp.compression_factor(),
        hp.frame_rate()
    );
    for n_q in hp.supported_n_q() {
        println!("  {n_q:>2} stages: {:.1} kbps", hp.bitrate(n_q) as f64 / 1000.0);
    }
    Ok(())
}
