//! Weight file reading and writing
//!
//! The file starts with a magic number, a format version and the
//! hyperparameter block, followed by named tensor records until EOF. Each
//! record stores its dimensions innermost-first; payloads are f32 or f16,
//! little-endian. Weight-norm decompositions are folded in by the converter,
//! so every convolution has a single `weight` tensor.
//!
//! [`WeightStore`] is the load-time view of such a file: components take their
//! tensors out of it by name and expected shape, and whatever is left over is
//! reported once loading completes.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use candle_core::{Device, Tensor};
use half::f16;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use super::config::{Hyperparameters, PadMode, RecurrentSkip};
use crate::error::{EncodecError, Result};

/// "ggml" read as a little-endian u32.
pub const FILE_MAGIC: u32 = 0x6767_6d6c;

/// Current format version.
pub const FILE_VERSION: u32 = 1;

const MAX_DIMS: i32 = 4;
const MAX_NAME_LEN: i32 = 512;
const MAX_RATIOS: i32 = 16;

/// Element encoding of a tensor payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    F32,
    F16,
}

impl FileType {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(FileType::F32),
            1 => Some(FileType::F16),
            _ => None,
        }
    }

    fn code(self) -> i32 {
        match self {
            FileType::F32 => 0,
            FileType::F16 => 1,
        }
    }

    fn elem_size(self) -> usize {
        match self {
            FileType::F32 => 4,
            FileType::F16 => 2,
        }
    }
}

/// Named tensors read from a weight file, widened to f32.
pub struct WeightStore {
    source: String,
    hparams: Hyperparameters,
    tensors: HashMap<String, Tensor>,
    n_loaded: usize,
}

impl WeightStore {
    /// Open and parse a weight file.
    pub fn open<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let label = path.display().to_string();
        let file = File::open(path)
            .map_err(|e| EncodecError::load_io(&label, "cannot open weight file", e))?;
        Self::read_from(BufReader::new(file), &label, device)
    }

    /// Parse a weight file from any reader. `source` labels errors.
    pub fn read_from<R: Read>(mut reader: R, source: &str, device: &Device) -> Result<Self> {
        let io_err = |what: &str, e: std::io::Error| {
            EncodecError::load_io(source, format!("failed to read {what}"), e)
        };

        let magic = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| io_err("magic", e))?;
        if magic != FILE_MAGIC {
            return Err(EncodecError::load(
                source,
                format!("bad magic 0x{magic:08x} (expected 0x{FILE_MAGIC:08x})"),
            ));
        }
        let version = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| io_err("version", e))?;
        if version != FILE_VERSION {
            return Err(EncodecError::load(
                source,
                format!("unsupported format version {version}"),
            ));
        }

        let hparams = read_hparams(&mut reader, source)?;
        hparams
            .validate()
            .map_err(|reason| EncodecError::load(source, reason))?;

        let mut tensors = HashMap::new();
        loop {
            let n_dims = match reader.read_i32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(io_err("tensor header", e)),
            };
            let name_len = reader
                .read_i32::<LittleEndian>()
                .map_err(|e| io_err("tensor header", e))?;
            let ftype_code = reader
                .read_i32::<LittleEndian>()
                .map_err(|e| io_err("tensor header", e))?;

            if !(1..=MAX_DIMS).contains(&n_dims) {
                return Err(EncodecError::load(
                    source,
                    format!("tensor #{} has invalid rank {n_dims}", tensors.len()),
                ));
            }
            if !(1..=MAX_NAME_LEN).contains(&name_len) {
                return Err(EncodecError::load(
                    source,
                    format!("tensor #{} has invalid name length {name_len}", tensors.len()),
                ));
            }
            let ftype = FileType::from_code(ftype_code).ok_or_else(|| {
                EncodecError::load(source, format!("unsupported ftype {ftype_code}"))
            })?;

            let mut shape = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                let dim = reader
                    .read_i32::<LittleEndian>()
                    .map_err(|e| io_err("tensor dims", e))?;
                if dim <= 0 {
                    return Err(EncodecError::load(
                        source,
                        format!("tensor #{} has non-positive dimension {dim}", tensors.len()),
                    ));
                }
                shape.push(dim as usize);
            }
            // Stored innermost-first.
            shape.reverse();

            let mut name_bytes = vec![0u8; name_len as usize];
            reader
                .read_exact(&mut name_bytes)
                .map_err(|e| io_err("tensor name", e))?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| EncodecError::load(source, "tensor name is not valid UTF-8"))?;

            let n_elements = shape
                .iter()
                .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                .ok_or_else(|| {
                    EncodecError::load(
                        source,
                        format!("tensor {name} has too many elements {shape:?}"),
                    )
                })?;
            let data = read_payload(&mut reader, ftype, n_elements)
                .map_err(|e| io_err(&format!("data of {name}"), e))?;
            let tensor = Tensor::from_vec(data, shape.as_slice(), device)?;

            tracing::trace!("read tensor {name} {:?} ({:?})", shape, ftype);
            if tensors.insert(name.clone(), tensor).is_some() {
                return Err(EncodecError::load(
                    source,
                    format!("duplicate tensor {name}"),
                ));
            }
        }

        Ok(Self {
            source: source.to_string(),
            hparams,
            n_loaded: 0,
            tensors,
        })
    }

    /// Hyperparameters declared by the file header.
    pub fn hparams(&self) -> &Hyperparameters {
        &self.hparams
    }

    /// Label used in error messages (usually the file path).
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Number of tensors not yet taken.
    pub fn remaining(&self) -> usize {
        self.tensors.len()
    }

    /// Number of tensors taken so far.
    pub fn n_loaded(&self) -> usize {
        self.n_loaded
    }

    /// Whether a tensor with this name is still in the store.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Move a tensor out of the store, checking its shape.
    pub fn take(&mut self, name: &str, shape: &[usize]) -> Result<Tensor> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| EncodecError::load(&self.source, format!("missing tensor {name}")))?;
        if tensor.dims() != shape {
            return Err(EncodecError::load(
                &self.source,
                format!(
                    "tensor {name} has shape {:?}, expected {:?}",
                    tensor.dims(),
                    shape
                ),
            ));
        }
        self.n_loaded += 1;
        Ok(tensor)
    }

    /// Names of tensors nobody asked for, sorted.
    pub fn leftover_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tensors.keys().cloned().collect();
        names.sort();
        names
    }
}

fn read_hparams<R: Read>(reader: &mut R, source: &str) -> Result<Hyperparameters> {
    let mut next = |field: &str| -> Result<i32> {
        reader.read_i32::<LittleEndian>().map_err(|e| {
            EncodecError::load_io(source, format!("failed to read hyperparameter {field}"), e)
        })
    };
    let unsigned = |field: &str, v: i32| -> Result<usize> {
        usize::try_from(v).map_err(|_| {
            EncodecError::load(source, format!("hyperparameter {field} is negative ({v})"))
        })
    };

    let in_channels = unsigned("in_channels", next("in_channels")?)?;
    let hidden_dim = unsigned("hidden_dim", next("hidden_dim")?)?;
    let n_filters = unsigned("n_filters", next("n_filters")?)?;
    let kernel_size = unsigned("kernel_size", next("kernel_size")?)?;
    let residual_kernel_size = unsigned("residual_kernel_size", next("residual_kernel_size")?)?;
    let compress = unsigned("compress", next("compress")?)?;
    let n_lstm_layers = unsigned("n_lstm_layers", next("n_lstm_layers")?)?;
    let stride = unsigned("stride", next("stride")?)?;
    let n_q = unsigned("n_q", next("n_q")?)?;
    let n_bins = unsigned("n_bins", next("n_bins")?)?;
    let sample_rate = unsigned("sample_rate", next("sample_rate")?)? as u32;
    let pad_code = next("pad_mode")?;
    let pad_mode = PadMode::from_code(pad_code)
        .ok_or_else(|| EncodecError::load(source, format!("unknown pad mode {pad_code}")))?;
    let skip_code = next("recurrent_skip")?;
    let recurrent_skip = RecurrentSkip::from_code(skip_code).ok_or_else(|| {
        EncodecError::load(source, format!("unknown recurrent skip {skip_code}"))
    })?;
    let n_ratios = next("n_ratios")?;
    if !(1..=MAX_RATIOS).contains(&n_ratios) {
        return Err(EncodecError::load(
            source,
            format!("invalid ratio count {n_ratios}"),
        ));
    }
    let mut ratios = Vec::with_capacity(n_ratios as usize);
    for _ in 0..n_ratios {
        ratios.push(unsigned("ratios", next("ratios")?)?);
    }

    Ok(Hyperparameters {
        in_channels,
        hidden_dim,
        n_filters,
        ratios,
        kernel_size,
        residual_kernel_size,
        compress,
        n_lstm_layers,
        stride,
        n_q,
        n_bins,
        sample_rate,
        pad_mode,
        recurrent_skip,
    })
}

/// Read `n` elements. The buffer grows with the bytes actually present, so a
/// corrupt element count fails with `UnexpectedEof` instead of allocating it.
fn read_payload<R: Read>(reader: &mut R, ftype: FileType, n: usize) -> std::io::Result<Vec<f32>> {
    let n_bytes = n
        .checked_mul(ftype.elem_size())
        .and_then(|b| u64::try_from(b).ok())
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidData, "payload size overflows"))?;

    let mut bytes = Vec::new();
    reader.by_ref().take(n_bytes).read_to_end(&mut bytes)?;
    if (bytes.len() as u64) < n_bytes {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("payload has {} of {n_bytes} bytes", bytes.len()),
        ));
    }

    let mut data = vec![0f32; n];
    match ftype {
        FileType::F32 => LittleEndian::read_f32_into(&bytes, &mut data),
        FileType::F16 => {
            for (out, b) in data.iter_mut().zip(bytes.chunks_exact(2)) {
                *out = f16::from_bits(LittleEndian::read_u16(b)).to_f32();
            }
        }
    }
    Ok(data)
}

/// Serializes hyperparameters and tensors into the weight file format.
pub struct WeightWriter<W: Write> {
    inner: W,
    n_written: usize,
}

impl WeightWriter<BufWriter<File>> {
    /// Create a weight file at `path` and write its header.
    pub fn create<P: AsRef<Path>>(path: P, hparams: &Hyperparameters) -> std::io::Result<Self> {
        Self::new(BufWriter::new(File::create(path)?), hparams)
    }
}

impl<W: Write> WeightWriter<W> {
    /// Wrap a writer and emit the header.
    pub fn new(mut inner: W, hparams: &Hyperparameters) -> std::io::Result<Self> {
        inner.write_u32::<LittleEndian>(FILE_MAGIC)?;
        inner.write_u32::<LittleEndian>(FILE_VERSION)?;
        for v in [
            hparams.in_channels,
            hparams.hidden_dim,
            hparams.n_filters,
            hparams.kernel_size,
            hparams.residual_kernel_size,
            hparams.compress,
            hparams.n_lstm_layers,
            hparams.stride,
            hparams.n_q,
            hparams.n_bins,
            hparams.sample_rate as usize,
        ] {
            inner.write_i32::<LittleEndian>(to_i32(v)?)?;
        }
        inner.write_i32::<LittleEndian>(hparams.pad_mode.code())?;
        inner.write_i32::<LittleEndian>(hparams.recurrent_skip.code())?;
        inner.write_i32::<LittleEndian>(to_i32(hparams.ratios.len())?)?;
        for &r in &hparams.ratios {
            inner.write_i32::<LittleEndian>(to_i32(r)?)?;
        }
        Ok(Self {
            inner,
            n_written: 0,
        })
    }

    /// Append one tensor record.
    pub fn write_tensor(
        &mut self,
        name: &str,
        shape: &[usize],
        data: &[f32],
        ftype: FileType,
    ) -> std::io::Result<()> {
        let n: usize = shape.iter().product();
        if n != data.len() {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("{name}: shape {shape:?} needs {n} values, got {}", data.len()),
            ));
        }
        let w = &mut self.inner;
        w.write_i32::<LittleEndian>(to_i32(shape.len())?)?;
        w.write_i32::<LittleEndian>(to_i32(name.len())?)?;
        w.write_i32::<LittleEndian>(ftype.code())?;
        for &dim in shape.iter().rev() {
            w.write_i32::<LittleEndian>(to_i32(dim)?)?;
        }
        w.write_all(name.as_bytes())?;
        match ftype {
            FileType::F32 => {
                for &v in data {
                    w.write_f32::<LittleEndian>(v)?;
                }
            }
            FileType::F16 => {
                for &v in data {
                    w.write_u16::<LittleEndian>(f16::from_f32(v).to_bits())?;
                }
            }
        }
        self.n_written += 1;
        Ok(())
    }

    /// Number of tensor records written.
    pub fn n_written(&self) -> usize {
        self.n_written
    }

    /// Flush and return the underlying writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

fn to_i32(v: usize) -> std::io::Result<i32> {
    i32::try_from(v).map_err(|_| {
        std::io::Error::new(ErrorKind::InvalidInput, format!("{v} does not fit in i32"))
    })
}
