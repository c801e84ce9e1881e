//! Audio file handling
//!
//! WAV reading and writing for the command-line tool and tests. The codec
//! itself only sees `&[f32]` sample slices.

mod io;

pub use io::{load_wav, save_wav, AudioBuffer};

/// Sample rate of the published 24 kHz EnCodec model.
pub const SAMPLE_RATE: u32 = 24000;
