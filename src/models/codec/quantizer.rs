//! Residual vector quantization
//!
//! Each stage picks, for every latent frame, the codebook row nearest to the
//! current residual (squared Euclidean distance, lowest index on ties) and
//! subtracts it. Decoding sums the selected rows over the stages in use.
//!
//! The search runs on the host over frame-major data. Stages run one after
//! another; within a stage the frames are independent and are spread across
//! the current rayon pool. Every frame sees the same sequence of operations
//! however the frames are split, so the result does not depend on the thread
//! count.

use candle_core::{Device, Tensor};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{EncodecError, Result};
use crate::graph::copy_to_host;
use crate::models::config::Hyperparameters;
use crate::models::layout::TensorSpec;
use crate::models::weights::WeightStore;

/// Code indices of one clip, stored stage-major: all frames of stage 0, then
/// all frames of stage 1, and so on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCodes")]
pub struct Codes {
    n_q: usize,
    n_frames: usize,
    data: Vec<u32>,
}

/// Wire form of [`Codes`], checked by [`Codes::new`] on the way in.
#[derive(Deserialize)]
struct RawCodes {
    n_q: usize,
    n_frames: usize,
    data: Vec<u32>,
}

impl TryFrom<RawCodes> for Codes {
    type Error = EncodecError;

    fn try_from(raw: RawCodes) -> Result<Self> {
        Codes::new(raw.n_q, raw.n_frames, raw.data)
    }
}

impl Codes {
    pub fn new(n_q: usize, n_frames: usize, data: Vec<u32>) -> Result<Self> {
        if n_q.checked_mul(n_frames) != Some(data.len()) {
            return Err(EncodecError::InputShape(format!(
                "{} code indices do not form {n_q} stages of {n_frames} frames",
                data.len()
            )));
        }
        Ok(Self {
            n_q,
            n_frames,
            data,
        })
    }

    /// Build from one index sequence per stage.
    pub fn from_stages(stages: &[Vec<u32>]) -> Result<Self> {
        let n_frames = stages.first().map_or(0, Vec::len);
        if let Some(bad) = stages.iter().position(|s| s.len() != n_frames) {
            return Err(EncodecError::InputShape(format!(
                "stage {bad} has {} frames, stage 0 has {n_frames}",
                stages[bad].len()
            )));
        }
        Self::new(stages.len(), n_frames, stages.concat())
    }

    pub fn n_q(&self) -> usize {
        self.n_q
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    /// Indices of stage `q`, one per frame.
    pub fn stage(&self, q: usize) -> &[u32] {
        &self.data[q * self.n_frames..(q + 1) * self.n_frames]
    }

    pub fn stages(&self) -> impl Iterator<Item = &[u32]> {
        self.data.chunks(self.n_frames.max(1)).take(self.n_q)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u32> {
        self.data
    }

    /// Keep only the first `n_q` stages, i.e. re-encode at a lower bit-rate.
    pub fn truncate(&self, n_q: usize) -> Result<Self> {
        if n_q > self.n_q {
            return Err(EncodecError::UnsupportedStageCount {
                requested: n_q,
                supported: (1..=self.n_q).collect(),
            });
        }
        Self::new(n_q, self.n_frames, self.data[..n_q * self.n_frames].to_vec())
    }
}

/// One stage: a `[n_bins, dim]` codebook.
pub struct VectorQuantizer {
    embed: Tensor,
    /// Row-major host copy of `embed` for the nearest-neighbour search
    rows: Vec<f32>,
    n_bins: usize,
    dim: usize,
}

impl VectorQuantizer {
    pub fn load(store: &mut WeightStore, spec: &TensorSpec) -> Result<Self> {
        let embed = store.take(&spec.name, &spec.shape)?;
        Self::from_embed(embed)
    }

    pub fn from_embed(embed: Tensor) -> Result<Self> {
        let (n_bins, dim) = embed.dims2()?;
        let rows = embed.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self {
            embed,
            rows,
            n_bins,
            dim,
        })
    }

    /// Index of the row nearest to `v`. Earlier rows win ties.
    pub fn nearest(&self, v: &[f32]) -> u32 {
        let mut best = 0usize;
        let mut best_dist = f32::INFINITY;
        for (i, row) in self.rows.chunks_exact(self.dim).enumerate() {
            let dist: f32 = row
                .iter()
                .zip(v)
                .map(|(c, x)| {
                    let d = x - c;
                    d * d
                })
                .sum();
            if dist < best_dist {
                best_dist = dist;
                best = i;
            }
        }
        best as u32
    }

    /// Codebook row `index`.
    pub fn row(&self, index: u32) -> &[f32] {
        let start = index as usize * self.dim;
        &self.rows[start..start + self.dim]
    }

    pub fn n_bins(&self) -> usize {
        self.n_bins
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

/// Residual vector quantizer over all stages stored in the checkpoint.
pub struct ResidualVectorQuantizer {
    stages: Vec<VectorQuantizer>,
    dim: usize,
    n_bins: usize,
}

impl ResidualVectorQuantizer {
    pub fn load(store: &mut WeightStore, specs: &[TensorSpec], hp: &Hyperparameters) -> Result<Self> {
        let stages = specs
            .iter()
            .map(|spec| VectorQuantizer::load(store, spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            stages,
            dim: hp.hidden_dim,
            n_bins: hp.n_bins,
        })
    }

    pub fn from_stages(stages: Vec<VectorQuantizer>) -> Result<Self> {
        let first = stages
            .first()
            .ok_or_else(|| EncodecError::graph("quantizer.stages", &[1], &[0]))?;
        let (dim, n_bins) = (first.dim(), first.n_bins());
        if let Some(bad) = stages
            .iter()
            .find(|s| s.dim() != dim || s.n_bins() != n_bins)
        {
            return Err(EncodecError::graph(
                "quantizer.codebook",
                &[n_bins, dim],
                &[bad.n_bins(), bad.dim()],
            ));
        }
        Ok(Self {
            stages,
            dim,
            n_bins,
        })
    }

    /// Number of stages available.
    pub fn n_q(&self) -> usize {
        self.stages.len()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn n_bins(&self) -> usize {
        self.n_bins
    }

    fn check_n_q(&self, n_q: usize) -> Result<()> {
        if n_q == 0 || n_q > self.stages.len() {
            return Err(EncodecError::UnsupportedStageCount {
                requested: n_q,
                supported: (1..=self.stages.len()).collect(),
            });
        }
        Ok(())
    }

    /// Quantize frame-major latent data in place.
    ///
    /// `frames` holds `n_frames * dim` values and is left holding the final
    /// residual. `codes` receives `n_q * n_frames` indices, stage-major.
    pub fn encode_frames(&self, frames: &mut [f32], n_q: usize, codes: &mut Vec<u32>) -> Result<()> {
        self.check_n_q(n_q)?;
        if frames.len() % self.dim != 0 {
            return Err(EncodecError::graph(
                "quantizer.latent",
                &[frames.len().div_ceil(self.dim), self.dim],
                &[frames.len()],
            ));
        }
        let n_frames = frames.len() / self.dim;
        codes.clear();
        if n_frames == 0 {
            return Ok(());
        }
        codes.resize(n_frames * n_q, 0);

        for (stage, out) in self.stages[..n_q].iter().zip(codes.chunks_exact_mut(n_frames)) {
            frames
                .par_chunks_mut(self.dim)
                .zip(out.par_iter_mut())
                .for_each(|(residual, slot)| {
                    let index = stage.nearest(residual);
                    for (r, c) in residual.iter_mut().zip(stage.row(index)) {
                        *r -= c;
                    }
                    *slot = index;
                });
        }
        Ok(())
    }

    /// Quantize a latent `[1, dim, frames]` with the first `n_q` stages.
    ///
    /// Returns the codes and the final residual, shaped like the input.
    pub fn encode(&self, latent: &Tensor, n_q: usize) -> Result<(Codes, Tensor)> {
        let (batch, dim, n_frames) = latent.dims3()?;
        if batch != 1 || dim != self.dim {
            return Err(EncodecError::graph(
                "quantizer.latent",
                &[1, self.dim, n_frames],
                latent.dims(),
            ));
        }
        let mut frames = Vec::with_capacity(n_frames * self.dim);
        latent_to_frames(latent, &mut frames)?;
        let mut codes = Vec::new();
        self.encode_frames(&mut frames, n_q, &mut codes)?;

        let residual = frames_to_latent(frames, n_frames, self.dim, latent.device())?;
        Ok((Codes::new(n_q, n_frames, codes)?, residual))
    }

    /// Sum the selected codebook rows: codes to a latent `[1, dim, frames]`.
    pub fn decode(&self, codes: &Codes, device: &Device) -> Result<Tensor> {
        let (n_q, n_frames) = (codes.n_q(), codes.n_frames());
        self.check_n_q(n_q)?;
        if n_frames == 0 {
            return Err(EncodecError::InputShape("codes are empty".to_string()));
        }
        if codes.as_slice().len() != n_q * n_frames {
            return Err(EncodecError::InputShape(format!(
                "{} code indices do not form {n_q} stages of {n_frames} frames",
                codes.as_slice().len()
            )));
        }
        if let Some(&bad) = codes.as_slice().iter().find(|&&i| i as usize >= self.n_bins) {
            return Err(EncodecError::InputShape(format!(
                "code index {bad} is out of range for {} bins",
                self.n_bins
            )));
        }

        let mut sum: Option<Tensor> = None;
        for (q, stage) in self.stages[..n_q].iter().enumerate() {
            let indices = Tensor::new(codes.stage(q), stage.embed.device())?;
            let rows = stage.embed.index_select(&indices, 0)?;
            sum = Some(match sum {
                None => rows,
                Some(acc) => (acc + rows)?,
            });
        }
        let sum = sum.ok_or_else(|| EncodecError::graph("quantizer.dequantized", &[1], &[0]))?;

        // [frames, dim] -> [1, dim, frames]
        Ok(sum.to_device(device)?.t()?.contiguous()?.unsqueeze(0)?)
    }

    /// Check every codebook against the layout.
    pub fn verify(&self, specs: &[TensorSpec]) -> Result<()> {
        if specs.len() != self.stages.len() {
            return Err(EncodecError::graph(
                "quantizer.stages",
                &[specs.len()],
                &[self.stages.len()],
            ));
        }
        for (stage, spec) in self.stages.iter().zip(specs) {
            spec.verify(&stage.embed)?;
        }
        Ok(())
    }
}

/// Append `[1, dim, frames]` to `out` as frame-major host data.
pub(crate) fn latent_to_frames(latent: &Tensor, out: &mut Vec<f32>) -> Result<()> {
    copy_to_host(&latent.get(0)?.t()?.contiguous()?, out)
}

/// Frame-major host data to `[1, dim, frames]`.
pub(crate) fn frames_to_latent(
    frames: Vec<f32>,
    n_frames: usize,
    dim: usize,
    device: &Device,
) -> Result<Tensor> {
    Ok(Tensor::from_vec(frames, (n_frames, dim), device)?
        .t()?
        .contiguous()?
        .unsqueeze(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codebook(rows: &[[f32; 2]]) -> VectorQuantizer {
        let data: Vec<f32> = rows.iter().flatten().copied().collect();
        let embed = Tensor::from_vec(data, (rows.len(), 2), &Device::Cpu).unwrap();
        VectorQuantizer::from_embed(embed).unwrap()
    }

    fn random_rvq(n_q: usize, n_bins: usize, dim: usize) -> ResidualVectorQuantizer {
        let stages = (0..n_q)
            .map(|_| {
                let embed = Tensor::randn(0.0f32, 1.0, (n_bins, dim), &Device::Cpu).unwrap();
                VectorQuantizer::from_embed(embed).unwrap()
            })
            .collect();
        ResidualVectorQuantizer::from_stages(stages).unwrap()
    }

    #[test]
    fn test_nearest_picks_closest_row() {
        let vq = codebook(&[[0.0, 0.0], [1.0, 1.0], [-2.0, 0.5]]);
        assert_eq!(vq.nearest(&[0.9, 1.2]), 1);
        assert_eq!(vq.nearest(&[-1.5, 0.0]), 2);
        assert_eq!(vq.nearest(&[0.1, -0.1]), 0);
    }

    #[test]
    fn test_nearest_ties_go_to_lowest_index() {
        let vq = codebook(&[[1.0, 0.0], [-1.0, 0.0], [1.0, 0.0]]);
        assert_eq!(vq.nearest(&[0.0, 0.0]), 0);
        assert_eq!(vq.nearest(&[2.0, 0.0]), 0);
    }

    #[test]
    fn test_residual_update() {
        let stage0 = codebook(&[[1.0, 1.0], [4.0, 0.0]]);
        let stage1 = codebook(&[[0.0, 0.0], [0.5, 0.5]]);
        let rvq = ResidualVectorQuantizer::from_stages(vec![stage0, stage1]).unwrap();

        // one frame at (1.4, 1.6): stage 0 -> row 0, residual (0.4, 0.6)
        // stage 1 -> row 1, residual (-0.1, 0.1)
        let mut frames = vec![1.4, 1.6];
        let mut codes = Vec::new();
        rvq.encode_frames(&mut frames, 2, &mut codes).unwrap();
        assert_eq!(codes, vec![0, 1]);
        assert!((frames[0] + 0.1).abs() < 1e-6);
        assert!((frames[1] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_codes_are_stage_major() {
        let rvq = random_rvq(4, 16, 8);
        let latent = Tensor::randn(0.0f32, 1.0, (1, 8, 5), &Device::Cpu).unwrap();
        let (codes, _) = rvq.encode(&latent, 4).unwrap();
        assert_eq!(codes.n_q(), 4);
        assert_eq!(codes.n_frames(), 5);
        assert_eq!(codes.stages().count(), 4);

        // Re-quantizing frame 2 alone gives the same column of indices
        let frame = latent.narrow(2, 2, 1).unwrap();
        let (single, _) = rvq.encode(&frame, 4).unwrap();
        for q in 0..4 {
            assert_eq!(single.stage(q)[0], codes.stage(q)[2]);
        }
    }

    #[test]
    fn test_decode_matches_latent_minus_residual() {
        let rvq = random_rvq(8, 32, 6);
        let latent = Tensor::randn(0.0f32, 1.0, (1, 6, 7), &Device::Cpu).unwrap();
        for n_q in [2, 4, 8] {
            let (codes, residual) = rvq.encode(&latent, n_q).unwrap();
            let decoded = rvq.decode(&codes, &Device::Cpu).unwrap();
            assert_eq!(decoded.dims(), &[1, 6, 7]);
            let expected = (&latent - &residual).unwrap();
            let err: f32 = (decoded - expected)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert!(err < 1e-4, "n_q={n_q} err={err}");
        }
    }

    #[test]
    fn test_encode_thread_count_independent() {
        let rvq = random_rvq(4, 64, 16);
        let latent = Tensor::randn(0.0f32, 1.0, (1, 16, 33), &Device::Cpu).unwrap();
        let run = |threads: usize| {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap();
            pool.install(|| rvq.encode(&latent, 4).unwrap().0)
        };
        assert_eq!(run(1), run(4));
    }

    #[test]
    fn test_decode_rejects_bad_codes() {
        let rvq = random_rvq(2, 4, 3);
        let out_of_range = Codes::new(2, 2, vec![0, 1, 2, 4]).unwrap();
        assert!(matches!(
            rvq.decode(&out_of_range, &Device::Cpu),
            Err(EncodecError::InputShape(_))
        ));
        let too_many = Codes::new(3, 1, vec![0, 0, 0]).unwrap();
        assert!(matches!(
            rvq.decode(&too_many, &Device::Cpu),
            Err(EncodecError::UnsupportedStageCount { .. })
        ));
    }

    #[test]
    fn test_codes_helpers() {
        assert!(Codes::new(2, 3, vec![0; 5]).is_err());
        let codes = Codes::from_stages(&[vec![1, 2, 3], vec![4, 5, 6]]).unwrap();
        assert_eq!(codes.stage(1), &[4, 5, 6]);
        assert_eq!(codes.truncate(1).unwrap().as_slice(), &[1, 2, 3]);
        assert!(codes.truncate(3).is_err());
        assert!(Codes::from_stages(&[vec![1], vec![1, 2]]).is_err());

        let json = serde_json::to_string(&codes).unwrap();
        let back: Codes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, codes);
    }

    #[test]
    fn test_codes_json_is_checked() {
        let short = r#"{"n_q":2,"n_frames":3,"data":[1,2,3]}"#;
        let err = serde_json::from_str::<Codes>(short).unwrap_err();
        assert!(err.to_string().contains("do not form 2 stages of 3 frames"), "{err}");

        let huge = r#"{"n_q":18446744073709551615,"n_frames":2,"data":[]}"#;
        assert!(serde_json::from_str::<Codes>(huge).is_err());

        let ok: Codes = serde_json::from_str(r#"{"n_q":2,"n_frames":1,"data":[3,1]}"#).unwrap();
        assert_eq!(ok.stage(1), &[1]);
    }

    #[test]
    fn test_encode_frames_without_frames() {
        let rvq = random_rvq(2, 4, 3);
        let mut codes = vec![7, 7];
        rvq.encode_frames(&mut [], 2, &mut codes).unwrap();
        assert!(codes.is_empty());
    }
}
