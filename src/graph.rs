//! Graph planning and per-context scratch buffers
//!
//! Before a call touches any tensor, [`GraphPlan`] derives the shape of
//! every stage output from the hyperparameters and the input length. The
//! encoder, quantizer and decoder report each intermediate to a
//! [`StageObserver`]; the [`ShapeCursor`] observer walks the plan alongside
//! and fails the call on the first disagreement.

use std::fmt;

use candle_core::{Storage, Tensor};

use crate::error::{EncodecError, Result};
use crate::models::config::Hyperparameters;

/// One planned intermediate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub name: String,
    pub shape: Vec<usize>,
}

impl GraphNode {
    fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

impl fmt::Display for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.name, self.shape)
    }
}

/// Node names shared by the plan and the stages that report to it.
pub mod nodes {
    pub const ENCODER_INIT: &str = "encoder.init_conv";
    pub const ENCODER_LSTM: &str = "encoder.lstm";
    pub const ENCODER_FINAL: &str = "encoder.final_conv";
    pub const CODES: &str = "quantizer.codes";
    pub const DEQUANTIZED: &str = "quantizer.dequantized";
    pub const DECODER_INIT: &str = "decoder.init_conv";
    pub const DECODER_LSTM: &str = "decoder.lstm";
    pub const DECODER_FINAL: &str = "decoder.final_conv";

    pub fn encoder_residual(stage: usize) -> String {
        format!("encoder.stage{stage}.residual")
    }

    pub fn encoder_downsample(stage: usize) -> String {
        format!("encoder.stage{stage}.downsample")
    }

    pub fn decoder_upsample(stage: usize) -> String {
        format!("decoder.stage{stage}.upsample")
    }

    pub fn decoder_residual(stage: usize) -> String {
        format!("decoder.stage{stage}.residual")
    }
}

/// Which part of the pipeline a plan covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    /// Audio in, audio out
    Reconstruct,
    /// Audio in, codes out
    Encode,
    /// Codes in, audio out
    Decode,
}

/// Expected shape of every intermediate of one call.
#[derive(Debug, Clone)]
pub struct GraphPlan {
    kind: PlanKind,
    n_q: usize,
    n_frames: usize,
    n_samples: usize,
    nodes: Vec<GraphNode>,
}

impl GraphPlan {
    /// Plan a full reconstruction of `n_samples` with `n_q` stages.
    ///
    /// Fails with `InputShape` / `UnsupportedStageCount` before anything is
    /// allocated.
    pub fn new(hp: &Hyperparameters, n_samples: usize, n_q: usize) -> Result<Self> {
        let n_frames = hp.frames_for(n_samples)?;
        hp.check_stage_count(n_q)?;
        let mut nodes = encoder_nodes(hp, n_frames);
        nodes.extend(quantizer_nodes(hp, n_frames, n_q));
        nodes.extend(decoder_nodes(hp, n_frames));
        Ok(Self {
            kind: PlanKind::Reconstruct,
            n_q,
            n_frames,
            n_samples,
            nodes,
        })
    }

    /// Plan the analysis half: audio to codes.
    pub fn encode(hp: &Hyperparameters, n_samples: usize, n_q: usize) -> Result<Self> {
        let n_frames = hp.frames_for(n_samples)?;
        hp.check_stage_count(n_q)?;
        let mut nodes = encoder_nodes(hp, n_frames);
        nodes.push(GraphNode::new(nodes::CODES, vec![n_q, n_frames]));
        Ok(Self {
            kind: PlanKind::Encode,
            n_q,
            n_frames,
            n_samples,
            nodes,
        })
    }

    /// Plan the synthesis half: `n_frames` of `n_q`-stage codes to audio.
    pub fn decode(hp: &Hyperparameters, n_frames: usize, n_q: usize) -> Result<Self> {
        if n_frames == 0 {
            return Err(EncodecError::InputShape("codes are empty".to_string()));
        }
        hp.check_stage_count(n_q)?;
        let mut nodes = vec![GraphNode::new(nodes::DEQUANTIZED, vec![1, hp.hidden_dim, n_frames])];
        nodes.extend(decoder_nodes(hp, n_frames));
        Ok(Self {
            kind: PlanKind::Decode,
            n_q,
            n_frames,
            n_samples: n_frames * hp.compression_factor(),
            nodes,
        })
    }

    pub fn kind(&self) -> PlanKind {
        self.kind
    }

    pub fn n_q(&self) -> usize {
        self.n_q
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    /// Audio length at the input (encode, reconstruct) or output (decode).
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Number of samples the decoder produces.
    pub fn output_len(&self) -> usize {
        match self.kind {
            PlanKind::Encode => 0,
            _ => self.n_samples - crate::models::codec::DECODER_TRIM,
        }
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Largest live activation footprint, counting one stage's input and
    /// output together.
    pub fn peak_bytes(&self) -> usize {
        let sizes: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| n.numel() * std::mem::size_of::<f32>())
            .collect();
        sizes
            .windows(2)
            .map(|w| w[0] + w[1])
            .chain(sizes.first().copied())
            .max()
            .unwrap_or(0)
    }

    /// Observer that checks stage outputs against this plan in order.
    pub fn cursor(&self) -> ShapeCursor<'_> {
        ShapeCursor {
            nodes: &self.nodes,
            next: 0,
        }
    }
}

fn encoder_nodes(hp: &Hyperparameters, n_frames: usize) -> Vec<GraphNode> {
    let mut len = n_frames * hp.compression_factor();
    let mut out = vec![GraphNode::new(nodes::ENCODER_INIT, vec![1, hp.n_filters, len])];
    for (i, ratio) in hp.encoder_ratios().enumerate() {
        let width = hp.encoder_stage_width(i);
        out.push(GraphNode::new(nodes::encoder_residual(i), vec![1, width, len]));
        len /= ratio;
        out.push(GraphNode::new(
            nodes::encoder_downsample(i),
            vec![1, 2 * width, len],
        ));
    }
    out.push(GraphNode::new(nodes::ENCODER_LSTM, vec![1, hp.lstm_dim(), len]));
    out.push(GraphNode::new(nodes::ENCODER_FINAL, vec![1, hp.hidden_dim, len]));
    out
}

fn quantizer_nodes(hp: &Hyperparameters, n_frames: usize, n_q: usize) -> Vec<GraphNode> {
    vec![
        GraphNode::new(nodes::CODES, vec![n_q, n_frames]),
        GraphNode::new(nodes::DEQUANTIZED, vec![1, hp.hidden_dim, n_frames]),
    ]
}

fn decoder_nodes(hp: &Hyperparameters, n_frames: usize) -> Vec<GraphNode> {
    let mut len = n_frames;
    let mut out = vec![
        GraphNode::new(nodes::DECODER_INIT, vec![1, hp.lstm_dim(), len]),
        GraphNode::new(nodes::DECODER_LSTM, vec![1, hp.lstm_dim(), len]),
    ];
    for (i, ratio) in hp.decoder_ratios().enumerate() {
        let width = hp.decoder_stage_width(i) / 2;
        len *= ratio;
        out.push(GraphNode::new(nodes::decoder_upsample(i), vec![1, width, len]));
        out.push(GraphNode::new(nodes::decoder_residual(i), vec![1, width, len]));
    }
    out.push(GraphNode::new(
        nodes::DECODER_FINAL,
        vec![1, hp.in_channels, len - crate::models::codec::DECODER_TRIM],
    ));
    out
}

/// Receives the shape of every stage output as the graph executes.
pub trait StageObserver {
    fn observe(&mut self, node: &str, dims: &[usize]) -> Result<()>;
}

/// Unchecked execution.
impl StageObserver for () {
    fn observe(&mut self, _node: &str, _dims: &[usize]) -> Result<()> {
        Ok(())
    }
}

/// Walks a [`GraphPlan`] in execution order.
pub struct ShapeCursor<'a> {
    nodes: &'a [GraphNode],
    next: usize,
}

impl ShapeCursor<'_> {
    /// Number of nodes checked so far.
    pub fn visited(&self) -> usize {
        self.next
    }

    /// Fail unless every planned node was reported.
    pub fn finish(self) -> Result<()> {
        match self.nodes.get(self.next) {
            None => Ok(()),
            Some(missing) => Err(EncodecError::graph(
                format!("{} (never produced)", missing.name),
                &missing.shape,
                &[],
            )),
        }
    }
}

impl StageObserver for ShapeCursor<'_> {
    fn observe(&mut self, node: &str, dims: &[usize]) -> Result<()> {
        let Some(expected) = self.nodes.get(self.next) else {
            return Err(EncodecError::graph(format!("{node} (unplanned)"), &[], dims));
        };
        if expected.name != node {
            return Err(EncodecError::graph(
                format!("{node} (planned {})", expected.name),
                &expected.shape,
                dims,
            ));
        }
        if expected.shape != dims {
            return Err(EncodecError::graph(node, &expected.shape, dims));
        }
        tracing::trace!(node, ?dims, "shape ok");
        self.next += 1;
        Ok(())
    }
}

/// Host buffers reused across calls on one context.
///
/// `frames` holds the frame-major latent and then the quantizer residual,
/// `codes` the stage-major indices and `audio` the decoded samples. Codes and
/// audio are lent out with `take_*` and come back through `restore_*` when
/// the caller does not keep them; a buffer that leaves for good is regrown by
/// the next [`ScratchPool::reserve`]. Nothing is shrunk implicitly;
/// [`ScratchPool::release`] drops everything.
#[derive(Debug, Default)]
pub struct ScratchPool {
    frames: Vec<f32>,
    codes: Vec<u32>,
    audio: Vec<f32>,
}

impl ScratchPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grow the buffers `plan` touches.
    pub fn reserve(&mut self, plan: &GraphPlan, hidden_dim: usize) {
        if plan.kind() != PlanKind::Decode {
            reserve_total(&mut self.frames, hidden_dim * plan.n_frames());
            reserve_total(&mut self.codes, plan.n_q() * plan.n_frames());
        }
        reserve_total(&mut self.audio, plan.output_len());
    }

    /// Latent and code buffers, both cleared, for the quantizer.
    pub fn quantizer_buffers(&mut self) -> (&mut Vec<f32>, &mut Vec<u32>) {
        self.frames.clear();
        self.codes.clear();
        (&mut self.frames, &mut self.codes)
    }

    /// Hand the code buffer over, contents included.
    pub fn take_codes(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.codes)
    }

    /// Give a code buffer back, keeping whichever is larger.
    pub fn restore_codes(&mut self, codes: Vec<u32>) {
        restore(&mut self.codes, codes);
    }

    /// Hand the audio buffer over, cleared.
    pub fn take_audio(&mut self) -> Vec<f32> {
        let mut audio = std::mem::take(&mut self.audio);
        audio.clear();
        audio
    }

    /// Give an audio buffer back, keeping whichever is larger.
    pub fn restore_audio(&mut self, audio: Vec<f32>) {
        restore(&mut self.audio, audio);
    }

    /// Bytes currently held on the host.
    pub fn capacity_bytes(&self) -> usize {
        self.frames.capacity() * std::mem::size_of::<f32>()
            + self.codes.capacity() * std::mem::size_of::<u32>()
            + self.audio.capacity() * std::mem::size_of::<f32>()
    }

    /// Drop all buffers.
    pub fn release(&mut self) {
        *self = Self::default();
    }
}

fn reserve_total<T>(buf: &mut Vec<T>, total: usize) {
    if buf.capacity() < total {
        buf.reserve_exact(total - buf.len());
    }
}

fn restore<T>(slot: &mut Vec<T>, mut buf: Vec<T>) {
    if buf.capacity() > slot.capacity() {
        buf.clear();
        *slot = buf;
    }
}

/// Append the elements of `t` to `out` in row-major order.
///
/// Contiguous CPU tensors are copied straight out of their storage; anything
/// else goes through `to_vec1`.
pub(crate) fn copy_to_host(t: &Tensor, out: &mut Vec<f32>) -> Result<()> {
    {
        let (storage, layout) = t.storage_and_layout();
        if let (Storage::Cpu(cpu), Some((start, end))) = (&*storage, layout.contiguous_offsets()) {
            out.extend_from_slice(&cpu.as_slice::<f32>()?[start..end]);
            return Ok(());
        }
    }
    out.extend(t.flatten_all()?.to_vec1::<f32>()?);
    Ok(())
}
