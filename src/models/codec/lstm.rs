//! Recurrent temporal model
//!
//! A stack of unidirectional LSTM layers run along the time axis of a
//! `[batch, channels, time]` feature map, with a skip connection around the
//! stack (or around every layer, depending on the checkpoint). Hidden and
//! cell states start at zero on every call; nothing is carried between calls.
//!
//! The math is `candle_nn::LSTM`'s, but the input projection of each layer
//! is computed for all time steps with a single matmul and the two biases are
//! pre-summed; only the hidden-to-hidden product runs step by step.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::sigmoid;

use crate::error::Result;
use crate::models::config::RecurrentSkip;
use crate::models::layout::LstmLayerSpec;
use crate::models::weights::WeightStore;

/// One LSTM layer with PyTorch gate order (input, forget, cell, output).
pub struct LstmLayer {
    weight_ih: Tensor,
    weight_hh: Tensor,
    bias_ih: Tensor,
    bias_hh: Tensor,
    /// `weight_ih^T`, `[dim, 4 * dim]`
    w_ih_t: Tensor,
    /// `weight_hh^T`, `[dim, 4 * dim]`
    w_hh_t: Tensor,
    /// `bias_ih + bias_hh`
    bias: Tensor,
    hidden_dim: usize,
}

impl LstmLayer {
    pub fn load(store: &mut WeightStore, spec: &LstmLayerSpec) -> Result<Self> {
        let weight_ih = store.take(&spec.weight_ih.name, &spec.weight_ih.shape)?;
        let weight_hh = store.take(&spec.weight_hh.name, &spec.weight_hh.shape)?;
        let bias_ih = store.take(&spec.bias_ih.name, &spec.bias_ih.shape)?;
        let bias_hh = store.take(&spec.bias_hh.name, &spec.bias_hh.shape)?;
        Self::from_weights(weight_ih, weight_hh, bias_ih, bias_hh)
    }

    /// Weights are `[4 * hidden, input]` / `[4 * hidden, hidden]`, biases `[4 * hidden]`.
    pub fn from_weights(
        weight_ih: Tensor,
        weight_hh: Tensor,
        bias_ih: Tensor,
        bias_hh: Tensor,
    ) -> Result<Self> {
        let hidden_dim = weight_hh.dim(1)?;
        let w_ih_t = weight_ih.t()?.contiguous()?;
        let w_hh_t = weight_hh.t()?.contiguous()?;
        let bias = (&bias_ih + &bias_hh)?;
        Ok(Self {
            weight_ih,
            weight_hh,
            bias_ih,
            bias_hh,
            w_ih_t,
            w_hh_t,
            bias,
            hidden_dim,
        })
    }

    /// Run the layer over a sequence.
    ///
    /// Input shape: [seq_len, input_dim]
    /// Output shape: [seq_len, hidden_dim]
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let seq_len = xs.dim(0)?;
        let device = xs.device();

        let gates_x = xs.matmul(&self.w_ih_t)?.broadcast_add(&self.bias)?;

        let mut h = Tensor::zeros((1, self.hidden_dim), DType::F32, device)?;
        let mut c = Tensor::zeros((1, self.hidden_dim), DType::F32, device)?;
        let mut outputs = Vec::with_capacity(seq_len);

        for t in 0..seq_len {
            let gates = (gates_x.narrow(0, t, 1)? + h.matmul(&self.w_hh_t)?)?;
            let gates = gates.chunk(4, D::Minus1)?;
            let i = sigmoid(&gates[0])?;
            let f = sigmoid(&gates[1])?;
            let g = gates[2].tanh()?;
            let o = sigmoid(&gates[3])?;

            c = ((f * &c)? + (i * g)?)?;
            h = (o * c.tanh()?)?;
            outputs.push(h.clone());
        }

        Ok(Tensor::cat(&outputs, 0)?)
    }

    pub fn verify(&self, spec: &LstmLayerSpec) -> Result<()> {
        spec.weight_ih.verify(&self.weight_ih)?;
        spec.weight_hh.verify(&self.weight_hh)?;
        spec.bias_ih.verify(&self.bias_ih)?;
        spec.bias_hh.verify(&self.bias_hh)
    }
}

/// Stacked LSTM with a skip connection.
pub struct RecurrentModel {
    layers: Vec<LstmLayer>,
    skip: RecurrentSkip,
}

impl RecurrentModel {
    pub fn load(
        store: &mut WeightStore,
        specs: &[LstmLayerSpec],
        skip: RecurrentSkip,
    ) -> Result<Self> {
        let layers = specs
            .iter()
            .map(|spec| LstmLayer::load(store, spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(layers, skip))
    }

    pub fn new(layers: Vec<LstmLayer>, skip: RecurrentSkip) -> Self {
        Self { layers, skip }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Input/Output shape: [batch, channels, seq_len]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let batch = x.dim(0)?;
        let mut outputs = Vec::with_capacity(batch);
        for b in 0..batch {
            // [channels, time] -> [time, channels]
            let seq = x.get(b)?.t()?.contiguous()?;
            let out = self.forward_sequence(&seq)?;
            outputs.push(out.t()?);
        }
        Ok(Tensor::stack(&outputs, 0)?.contiguous()?)
    }

    fn forward_sequence(&self, seq: &Tensor) -> Result<Tensor> {
        match self.skip {
            RecurrentSkip::Stack => {
                let mut hidden = seq.clone();
                for layer in &self.layers {
                    hidden = layer.forward(&hidden)?;
                }
                Ok((hidden + seq)?)
            }
            RecurrentSkip::PerLayer => {
                let mut hidden = seq.clone();
                for layer in &self.layers {
                    hidden = (layer.forward(&hidden)? + &hidden)?;
                }
                Ok(hidden)
            }
        }
    }

    pub fn verify(&self, specs: &[LstmLayerSpec]) -> Result<()> {
        if specs.len() != self.layers.len() {
            return Err(crate::error::EncodecError::graph(
                "lstm.layers",
                &[specs.len()],
                &[self.layers.len()],
            ));
        }
        for (layer, spec) in self.layers.iter().zip(specs) {
            layer.verify(spec)?;
        }
        Ok(())
    }
}
