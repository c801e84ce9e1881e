//! EnCodec building blocks
//!
//! Causal convolutions, residual blocks and the LSTM stack are shared by the
//! SEANet encoder and decoder; the residual vector quantizer sits between
//! them.

pub mod causal_conv;
pub mod causal_trans_conv;
pub mod decoder;
pub mod encoder;
pub mod lstm;
pub mod quantizer;
pub mod resnet_block;

pub use causal_conv::CausalConv1d;
pub use causal_trans_conv::CausalTransConv1d;
pub use decoder::{Decoder, DecoderStage, DECODER_TRIM};
pub use encoder::{Encoder, EncoderStage};
pub use lstm::{LstmLayer, RecurrentModel};
pub use quantizer::{Codes, ResidualVectorQuantizer, VectorQuantizer};
pub use resnet_block::ResidualBlock;
