use candle_core::{Result, Tensor};
use candle_nn::{Dropout, LayerNorm, Linear, Module, VarBuilder};

use crate::{attention::MultiHeadAttention, config::MultimodalConfig, positional};

const LAYER_NORM_EPS: f64 = 1e-5;
const FF_EXPANSION: usize = 4;

/// Pre-norm encoder layer. When a memory sequence is supplied the layer
/// attends from the query modality into the memory modality.
#[derive(Debug)]
pub struct EncoderLayer {
    attn_norm: LayerNorm,
    attention: MultiHeadAttention,
    ffn_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    relu_dropout: Dropout,
    res_dropout: Dropout,
}

impl EncoderLayer {
    pub fn new(config: &MultimodalConfig, vb: VarBuilder) -> Result<Self> {
        let d_model = config.d_model;
        let inner = FF_EXPANSION * d_model;
        Ok(Self {
            attn_norm: candle_nn::layer_norm(d_model, LAYER_NORM_EPS, vb.pp("attn_norm"))?,
            attention: MultiHeadAttention::new(
                d_model,
                config.n_heads,
                config.attn_dropout,
                vb.pp("attention"),
            )?,
            ffn_norm: candle_nn::layer_norm(d_model, LAYER_NORM_EPS, vb.pp("ffn_norm"))?,
            fc1: candle_nn::linear(d_model, inner, vb.pp("fc1"))?,
            fc2: candle_nn::linear(inner, d_model, vb.pp("fc2"))?,
            relu_dropout: Dropout::new(config.relu_dropout),
            res_dropout: Dropout::new(config.res_dropout),
        })
    }

    pub fn forward(
        &self,
        hidden: &Tensor,
        memory: Option<&Tensor>,
        key_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let normed = self.attn_norm.forward(hidden)?;
        let attended = match memory {
            Some(memory) => {
                let memory = self.attn_norm.forward(memory)?;
                self.attention
                    .forward(&normed, &memory, &memory, key_mask, train)?
            }
            None => self
                .attention
                .forward(&normed, &normed, &normed, key_mask, train)?,
        };
        let attended = self.res_dropout.forward(&attended, train)?;
        let hidden = (hidden + attended)?;

        let normed = self.ffn_norm.forward(&hidden)?;
        let expanded = self.fc1.forward(&normed)?.relu()?;
        let expanded = self.relu_dropout.forward(&expanded, train)?;
        let projected = self.fc2.forward(&expanded)?;
        let projected = self.res_dropout.forward(&projected, train)?;
        hidden + projected
    }
}

/// Stack of encoder layers sharing position encoding and a final norm.
#[derive(Debug)]
pub struct CrossModalEncoder {
    layers: Vec<EncoderLayer>,
    final_norm: LayerNorm,
    emb_dropout: Dropout,
    embed_scale: f64,
}

impl CrossModalEncoder {
    pub fn new(config: &MultimodalConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.n_layers);
        for index in 0..config.n_layers {
            layers.push(EncoderLayer::new(config, vb.pp(format!("layers.{index}")))?);
        }
        Ok(Self {
            layers,
            final_norm: candle_nn::layer_norm(
                config.d_model,
                LAYER_NORM_EPS,
                vb.pp("final_norm"),
            )?,
            emb_dropout: Dropout::new(config.emb_dropout),
            embed_scale: (config.d_model as f64).sqrt(),
        })
    }

    fn embed(&self, sequence: &Tensor, train: bool) -> Result<Tensor> {
        let scaled = sequence.affine(self.embed_scale, 0.0)?;
        let positioned = positional::add_positions(&scaled)?;
        self.emb_dropout.forward(&positioned, train)
    }

    /// Encode `query` `(batch, q_len, d_model)`, optionally attending into
    /// `memory` `(batch, k_len, d_model)`. `key_mask` masks whichever
    /// sequence supplies the keys.
    pub fn forward(
        &self,
        query: &Tensor,
        memory: Option<&Tensor>,
        key_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let mut hidden = self.embed(query, train)?;
        let memory = memory.map(|m| self.embed(m, train)).transpose()?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, memory.as_ref(), key_mask, train)?;
        }
        self.final_norm.forward(&hidden)
    }
}
