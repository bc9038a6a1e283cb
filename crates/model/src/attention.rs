//! Multi-head scaled dot-product attention with optional key padding masks.
//!
//! Queries and keys may come from different modalities, so the query and key
//! sequence lengths are independent. Masks use `(batch, k_len)` layout with
//! non-zero entries marking valid keys.

use candle_core::{bail, DType, Result, Tensor};
use candle_nn::{ops::softmax_last_dim, Dropout, Linear, Module, VarBuilder};

const MASK_FILL: f32 = -1e9;

#[derive(Debug)]
pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    n_heads: usize,
    head_dim: usize,
    scale: f64,
    dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(d_model: usize, n_heads: usize, dropout_p: f32, vb: VarBuilder) -> Result<Self> {
        if n_heads == 0 || d_model % n_heads != 0 {
            bail!("d_model ({d_model}) must be divisible by n_heads ({n_heads})");
        }
        let head_dim = d_model / n_heads;
        Ok(Self {
            q_proj: candle_nn::linear(d_model, d_model, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(d_model, d_model, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(d_model, d_model, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(d_model, d_model, vb.pp("out_proj"))?,
            n_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
            dropout: Dropout::new(dropout_p),
        })
    }

    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = tensor.dims3()?;
        tensor
            .reshape((batch, seq, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Attend `query` `(batch, q_len, d_model)` over `key`/`value`
    /// `(batch, k_len, d_model)`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, q_len, _) = query.dims3()?;
        let q = self.split_heads(&self.q_proj.forward(query)?)?;
        let k = self.split_heads(&self.k_proj.forward(key)?)?;
        let v = self.split_heads(&self.v_proj.forward(value)?)?;

        let scores = q.matmul(&k.t()?.contiguous()?)?.affine(self.scale, 0.0)?;
        let scores = match key_mask {
            Some(mask) => apply_key_mask(&scores, mask)?,
            None => scores,
        };

        let weights = softmax_last_dim(&scores)?;
        let weights = self.dropout.forward(&weights, train)?;
        let context = weights.matmul(&v)?;
        let merged = context
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_len, self.n_heads * self.head_dim))?;
        self.out_proj.forward(&merged)
    }
}

/// Replace scores of padded keys with a large negative value.
///
/// A fully padded row degrades to uniform attention instead of NaN.
fn apply_key_mask(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (batch, _heads, _q_len, k_len) = scores.dims4()?;
    let (mask_batch, mask_len) = mask.dims2()?;
    if mask_batch != batch || mask_len != k_len {
        bail!(
            "key mask expected [{batch}, {k_len}] got [{mask_batch}, {mask_len}]"
        );
    }
    let keep = mask
        .to_dtype(DType::U8)?
        .reshape((batch, 1, 1, k_len))?
        .broadcast_as(scores.shape())?;
    let fill = Tensor::full(MASK_FILL, scores.shape(), scores.device())?.to_dtype(scores.dtype())?;
    keep.where_cond(scores, &fill)
}
